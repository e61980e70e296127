//! Directory watcher emitting normalized write-complete events.
//!
//! The `notify` callback thread hands raw events over a capacity-1 channel
//! with `blocking_send`. When the pipeline falls behind, that thread stalls
//! and the kernel notification queue absorbs (and eventually drops) the
//! overflow, so memory in this process stays bounded.

use crate::event::{stat, OperationKind, WatchEvent};
use crate::paths::{resolve_absolute, PathError};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Smallest file worth classifying.
pub const MIN_FILE_SIZE: u64 = 32;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("None of the {0} configured directories could be watched")]
    NoDirectories(usize),
}

/// Why a raw notification did not become a [`WatchEvent`].
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("not a write-complete notification ({0})")]
    NotWriteComplete(OperationKind),

    #[error("path could not be resolved: {0}")]
    Unresolvable(#[from] PathError),

    #[error("stat failed: {0}")]
    Stat(#[source] std::io::Error),

    #[error("file too small to classify ({0} bytes)")]
    TooSmall(u64),

    #[error("not a regular file")]
    NotAFile,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Rejection::NotWriteComplete(_) => "not_write_complete",
            Rejection::Unresolvable(_) => "unresolvable",
            Rejection::Stat(_) => "stat_failed",
            Rejection::TooSmall(_) => "too_small",
            Rejection::NotAFile => "not_a_file",
        }
    }
}

/// Watches a flat set of directories (subdirectories are not followed).
pub struct DirectoryWatcher {
    // Dropped before the watcher so a callback blocked on send is released.
    raw: mpsc::Receiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
    directories: Vec<PathBuf>,
}

impl DirectoryWatcher {
    /// Subscribe to every directory in `directories`.
    ///
    /// Directories that cannot be added are logged and skipped; the call only
    /// fails when the subscription cannot be created or nothing is watchable.
    pub fn start(directories: &[PathBuf]) -> Result<Self, WatchError> {
        let (tx, raw) = mpsc::channel(1);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if tx.blocking_send(res).is_err() {
                debug!("Watch receiver closed, discarding notification");
            }
        })
        .map_err(WatchError::Create)?;

        let mut watched = Vec::with_capacity(directories.len());
        for dir in directories {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(stage = "watch", path = %dir.display(), "Watching directory");
                    watched.push(dir.clone());
                }
                Err(e) => {
                    error!(
                        stage = "watch",
                        path = %dir.display(),
                        error = %e,
                        "Failed to watch directory"
                    );
                }
            }
        }

        if watched.is_empty() {
            return Err(WatchError::NoDirectories(directories.len()));
        }

        Ok(Self {
            raw,
            _watcher: watcher,
            directories: watched,
        })
    }

    /// Directories actually being watched.
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Forward admitted events to `out` until shutdown or until `out` closes.
    ///
    /// Subscription errors are logged and never end the loop.
    pub async fn run(mut self, out: mpsc::Sender<WatchEvent>, shutdown: CancellationToken) {
        loop {
            let raw = tokio::select! {
                _ = shutdown.cancelled() => break,
                raw = self.raw.recv() => raw,
            };

            let event = match raw {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    metrics::counter!("sftppush.watch.errors").increment(1);
                    error!(stage = "watch", error = %e, "Filesystem watch error");
                    continue;
                }
                None => break,
            };

            for watch_event in normalize(event).await {
                let sent = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = out.send(watch_event) => sent,
                };
                if sent.is_err() {
                    warn!(stage = "watch", "Event receiver closed, stopping watcher");
                    return;
                }
            }
        }

        info!(stage = "watch", "Directory watcher stopped");
    }
}

/// Turn one raw notification into the events worth forwarding, logging the
/// rest.
pub async fn normalize(event: Event) -> Vec<WatchEvent> {
    let operation = OperationKind::from(&event.kind);
    let mut admitted = Vec::with_capacity(event.paths.len());

    for raw_path in &event.paths {
        match admit(raw_path, operation).await {
            Ok(watch_event) => {
                metrics::counter!("sftppush.events.admitted").increment(1);
                debug!(
                    stage = "watch",
                    path = %watch_event.absolute_path.display(),
                    size = watch_event.size(),
                    "Write-complete event"
                );
                admitted.push(watch_event);
            }
            Err(Rejection::NotWriteComplete(_)) => {}
            Err(rejection) => {
                metrics::counter!("sftppush.events.dropped", "stage" => "watch", "reason" => rejection.reason())
                    .increment(1);
                warn!(
                    stage = "watch",
                    path = %raw_path.display(),
                    operation = %operation,
                    reason = rejection.reason(),
                    "Dropped event: {rejection}"
                );
            }
        }
    }

    admitted
}

/// Resolve and stat a single path, applying the write-complete and
/// minimum-size gates.
pub async fn admit(raw_path: &Path, operation: OperationKind) -> Result<WatchEvent, Rejection> {
    if !operation.is_write_complete() {
        return Err(Rejection::NotWriteComplete(operation));
    }

    let absolute_path = resolve_absolute(raw_path)?;
    let meta = stat(&absolute_path).await.map_err(Rejection::Stat)?;
    let event = WatchEvent::new(absolute_path, operation, meta);

    if !is_regular_file(event.meta.mode) {
        return Err(Rejection::NotAFile);
    }

    if event.size() < MIN_FILE_SIZE {
        if let Ok(json) = serde_json::to_string(&event) {
            debug!(stage = "watch", event = %json, "Too small to classify");
        }
        return Err(Rejection::TooSmall(event.size()));
    }

    Ok(event)
}

#[cfg(unix)]
fn is_regular_file(mode: u32) -> bool {
    const S_IFMT: u32 = 0o170000;
    const S_IFREG: u32 = 0o100000;
    mode & S_IFMT == S_IFREG
}

#[cfg(not(unix))]
fn is_regular_file(_mode: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, AccessMode, CreateKind, EventKind};

    fn close_write(path: &Path) -> Event {
        Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write))).add_path(path.to_path_buf())
    }

    #[tokio::test]
    async fn test_admits_close_write_of_large_enough_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv.gz");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let events = normalize(close_write(&path)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].absolute_path, path);
        assert_eq!(events[0].operation, OperationKind::CloseWrite);
        assert_eq!(events[0].size(), 64);
        assert_eq!(events[0].name(), "data.csv.gz");
    }

    #[tokio::test]
    async fn test_small_file_is_never_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gz");
        std::fs::write(&path, b"0123456789").unwrap();

        assert!(normalize(close_write(&path)).await.is_empty());
        assert!(matches!(
            admit(&path, OperationKind::CloseWrite).await,
            Err(Rejection::TooSmall(10))
        ));
    }

    #[tokio::test]
    async fn test_exactly_minimum_size_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.gz");
        std::fs::write(&path, vec![b'x'; MIN_FILE_SIZE as usize]).unwrap();

        assert!(admit(&path, OperationKind::CloseWrite).await.is_ok());
    }

    #[tokio::test]
    async fn test_other_operations_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.gz");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        assert!(normalize(create).await.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_file_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.gz");

        assert!(normalize(close_write(&path)).await.is_empty());
        assert!(matches!(
            admit(&path, OperationKind::CloseWrite).await,
            Err(Rejection::Stat(_))
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_no_directory_is_watchable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = vec![dir.path().join("missing-a"), dir.path().join("missing-b")];

        assert!(matches!(
            DirectoryWatcher::start(&missing),
            Err(WatchError::NoDirectories(2))
        ));
    }

    #[tokio::test]
    async fn test_start_skips_unwatchable_directories() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = vec![dir.path().to_path_buf(), dir.path().join("missing")];

        let watcher = DirectoryWatcher::start(&dirs).unwrap();
        assert_eq!(watcher.directories(), &[dir.path().to_path_buf()]);
    }
}
