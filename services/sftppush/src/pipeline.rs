//! Watch session wiring.
//!
//! ```text
//! DirectoryWatcher ──events──▶ dispatcher ──spawn──▶ upload task (≤ concurrency)
//!                              classify                 │
//!                              decompress               ▼
//!                              destination key   ──results──▶ janitor
//! ```
//!
//! Every hand-off is a capacity-1 channel, so a slow stage holds back the
//! one before it. Failures are handled inside the stage that hit them; the
//! only thing that flows forward is a successful result.

use crate::classify::{classify, ByteSource, ContentKind};
use crate::decompress::decompress;
use crate::event::WatchEvent;
use crate::janitor;
use crate::paths::{resolve_absolute, DestinationRoot};
use crate::uploader::{ObjectStore, UploadError, UploadReceipt};
use crate::watcher::{DirectoryWatcher, WatchError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that end a whole session. Per-event failures never surface here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("No configured directory of session {0} lies below the destination root")]
    NothingToWatch(String),

    #[error("Session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Settings for one watch session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session name, used in logs
    pub name: String,
    /// Directories to watch (non-recursive)
    pub directories: Vec<PathBuf>,
    /// Destination bucket
    pub bucket: String,
    /// Root that object keys are relative to
    pub root: DestinationRoot,
    /// Time budget for a single upload
    pub upload_timeout: Duration,
    /// Simultaneous uploads
    pub upload_concurrency: usize,
}

/// Immutable per-session state shared by every stage.
///
/// Keys are never stored here; each event carries its own in its
/// [`UploadTask`].
pub struct PipelineSession {
    config: SessionConfig,
    store: Arc<dyn ObjectStore>,
}

impl PipelineSession {
    pub fn new(config: SessionConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

/// An event ready for upload, with its own key and decoded content.
pub struct UploadTask {
    pub event: WatchEvent,
    pub destination_key: String,
    pub content: ByteSource,
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("event", &self.event)
            .field("destination_key", &self.destination_key)
            .finish_non_exhaustive()
    }
}

/// A confirmed upload; the only thing that authorizes deleting the source.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub receipt: UploadReceipt,
    pub key: String,
    pub event: WatchEvent,
}

/// Terminal state of a single upload attempt.
#[derive(Debug, Error)]
pub enum UploadFailure {
    #[error("upload timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Store(#[from] UploadError),
}

/// Classify, decompress and key one event.
///
/// Returns `None` when the event is skipped or fails; the reason is logged and
/// the source file is left untouched.
#[instrument(skip_all, fields(path = %event.absolute_path.display()))]
pub async fn prepare(session: &PipelineSession, event: WatchEvent) -> Option<UploadTask> {
    let path = event.absolute_path.display().to_string();

    let classified = match classify(&event.absolute_path).await {
        Ok(classified) => classified,
        Err(e) => {
            count_drop("classify", "open_failed");
            warn!(stage = "classify", path = %path, error = %e, "Dropped event: cannot read file");
            return None;
        }
    };

    match classified.kind {
        ContentKind::Gzip => {
            debug!(stage = "classify", path = %path, mime = classified.mime, "Detected gzip");
        }
        ContentKind::Zip => {
            count_drop("classify", "unsupported_zip");
            warn!(
                stage = "classify",
                path = %path,
                mime = classified.mime,
                "Dropped event: unsupported type (zip archives are not handled)"
            );
            return None;
        }
        ContentKind::Unrecognized => {
            count_drop("classify", "unsupported_type");
            warn!(
                stage = "classify",
                path = %path,
                mime = classified.mime,
                "Dropped event: unsupported type"
            );
            return None;
        }
    }

    let destination_key = match session.config.root.destination_key(&event.absolute_path) {
        Ok(key) => key,
        Err(e) => {
            count_drop("classify", "no_destination_key");
            error!(stage = "classify", path = %path, error = %e, "Dropped event: no destination key");
            return None;
        }
    };

    let content = match decompress(classified).await {
        Ok(content) => content,
        Err(e) => {
            count_drop("decompress", "decoder_failed");
            error!(
                stage = "decompress",
                path = %path,
                error = %e,
                "Dropped event: decompression failed, file left in place"
            );
            return None;
        }
    };

    Some(UploadTask {
        event,
        destination_key,
        content,
    })
}

/// Upload `content` within `budget`. An expired budget abandons the attempt.
pub async fn upload_with_budget(
    store: &dyn ObjectStore,
    content: ByteSource,
    bucket: &str,
    key: &str,
    budget: Duration,
) -> Result<UploadReceipt, UploadFailure> {
    match tokio::time::timeout(budget, store.upload(content, bucket, key)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(UploadFailure::TimedOut(budget)),
    }
}

/// Upload one task and, on success, hand the result to the janitor.
async fn upload_stage(
    session: Arc<PipelineSession>,
    task: UploadTask,
    results: mpsc::Sender<UploadResult>,
) {
    let UploadTask {
        event,
        destination_key,
        content,
    } = task;
    let path = event.absolute_path.display().to_string();
    let started = Instant::now();

    let outcome = upload_with_budget(
        session.store.as_ref(),
        content,
        &session.config.bucket,
        &destination_key,
        session.config.upload_timeout,
    )
    .await;

    metrics::histogram!("sftppush.upload.duration_seconds").record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(receipt) => {
            metrics::counter!("sftppush.uploads.completed").increment(1);
            metrics::counter!("sftppush.bytes.uploaded").increment(receipt.bytes);
            info!(
                stage = "upload",
                path = %path,
                bucket = %session.config.bucket,
                key = %destination_key,
                bytes = receipt.bytes,
                parts = receipt.parts,
                outcome = "uploaded",
                "Upload complete"
            );

            let result = UploadResult {
                receipt,
                key: destination_key,
                event,
            };
            if results.send(result).await.is_err() {
                error!(stage = "upload", path = %path, "Janitor stopped; source file kept");
            }
        }
        Err(UploadFailure::TimedOut(budget)) => {
            count_drop("upload", "timed_out");
            warn!(
                stage = "upload",
                path = %path,
                key = %destination_key,
                budget_secs = budget.as_secs_f64(),
                outcome = "timed_out",
                "Dropped event: upload timed out, file left in place"
            );
        }
        Err(e) => {
            count_drop("upload", "store_failed");
            warn!(
                stage = "upload",
                path = %path,
                key = %destination_key,
                error = %e,
                outcome = "failed",
                "Dropped event: upload failed, file left in place"
            );
        }
    }
}

fn count_drop(stage: &'static str, reason: &'static str) {
    metrics::counter!("sftppush.events.dropped", "stage" => stage, "reason" => reason).increment(1);
}

/// Receive events, prepare them one at a time and fan uploads out under the
/// session's concurrency limit. Drains in-flight uploads before returning.
async fn dispatch(
    session: Arc<PipelineSession>,
    mut events: mpsc::Receiver<WatchEvent>,
    results: mpsc::Sender<UploadResult>,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(session.config.upload_concurrency));
    let mut uploads = JoinSet::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = uploads.join_next(), if !uploads.is_empty() => {
                if let Err(e) = finished {
                    error!(stage = "upload", error = %e, "Upload task failed");
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        metrics::counter!("sftppush.events.received").increment(1);

        let Some(task) = prepare(&session, event).await else {
            continue;
        };

        // Waiting here holds the watcher back while uploads are saturated
        let permit = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(
                    stage = "upload",
                    path = %task.event.absolute_path.display(),
                    "Shutdown before upload started; file left in place"
                );
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let session = session.clone();
        let results = results.clone();
        uploads.spawn(async move {
            let _permit = permit;
            upload_stage(session, task, results).await;
        });
    }

    if !uploads.is_empty() {
        info!(in_flight = uploads.len(), "Draining in-flight uploads");
    }
    while let Some(finished) = uploads.join_next().await {
        if let Err(e) = finished {
            error!(stage = "upload", error = %e, "Upload task failed");
        }
    }
}

/// Owns the lifecycle of one watch session.
pub struct PipelineCoordinator {
    session: Arc<PipelineSession>,
}

impl PipelineCoordinator {
    pub fn new(config: SessionConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            session: Arc::new(PipelineSession::new(config, store)),
        }
    }

    /// Subscribe to the session's directories and start every stage.
    ///
    /// Directories whose files could not be keyed below the destination root
    /// are rejected up front. Returns once the watch is active.
    pub fn start(self, shutdown: CancellationToken) -> Result<RunningSession, SessionError> {
        let config = self.session.config();
        let name = config.name.clone();

        let directories = watchable_directories(config);
        if directories.is_empty() {
            return Err(SessionError::NothingToWatch(name));
        }

        let watcher = DirectoryWatcher::start(&directories)?;

        let (event_tx, event_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(1);

        let watcher_handle = tokio::spawn(watcher.run(event_tx, shutdown.clone()));
        let dispatcher_handle = tokio::spawn(dispatch(
            self.session.clone(),
            event_rx,
            result_tx,
            shutdown.clone(),
        ));
        let janitor_handle = tokio::spawn(janitor::run(result_rx));

        info!(
            session = %name,
            bucket = %config.bucket,
            directories = directories.len(),
            "Watch session started"
        );

        Ok(RunningSession {
            name,
            shutdown,
            watcher: watcher_handle,
            dispatcher: dispatcher_handle,
            janitor: janitor_handle,
        })
    }

    /// Start the session and run it until `shutdown` fires and it has drained.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SessionSummary, SessionError> {
        self.start(shutdown)?.wait().await
    }
}

/// Absolute forms of the configured directories that lie below the root.
///
/// Relative entries resolve against the working directory, as event paths do.
fn watchable_directories(config: &SessionConfig) -> Vec<PathBuf> {
    config
        .directories
        .iter()
        .filter_map(|dir| match resolve_absolute(dir) {
            Ok(absolute) => Some(absolute),
            Err(e) => {
                error!(
                    session = %config.name,
                    path = %dir.display(),
                    error = %e,
                    "Cannot resolve directory; not watching it"
                );
                None
            }
        })
        .filter(|dir| {
            let covered = config.root.covers_directory(dir);
            if !covered {
                error!(
                    session = %config.name,
                    path = %dir.display(),
                    root = config.root.as_str(),
                    "Directory lies outside the destination root; not watching it"
                );
            }
            covered
        })
        .collect()
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub files_removed: usize,
}

/// Handle to a started session.
pub struct RunningSession {
    name: String,
    shutdown: CancellationToken,
    watcher: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    janitor: JoinHandle<usize>,
}

impl RunningSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request shutdown and wait for the session to drain.
    pub async fn shutdown(self) -> Result<SessionSummary, SessionError> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait for the session to end. Stages stop accepting new events once the
    /// shutdown token fires; uploads already running finish first, then the
    /// janitor processes their results.
    pub async fn wait(self) -> Result<SessionSummary, SessionError> {
        self.watcher.await?;
        self.dispatcher.await?;
        let files_removed = self.janitor.await?;

        info!(session = %self.name, files_removed, "Watch session stopped");

        Ok(SessionSummary { files_removed })
    }
}
