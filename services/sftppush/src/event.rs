//! Normalized filesystem events and the metadata probe used to build them.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Raw notification kind, kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Write,
    Create,
    Remove,
    Rename,
    CloseWrite,
    Other,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Write => "WRITE",
            OperationKind::Create => "CREATE",
            OperationKind::Remove => "REMOVE",
            OperationKind::Rename => "RENAME",
            OperationKind::CloseWrite => "CLOSE_WRITE",
            OperationKind::Other => "OTHER",
        }
    }

    /// Only a writer closing the file means the content is complete.
    pub fn is_write_complete(&self) -> bool {
        matches!(self, OperationKind::CloseWrite)
    }
}

impl From<&EventKind> for OperationKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => OperationKind::CloseWrite,
            EventKind::Create(_) => OperationKind::Create,
            EventKind::Remove(_) => OperationKind::Remove,
            EventKind::Modify(ModifyKind::Name(_)) => OperationKind::Rename,
            EventKind::Modify(_) => OperationKind::Write,
            _ => OperationKind::Other,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File metadata captured right after a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    /// Modification time, truncated to milliseconds
    pub mod_time: DateTime<Utc>,
    /// Unix permission and type bits (0 where unsupported)
    pub mode: u32,
    /// Base name of the file
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// A write-close occurrence on a watched file.
///
/// Built once by the watcher and never mutated; each stage takes it by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    /// Fully resolved path of the affected file
    pub absolute_path: PathBuf,
    /// Notification kind that produced this event
    pub operation: OperationKind,
    #[serde(flatten)]
    pub meta: FileMeta,
}

impl WatchEvent {
    pub fn new(absolute_path: PathBuf, operation: OperationKind, meta: FileMeta) -> Self {
        Self {
            absolute_path,
            operation,
            meta,
        }
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

/// Stat `path`, propagating the OS error unchanged when it is missing or
/// inaccessible.
pub async fn stat(path: &Path) -> std::io::Result<FileMeta> {
    let metadata = tokio::fs::metadata(path).await?;

    let modified: DateTime<Utc> = metadata.modified()?.into();
    let mod_time = modified
        .duration_trunc(TimeDelta::milliseconds(1))
        .unwrap_or(modified);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(FileMeta {
        mod_time,
        mode: file_mode(&metadata),
        name,
        size: metadata.len(),
    })
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0
}
