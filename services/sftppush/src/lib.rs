//! Sftppush
//!
//! Archives files dropped on an SFTP server. Directories are watched for
//! completed writes; gzip files are decompressed on the fly, streamed to an
//! S3 bucket under a key mirroring their place below a configured root, and
//! removed locally once the store has acknowledged them.
//!
//! ## Features
//!
//! - **Write-complete detection**: only files whose writer has closed them
//!   enter the pipeline; tiny files are ignored
//! - **Streaming decompression**: gzip content is decoded lazily while it is
//!   uploaded, never buffered whole
//! - **Multipart uploads**: large content goes up in fixed-size parts under a
//!   per-upload time budget
//! - **Safe cleanup**: a source file is deleted only after its upload result
//!   has been received
//!
//! ## Architecture
//!
//! ```text
//! Watched dirs            Session                              S3 Bucket
//! ┌──────────────┐       ┌──────────────┐                    ┌──────────────┐
//! │ /home/user1/ │──────▶│ Directory    │                    │ user1/       │
//! │ /home/user2/ │       │ Watcher      │                    │   data.csv   │
//! └──────────────┘       └──────────────┘                    └──────────────┘
//!                               │                                   ▲
//!                               ▼                                   │
//!                        ┌──────────────┐      ┌──────────────┐     │
//!                        │ Classify +   │─────▶│ Uploader     │─────┘
//!                        │ Decompress   │      │ (bounded)    │
//!                        └──────────────┘      └──────────────┘
//!                                                     │
//!                                                     ▼
//!                                              ┌──────────────┐
//!                                              │ Janitor      │
//!                                              └──────────────┘
//! ```

pub mod classify;
pub mod config;
pub mod decompress;
pub mod event;
pub mod janitor;
pub mod paths;
pub mod pipeline;
pub mod uploader;
pub mod watcher;

pub use classify::{classify, ByteSource, Classified, ContentKind};
pub use config::{Config, ConfigError, SourceConfig};
pub use decompress::{decompress, DecompressError};
pub use event::{FileMeta, OperationKind, WatchEvent};
pub use paths::{compute_destination_key, resolve_absolute, DestinationRoot, PathError};
pub use pipeline::{
    PipelineCoordinator, PipelineSession, RunningSession, SessionConfig, SessionError,
    SessionSummary, UploadResult, UploadTask,
};
pub use uploader::{ObjectStore, S3Uploader, UploadError, UploadReceipt};
pub use watcher::{DirectoryWatcher, WatchError, MIN_FILE_SIZE};
