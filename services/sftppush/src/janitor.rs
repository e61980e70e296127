//! Source-file cleanup after a confirmed upload.

use crate::event::WatchEvent;
use crate::pipeline::UploadResult;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Delete the file behind `event`.
pub async fn remove(event: &WatchEvent) -> std::io::Result<()> {
    tokio::fs::remove_file(&event.absolute_path).await
}

/// Consume upload results and delete each uploaded source file.
///
/// A result only exists once the store acknowledged the object, so deletion
/// can never run ahead of its upload. Failures are logged and not retried.
/// Returns the number of files removed once the result channel closes.
pub async fn run(mut results: mpsc::Receiver<UploadResult>) -> usize {
    let mut removed = 0;

    while let Some(result) = results.recv().await {
        let path = result.event.absolute_path.display().to_string();

        match remove(&result.event).await {
            Ok(()) => {
                removed += 1;
                metrics::counter!("sftppush.files.removed").increment(1);
                info!(
                    stage = "cleanup",
                    path = %path,
                    key = %result.key,
                    e_tag = result.receipt.e_tag.as_deref().unwrap_or(""),
                    outcome = "removed",
                    "Source file removed after upload"
                );
            }
            Err(e) => {
                metrics::counter!("sftppush.files.remove_failed").increment(1);
                error!(
                    stage = "cleanup",
                    path = %path,
                    key = %result.key,
                    error = %e,
                    outcome = "remove_failed",
                    "Failed to remove uploaded source file"
                );
            }
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{stat, OperationKind};
    use crate::uploader::UploadReceipt;

    async fn event_for(path: &std::path::Path) -> WatchEvent {
        let meta = stat(path).await.unwrap();
        WatchEvent::new(path.to_path_buf(), OperationKind::CloseWrite, meta)
    }

    #[tokio::test]
    async fn test_remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.gz");
        std::fs::write(&path, b"uploaded").unwrap();

        remove(&event_for(&path).await).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_run_removes_each_result_and_survives_failures() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.gz");
        let second = dir.path().join("second.gz");
        std::fs::write(&first, b"one").unwrap();
        std::fs::write(&second, b"two").unwrap();

        let first_event = event_for(&first).await;
        let second_event = event_for(&second).await;
        std::fs::remove_file(&first).unwrap();

        let (tx, rx) = mpsc::channel(1);
        let janitor = tokio::spawn(run(rx));

        for event in [first_event, second_event] {
            tx.send(UploadResult {
                receipt: UploadReceipt::default(),
                key: "user1/x".to_string(),
                event,
            })
            .await
            .unwrap();
        }
        drop(tx);

        assert_eq!(janitor.await.unwrap(), 1);
        assert!(!second.exists());
    }
}
