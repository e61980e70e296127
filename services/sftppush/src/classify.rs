//! Content-type detection on the leading bytes of a file.
//!
//! The sniffed prefix is stitched back in front of the rest of the file so
//! the downstream consumer still sees every byte.

use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes inspected for classification.
pub const SNIFF_LEN: usize = 512;

/// Owned byte source handed from stage to stage.
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

pub const MIME_GZIP: &str = "application/x-gzip";
pub const MIME_ZIP: &str = "application/zip";
const MIME_PDF: &str = "application/pdf";
const MIME_PNG: &str = "image/png";
const MIME_JPEG: &str = "image/jpeg";
const MIME_GIF: &str = "image/gif";
const MIME_TEXT: &str = "text/plain; charset=utf-8";
const MIME_BINARY: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read prefix of {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// What the pipeline does with a file, decided from its sniffed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Gzip,
    Zip,
    Unrecognized,
}

impl ContentKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            MIME_GZIP => ContentKind::Gzip,
            MIME_ZIP => ContentKind::Zip,
            _ => ContentKind::Unrecognized,
        }
    }
}

/// A classified file: its detected type plus a stream over all of its bytes.
pub struct Classified {
    pub kind: ContentKind,
    pub mime: &'static str,
    pub stream: ByteSource,
}

impl std::fmt::Debug for Classified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classified")
            .field("kind", &self.kind)
            .field("mime", &self.mime)
            .finish_non_exhaustive()
    }
}

/// Detect a content type from leading bytes.
pub fn sniff(data: &[u8]) -> &'static str {
    // gzip: 1F 8B, deflate method 08
    if data.starts_with(&[0x1F, 0x8B, 0x08]) {
        return MIME_GZIP;
    }

    // zip: local file header, empty archive, spanned archive
    if data.starts_with(b"PK\x03\x04")
        || data.starts_with(b"PK\x05\x06")
        || data.starts_with(b"PK\x07\x08")
    {
        return MIME_ZIP;
    }

    if data.starts_with(b"%PDF-") {
        return MIME_PDF;
    }

    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return MIME_PNG;
    }

    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return MIME_JPEG;
    }

    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return MIME_GIF;
    }

    if looks_like_text(data) {
        MIME_TEXT
    } else {
        MIME_BINARY
    }
}

fn looks_like_text(data: &[u8]) -> bool {
    !data
        .iter()
        .any(|&b| b <= 0x08 || b == 0x0B || (0x0E..=0x1A).contains(&b) || (0x1C..=0x1F).contains(&b))
}

/// Open `path`, sniff up to [`SNIFF_LEN`] bytes and return the type along
/// with a stream yielding the prefix followed by the remainder of the file.
pub async fn classify(path: &Path) -> Result<Classified, ClassifyError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| ClassifyError::Open {
            path: path.display().to_string(),
            source,
        })?;

    // read_to_end on the bounded reader keeps reading through short reads
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    (&mut file)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut prefix)
        .await
        .map_err(|source| ClassifyError::Read {
            path: path.display().to_string(),
            source,
        })?;

    let mime = sniff(&prefix);
    let stream: ByteSource = Box::pin(Cursor::new(prefix).chain(file));

    Ok(Classified {
        kind: ContentKind::from_mime(mime),
        mime,
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_gzip() {
        let data = [0x1F, 0x8B, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF];
        assert_eq!(sniff(&data), MIME_GZIP);
        assert_eq!(ContentKind::from_mime(sniff(&data)), ContentKind::Gzip);
    }

    #[test]
    fn test_sniff_zip() {
        assert_eq!(sniff(b"PK\x03\x04\x14\x00\x00\x00"), MIME_ZIP);
        assert_eq!(sniff(b"PK\x05\x06\x00\x00"), MIME_ZIP);
        assert_eq!(ContentKind::from_mime(MIME_ZIP), ContentKind::Zip);
    }

    #[test]
    fn test_sniff_other_types_are_unrecognized() {
        assert_eq!(sniff(b"%PDF-1.7\n"), MIME_PDF);
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), MIME_JPEG);
        assert_eq!(sniff(b"id,name\n1,alice\n"), MIME_TEXT);
        assert_eq!(sniff(&[0x00, 0x01, 0x02, 0x03]), MIME_BINARY);
        // bzip2 is not handled
        assert_eq!(
            ContentKind::from_mime(sniff(b"BZh91AY&SY\x00\x01")),
            ContentKind::Unrecognized
        );
    }

    #[test]
    fn test_sniff_empty_is_text() {
        assert_eq!(sniff(&[]), MIME_TEXT);
    }

    #[tokio::test]
    async fn test_classified_stream_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let original: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &original).unwrap();

        let mut classified = classify(&path).await.unwrap();
        let mut read_back = Vec::new();
        classified.stream.read_to_end(&mut read_back).await.unwrap();

        assert_eq!(read_back, original);
    }

    #[tokio::test]
    async fn test_classified_stream_for_file_shorter_than_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.txt");
        std::fs::write(&path, b"0123456789abcdef0123456789abcdef!").unwrap();

        let mut classified = classify(&path).await.unwrap();
        assert_eq!(classified.kind, ContentKind::Unrecognized);
        assert_eq!(classified.mime, MIME_TEXT);

        let mut read_back = Vec::new();
        classified.stream.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"0123456789abcdef0123456789abcdef!");
    }

    #[tokio::test]
    async fn test_classify_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = classify(&dir.path().join("gone.gz")).await.unwrap_err();
        assert!(matches!(err, ClassifyError::Open { .. }));
    }
}
