//! Exposes compressed file content as a plain byte stream.

use crate::classify::{ByteSource, Classified, ContentKind};
use async_compression::tokio::bufread::GzipDecoder;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("Unsupported content type {0}")]
    Unsupported(&'static str),

    #[error("Invalid gzip stream: {0}")]
    InvalidGzip(#[source] std::io::Error),
}

/// Wrap a classified stream in the decoder matching its type.
///
/// The gzip header and first block are decoded eagerly, so a corrupt file
/// is reported here rather than half way through an upload. Nothing beyond
/// the decoder's buffer is read; the rest is pulled lazily by the consumer.
pub async fn decompress(classified: Classified) -> Result<ByteSource, DecompressError> {
    match classified.kind {
        ContentKind::Gzip => {
            let mut decoder = GzipDecoder::new(BufReader::new(classified.stream));
            decoder.multiple_members(true);

            let mut decoded = BufReader::new(decoder);
            decoded
                .fill_buf()
                .await
                .map_err(DecompressError::InvalidGzip)?;

            Ok(Box::pin(decoded))
        }
        ContentKind::Zip | ContentKind::Unrecognized => {
            Err(DecompressError::Unsupported(classified.mime))
        }
    }
}
