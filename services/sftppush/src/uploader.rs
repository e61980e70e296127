use crate::classify::ByteSource;
use crate::config::DefaultsConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

/// Smallest part size S3 accepts for all but the last part.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Errors that can occur while uploading a stream.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Failed to read source stream: {0}")]
    Source(#[from] std::io::Error),

    #[error("Object store request failed: {0}")]
    Request(String),

    #[error("Object store response missing {0}")]
    MissingField(&'static str),
}

/// Provider metadata for a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    pub e_tag: Option<String>,
    pub version_id: Option<String>,
    /// Decoded bytes sent
    pub bytes: u64,
    /// Parts used (1 for a single put)
    pub parts: u32,
}

/// Destination of decoded streams.
///
/// Implementations are shared by every in-flight upload of a session and must
/// be safe for concurrent use. Time budgets are applied by the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        body: ByteSource,
        bucket: &str,
        key: &str,
    ) -> Result<UploadReceipt, UploadError>;
}

/// S3 uploader streaming content in fixed-size parts
pub struct S3Uploader {
    client: S3Client,
    part_size: usize,
}

impl S3Uploader {
    /// Create a new S3 uploader
    pub async fn new(config: &DefaultsConfig, part_size: usize) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.awsregion.clone()));

        if let Some(ref profile) = config.awsprofile {
            loader = loader.profile_name(profile);
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.s3target,
            region = %config.awsregion,
            part_size,
            "S3 uploader initialized"
        );

        Self::from_client(client, part_size)
    }

    pub fn from_client(client: S3Client, part_size: usize) -> Self {
        Self {
            client,
            part_size: part_size.max(MIN_PART_SIZE),
        }
    }

    /// Single put for content that fits in one part
    async fn simple_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<UploadReceipt, UploadError> {
        let bytes = body.len() as u64;

        let response = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| UploadError::Request(format!("put_object: {e}")))?;

        Ok(UploadReceipt {
            e_tag: response.e_tag().map(String::from),
            version_id: response.version_id().map(String::from),
            bytes,
            parts: 1,
        })
    }

    /// Multipart upload, starting from an already read first part
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        first_part: Vec<u8>,
        rest: &mut ByteSource,
    ) -> Result<UploadReceipt, UploadError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| UploadError::Request(format!("create_multipart_upload: {e}")))?;

        let upload_id = create_response
            .upload_id()
            .ok_or(UploadError::MissingField("upload id"))?
            .to_string();

        let mut guard = AbortGuard {
            client: self.client.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.clone(),
            armed: true,
        };

        let mut completed_parts = Vec::new();
        let mut bytes = 0u64;
        let mut part_number = 1;
        let mut chunk = first_part;

        // Upload parts
        loop {
            bytes += chunk.len() as u64;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| UploadError::Request(format!("upload_part {part_number}: {e}")))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            debug!(key = %key, part_number, "Uploaded part");

            chunk = read_part(rest, self.part_size).await?;
            if chunk.is_empty() {
                break;
            }
            part_number += 1;
        }

        // Complete multipart upload
        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| UploadError::Request(format!("complete_multipart_upload: {e}")))?;

        guard.armed = false;

        Ok(UploadReceipt {
            e_tag: response.e_tag().map(String::from),
            version_id: response.version_id().map(String::from),
            bytes,
            parts: part_number as u32,
        })
    }
}

#[async_trait]
impl ObjectStore for S3Uploader {
    #[instrument(skip(self, body), fields(bucket = %bucket, key = %key))]
    async fn upload(
        &self,
        mut body: ByteSource,
        bucket: &str,
        key: &str,
    ) -> Result<UploadReceipt, UploadError> {
        let first_part = read_part(&mut body, self.part_size).await?;

        // Content that does not fill one part goes up in a single request
        if first_part.len() < self.part_size {
            return self.simple_upload(bucket, key, first_part).await;
        }

        self.multipart_upload(bucket, key, first_part, &mut body)
            .await
    }
}

/// Aborts an unfinished multipart upload when dropped, including when the
/// upload future is cancelled by a timeout.
struct AbortGuard {
    client: S3Client,
    bucket: String,
    key: String,
    upload_id: String,
    armed: bool,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, upload_id = %self.upload_id, "No runtime to abort multipart upload");
            return;
        };

        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);

        handle.spawn(async move {
            match client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                Ok(_) => debug!(key = %key, "Aborted multipart upload"),
                Err(e) => warn!(key = %key, error = %e, "Failed to abort multipart upload"),
            }
        });
    }
}

/// Read up to `part_size` bytes; a short result means the stream is exhausted.
async fn read_part<R>(source: &mut R, part_size: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut part = Vec::with_capacity(part_size.min(MIN_PART_SIZE));
    source.take(part_size as u64).read_to_end(&mut part).await?;
    Ok(part)
}
