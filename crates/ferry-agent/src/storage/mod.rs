//! Object store client seam
//!
//! Workers talk to the object store only through [`MultipartUploader`], so the
//! pipeline can run against [`s3::S3Uploader`] in production and an in-memory
//! fake in tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod counting;
pub mod s3;

pub use config::StorageConfig;
pub use counting::CountingReader;
pub use s3::S3Uploader;

/// S3 rejects multipart uploads with more parts than this
pub const MAX_PARTS: u64 = 10_000;

/// Smallest part S3 accepts (except the last one)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Identifies a multipart upload that has been started on the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartHandle {
    pub key: String,
    pub multipart_id: String,
}

/// Metadata attached to every uploaded object
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub organization_id: String,
    pub dataset_id: String,
    pub manifest_id: String,
}

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: String,
    /// Total size of the body in bytes
    pub size: u64,
    /// Configured part size; may be raised for very large bodies
    pub part_size: u64,
    pub metadata: ObjectMetadata,
}

impl PutRequest {
    /// Part size actually used so the body fits in [`MAX_PARTS`] parts
    pub fn effective_part_size(&self) -> u64 {
        self.part_size.max(self.size.div_ceil(MAX_PARTS)).max(1)
    }
}

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub key: String,
    pub parts: usize,
    pub bytes: u64,
}

pub type Body = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The cancellation token fired mid-operation. Carries the multipart
    /// upload if one had already been created so the caller can clean it up.
    #[error("Upload cancelled")]
    Cancelled { multipart: Option<MultipartHandle> },

    /// The object store does not know the multipart upload
    #[error("No such multipart upload: {0}")]
    NoSuchUpload(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store request failed: {0}")]
    Transfer(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Chunked, cancellable object uploads
#[async_trait]
pub trait MultipartUploader: Send + Sync {
    /// Upload `body` under `request.key`.
    ///
    /// Returns [`StorageError::Cancelled`] as soon as `cancel` fires; any
    /// multipart upload already created is left for the caller to abort.
    async fn put(
        &self,
        request: PutRequest,
        body: Body,
        cancel: &CancellationToken,
    ) -> StorageResult<PutOutcome>;

    /// Abort a multipart upload, discarding its parts
    async fn abort(&self, handle: &MultipartHandle) -> StorageResult<()>;

    /// Number of parts still stored for a multipart upload.
    ///
    /// Fails with [`StorageError::NoSuchUpload`] once the upload is gone.
    async fn list_parts(&self, handle: &MultipartHandle) -> StorageResult<usize>;
}
