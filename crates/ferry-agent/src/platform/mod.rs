//! Remote data platform seam
//!
//! The platform owns the remote manifest, allocates upload targets during
//! sync, and reports when server-side processing of an uploaded file is done.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Manifest;

pub mod http;

pub use http::HttpPlatform;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Platform request failed: {0}. Check FERRY_PLATFORM_URL and network connectivity.")]
    Http(#[from] reqwest::Error),

    #[error("Platform returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Platform configuration error: {0}")]
    Config(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// File state as tracked by the platform, used as a query predicate only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteFileStatus {
    Finalized,
}

impl RemoteFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteFileStatus::Finalized => "finalized",
        }
    }
}

/// What sync asks the platform to do with one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Register,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRegistration {
    pub upload_id: String,
    pub target_path: String,
    pub target_name: String,
    pub action: FileAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Upload ids the platform is now ready to receive
    #[serde(default)]
    pub registered: Vec<String>,
    /// Upload ids whose remote removal is confirmed
    #[serde(default)]
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePage {
    #[serde(default)]
    pub upload_ids: Vec<String>,
    pub continuation_token: Option<String>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Create the remote counterpart of `manifest` and return its node id
    async fn create_manifest(&self, manifest: &Manifest) -> PlatformResult<String>;

    /// Register or remove a batch of files under a remote manifest
    async fn sync_files(
        &self,
        node_id: &str,
        files: &[FileRegistration],
    ) -> PlatformResult<SyncResponse>;

    /// One page of upload ids in `status` under a remote manifest
    async fn files_by_status(
        &self,
        node_id: &str,
        status: RemoteFileStatus,
        continuation_token: Option<&str>,
    ) -> PlatformResult<FilePage>;
}
