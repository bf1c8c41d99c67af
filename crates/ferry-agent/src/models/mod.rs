//! Ledger models

use chrono::{DateTime, Utc};
use ferry_common::{FileStatus, ManifestStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An upload batch tying local files to one remote dataset
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Manifest {
    pub id: i64,
    /// Assigned by the platform during sync
    pub remote_node_id: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub org_id: String,
    pub org_name: String,
    pub dataset_id: String,
    pub dataset_name: String,
    #[sqlx(try_from = "String")]
    pub status: ManifestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Owner and destination captured when a manifest is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewManifest {
    pub user_id: String,
    pub user_name: String,
    pub org_id: String,
    pub org_name: String,
    pub dataset_id: String,
    pub dataset_name: String,
}

/// One local file tracked by a manifest
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ManifestFile {
    pub id: i64,
    pub manifest_id: i64,
    /// Minted locally, never reused; object key suffix and status correlation key
    pub upload_id: String,
    pub source_path: String,
    pub target_path: String,
    pub target_name: String,
    #[sqlx(try_from = "String")]
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewManifestFile {
    pub source_path: String,
    pub target_path: String,
    pub target_name: String,
}

impl NewManifestFile {
    pub fn new(
        source_path: impl Into<String>,
        target_path: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            target_path: target_path.into(),
            target_name: target_name.into(),
        }
    }
}

/// Outcome of removing a path prefix from a manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalSummary {
    /// `Local` rows deleted outright
    pub deleted: u64,
    /// `Registered` rows soft-deleted to `Removed`
    pub marked_removed: u64,
}
