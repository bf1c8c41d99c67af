//! Common types used across Ferry
//!
//! Status labels are persisted in the local ledger as lowercase strings, and
//! [`Event`] is the JSON shape streamed to subscribed clients.

use serde::{Deserialize, Serialize};

use crate::error::FerryError;

// ============================================================================
// File Status
// ============================================================================

/// Lifecycle of a single manifest file.
///
/// ```text
/// Local ──sync──▶ Registered ──worker──▶ Uploaded ··remote finalized··▶ Verified
///   │                 │   └──worker error──▶ Failed
///   └──remove──▶ ✕    └──remove──▶ Removed ──remote confirms──▶ ✕
/// ```
///
/// Any state returns to `Local` on an administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Discovered locally, not yet registered with the platform
    Local,
    /// The platform allocated an upload target; the only state workers consume
    Registered,
    /// Bytes transferred to the object store
    Uploaded,
    /// The platform confirmed server-side processing finished
    Verified,
    /// Soft-deleted, waiting for the platform to confirm removal
    Removed,
    /// The last upload attempt failed
    Failed,
    /// Unrecognized label
    #[default]
    Unknown,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Local => "local",
            FileStatus::Registered => "registered",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Verified => "verified",
            FileStatus::Removed => "removed",
            FileStatus::Failed => "failed",
            FileStatus::Unknown => "unknown",
        }
    }

    /// Lenient conversion used when reading rows back: anything unrecognized is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or(FileStatus::Unknown)
    }
}

impl std::str::FromStr for FileStatus {
    type Err = FerryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(FileStatus::Local),
            "registered" => Ok(FileStatus::Registered),
            "uploaded" => Ok(FileStatus::Uploaded),
            "verified" => Ok(FileStatus::Verified),
            "removed" => Ok(FileStatus::Removed),
            "failed" => Ok(FileStatus::Failed),
            "unknown" => Ok(FileStatus::Unknown),
            _ => Err(FerryError::InvalidStatus(s.to_string())),
        }
    }
}

impl From<String> for FileStatus {
    fn from(label: String) -> Self {
        FileStatus::from_label(&label)
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Manifest Status
// ============================================================================

/// Lifecycle label of a manifest as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Initiated,
    Uploading,
    Completed,
    Cancelled,
    Failed,
    #[default]
    Unknown,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Initiated => "initiated",
            ManifestStatus::Uploading => "uploading",
            ManifestStatus::Completed => "completed",
            ManifestStatus::Cancelled => "cancelled",
            ManifestStatus::Failed => "failed",
            ManifestStatus::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "initiated" => ManifestStatus::Initiated,
            "uploading" => ManifestStatus::Uploading,
            "completed" => ManifestStatus::Completed,
            "cancelled" => ManifestStatus::Cancelled,
            "failed" => ManifestStatus::Failed,
            _ => ManifestStatus::Unknown,
        }
    }
}

impl From<String> for ManifestStatus {
    fn from(label: String) -> Self {
        ManifestStatus::from_label(&label)
    }
}

impl std::fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Progress Events
// ============================================================================

/// Phase of a single file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Init,
    InProgress,
    Complete,
}

/// Pipeline and subscription lifecycle milestones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    PipelineStarted,
    PipelineFinished,
    PipelineFailed,
    SubscriberClosed,
}

/// Event fanned out to every subscribed client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    UploadProgress {
        /// Source path of the file being transferred
        file_id: String,
        total_bytes: u64,
        current_bytes: u64,
        worker_id: u32,
        phase: UploadPhase,
    },
    CancelNotice {
        message: String,
    },
    Lifecycle {
        #[serde(skip_serializing_if = "Option::is_none")]
        manifest_id: Option<i64>,
        stage: LifecycleStage,
        message: String,
    },
}

impl Event {
    pub fn progress(
        file_id: impl Into<String>,
        total_bytes: u64,
        current_bytes: u64,
        worker_id: u32,
        phase: UploadPhase,
    ) -> Self {
        Event::UploadProgress {
            file_id: file_id.into(),
            total_bytes,
            current_bytes,
            worker_id,
            phase,
        }
    }

    pub fn cancel_notice(message: impl Into<String>) -> Self {
        Event::CancelNotice {
            message: message.into(),
        }
    }

    pub fn lifecycle(
        manifest_id: Option<i64>,
        stage: LifecycleStage,
        message: impl Into<String>,
    ) -> Self {
        Event::Lifecycle {
            manifest_id,
            stage,
            message: message.into(),
        }
    }
}
