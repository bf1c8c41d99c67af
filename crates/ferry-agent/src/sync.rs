//! Reconcile a manifest's local rows with the remote platform
//!
//! New files (`Local`) are registered so the platform allocates upload
//! targets for them; soft-deleted files (`Removed`) are withdrawn and their
//! rows deleted once the platform confirms.

use ferry_common::FileStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::LedgerStore;
use crate::models::ManifestFile;
use crate::platform::{FileAction, FileRegistration, Platform};
use crate::upload::{PipelineError, PipelineResult};

pub const SYNC_BATCH_SIZE: i64 = 250;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub node_id: String,
    pub registered: u64,
    pub removed: u64,
}

fn registration(file: &ManifestFile, action: FileAction) -> FileRegistration {
    FileRegistration {
        upload_id: file.upload_id.clone(),
        target_path: file.target_path.clone(),
        target_name: file.target_name.clone(),
        action,
    }
}

/// Make sure the manifest exists remotely, then push pending registrations
/// and removals in batches of [`SYNC_BATCH_SIZE`].
///
/// Stops between batches once `cancel` fires.
pub async fn sync_manifest(
    ledger: &LedgerStore,
    platform: &dyn Platform,
    manifest_id: i64,
    cancel: &CancellationToken,
) -> PipelineResult<SyncSummary> {
    let manifest = ledger
        .get_manifest(manifest_id)
        .await?
        .ok_or(PipelineError::ManifestNotFound(manifest_id))?;

    let node_id = match manifest.remote_node_id.clone() {
        Some(node_id) => node_id,
        None => {
            let node_id = platform.create_manifest(&manifest).await?;
            ledger.set_remote_node_id(manifest_id, &node_id).await?;
            node_id
        }
    };

    let mut summary = SyncSummary {
        node_id: node_id.clone(),
        ..Default::default()
    };

    for (status, action) in [
        (FileStatus::Local, FileAction::Register),
        (FileStatus::Removed, FileAction::Remove),
    ] {
        let mut after_id = 0;
        loop {
            if cancel.is_cancelled() {
                info!(manifest_id, "Sync interrupted by cancellation");
                return Ok(summary);
            }

            let batch = ledger
                .list_files_by_status(manifest_id, status, after_id, SYNC_BATCH_SIZE)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;

            let registrations: Vec<FileRegistration> =
                batch.iter().map(|file| registration(file, action)).collect();
            let response = platform.sync_files(&node_id, &registrations).await?;

            summary.registered += ledger
                .set_status_bulk(&response.registered, FileStatus::Registered)
                .await?;
            summary.removed += ledger.delete_confirmed_removals(&response.removed).await?;

            debug!(
                manifest_id,
                %status,
                batch = batch.len(),
                registered = response.registered.len(),
                removed = response.removed.len(),
                "Synced batch"
            );
        }
    }

    info!(
        manifest_id,
        node_id = %summary.node_id,
        registered = summary.registered,
        removed = summary.removed,
        "Manifest synced"
    );
    Ok(summary)
}
