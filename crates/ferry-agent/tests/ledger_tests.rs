//! Ledger and sync integration tests
//!
//! Coverage includes:
//! - Manifest and file CRUD
//! - Guarded bulk status updates
//! - Reset and remove-by-prefix admin operations
//! - Sync against a fake platform

use std::sync::atomic::Ordering;

use ferry_agent::db::DbError;
use ferry_agent::models::{NewManifestFile, RemovalSummary};
use ferry_agent::sync::{sync_manifest, SYNC_BATCH_SIZE};
use ferry_common::{FileStatus, ManifestStatus};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

mod common;
use common::{file, FakePlatform, TestLedger, NODE_ID};

async fn status_of(env: &TestLedger, upload_id: &str) -> Option<FileStatus> {
    env.ledger
        .get_file(upload_id)
        .await
        .unwrap()
        .map(|file| file.status)
}

// ============================================================================
// Manifests and files
// ============================================================================

#[tokio::test]
async fn test_create_manifest_starts_initiated() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;

    assert_eq!(manifest.status, ManifestStatus::Initiated);
    assert!(manifest.remote_node_id.is_none());

    let fetched = env.ledger.get_manifest(manifest.id).await.unwrap().unwrap();
    assert_eq!(fetched.dataset_id, "dataset-1");
    assert!(env.ledger.get_manifest(manifest.id + 100).await.unwrap().is_none());
}

#[tokio::test]
async fn test_set_remote_node_id_on_missing_manifest() {
    let env = TestLedger::start().await;
    let result = env.ledger.set_remote_node_id(42, "node").await;
    assert!(matches!(result, Err(DbError::NotFound(_))));
}

#[tokio::test]
async fn test_add_files_mints_unique_upload_ids() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;

    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/a/one.bin"), file("/a/two.bin")])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let files = env.ledger.list_files(manifest.id).await.unwrap();
    assert!(files.iter().all(|f| f.status == FileStatus::Local));
    assert_eq!(files[0].upload_id, ids[0]);
    assert_eq!(files[0].target_name, "one.bin");
}

#[tokio::test]
async fn test_delete_manifest_cascades_to_files() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/x.bin")])
        .await
        .unwrap();

    assert!(env.ledger.delete_manifest(manifest.id).await.unwrap());
    assert!(status_of(&env, &ids[0]).await.is_none());
    assert!(!env.ledger.delete_manifest(manifest.id).await.unwrap());
}

#[tokio::test]
async fn test_stream_files_by_status_in_id_order() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(
            manifest.id,
            &[file("/s/1"), file("/s/2"), file("/s/3"), file("/s/4")],
        )
        .await
        .unwrap();
    env.ledger
        .set_status_bulk(&[ids[3].clone(), ids[1].clone()], FileStatus::Registered)
        .await
        .unwrap();

    let streamed: Vec<String> = env
        .ledger
        .stream_files_by_status(manifest.id, FileStatus::Registered)
        .map(|row| row.unwrap().upload_id)
        .collect()
        .await;

    assert_eq!(streamed, vec![ids[1].clone(), ids[3].clone()]);
}

// ============================================================================
// Bulk status updates
// ============================================================================

#[tokio::test]
async fn test_settled_rows_are_never_overwritten() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/v/1"), file("/v/2")])
        .await
        .unwrap();
    env.register(&ids).await;

    env.ledger
        .set_status_bulk(&ids[..1], FileStatus::Verified)
        .await
        .unwrap();

    let updated = env
        .ledger
        .set_status_bulk(&ids, FileStatus::Uploaded)
        .await
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(status_of(&env, &ids[0]).await, Some(FileStatus::Verified));
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Uploaded));

    // A second pipeline failing the same files must not undo either outcome
    let updated = env
        .ledger
        .set_status_bulk(&ids, FileStatus::Failed)
        .await
        .unwrap();
    assert_eq!(updated, 0);
    assert_eq!(status_of(&env, &ids[0]).await, Some(FileStatus::Verified));
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Uploaded));

    let updated = env
        .ledger
        .set_status_bulk(&ids, FileStatus::Verified)
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Verified));
}

#[tokio::test]
async fn test_late_upload_result_keeps_removed_row() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/a/in-flight"), file("/a/queued")])
        .await
        .unwrap();
    env.register(&ids).await;

    let summary = env.ledger.remove_from_manifest(manifest.id, "/a/").await.unwrap();
    assert_eq!(summary.marked_removed, 2);

    let uploaded = env
        .ledger
        .set_status_bulk(&ids[..1], FileStatus::Uploaded)
        .await
        .unwrap();
    let failed = env
        .ledger
        .set_status_bulk(&ids[1..], FileStatus::Failed)
        .await
        .unwrap();
    let verified = env
        .ledger
        .set_status_bulk(&ids, FileStatus::Verified)
        .await
        .unwrap();

    assert_eq!((uploaded, failed, verified), (0, 0, 0));
    for id in &ids {
        assert_eq!(status_of(&env, id).await, Some(FileStatus::Removed));
    }
}

#[tokio::test]
async fn test_late_upload_result_keeps_reset_row_local() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/r/1"), file("/r/2")])
        .await
        .unwrap();
    env.register(&ids).await;

    env.ledger.reset_status_for_manifest(manifest.id).await.unwrap();

    for status in [FileStatus::Uploaded, FileStatus::Failed, FileStatus::Verified] {
        let updated = env.ledger.set_status_bulk(&ids, status).await.unwrap();
        assert_eq!(updated, 0, "{} applied to a reset row", status);
    }
    for id in &ids {
        assert_eq!(status_of(&env, id).await, Some(FileStatus::Local));
    }
}

#[tokio::test]
async fn test_registered_only_promotes_local_rows() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/r/1"), file("/r/2")])
        .await
        .unwrap();
    env.register(&ids[1..]).await;
    env.ledger
        .set_status_bulk(&ids[1..], FileStatus::Uploaded)
        .await
        .unwrap();

    let updated = env
        .ledger
        .set_status_bulk(&ids, FileStatus::Registered)
        .await
        .unwrap();

    assert_eq!(updated, 1);
    assert_eq!(status_of(&env, &ids[0]).await, Some(FileStatus::Registered));
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Uploaded));
}

#[tokio::test]
async fn test_bulk_update_spans_statement_chunks() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let files: Vec<NewManifestFile> = (0..1200).map(|i| file(&format!("/c/{}", i))).collect();
    let ids = env.ledger.add_files(manifest.id, &files).await.unwrap();

    let updated = env
        .ledger
        .set_status_bulk(&ids, FileStatus::Registered)
        .await
        .unwrap();
    assert_eq!(updated, 1200);

    let counts = env.ledger.count_by_status(manifest.id).await.unwrap();
    assert_eq!(counts.get(&FileStatus::Registered), Some(&1200));
    assert_eq!(counts.get(&FileStatus::Local), None);
}

#[tokio::test]
async fn test_unknown_upload_ids_are_ignored() {
    let env = TestLedger::start().await;
    let updated = env
        .ledger
        .set_status_bulk(&["missing".to_string()], FileStatus::Uploaded)
        .await
        .unwrap();
    assert_eq!(updated, 0);
    assert_eq!(env.ledger.set_status_bulk(&[], FileStatus::Uploaded).await.unwrap(), 0);
}

// ============================================================================
// Admin operations
// ============================================================================

#[tokio::test]
async fn test_reset_only_touches_target_manifest() {
    let env = TestLedger::start().await;
    let first = env.manifest().await;
    let second = env.manifest().await;
    let first_ids = env
        .ledger
        .add_files(first.id, &[file("/1/a"), file("/1/b")])
        .await
        .unwrap();
    let second_ids = env
        .ledger
        .add_files(second.id, &[file("/2/a")])
        .await
        .unwrap();

    env.register(&first_ids).await;
    env.register(&second_ids).await;
    env.ledger
        .set_status_bulk(&first_ids, FileStatus::Failed)
        .await
        .unwrap();
    env.ledger
        .set_status_bulk(&second_ids, FileStatus::Uploaded)
        .await
        .unwrap();

    let reset = env.ledger.reset_status_for_manifest(first.id).await.unwrap();

    assert_eq!(reset, 2);
    for id in &first_ids {
        assert_eq!(status_of(&env, id).await, Some(FileStatus::Local));
    }
    assert_eq!(status_of(&env, &second_ids[0]).await, Some(FileStatus::Uploaded));
}

#[tokio::test]
async fn test_remove_prefix_deletes_local_and_soft_deletes_registered() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/a/f1"), file("/a/f2"), file("/b/f3")])
        .await
        .unwrap();
    env.ledger
        .set_status_bulk(&ids[1..], FileStatus::Registered)
        .await
        .unwrap();

    let summary = env.ledger.remove_from_manifest(manifest.id, "/a/").await.unwrap();

    assert_eq!(
        summary,
        RemovalSummary {
            deleted: 1,
            marked_removed: 1
        }
    );
    assert_eq!(status_of(&env, &ids[0]).await, None);
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Removed));
    assert_eq!(status_of(&env, &ids[2]).await, Some(FileStatus::Registered));
}

#[tokio::test]
async fn test_remove_prefix_leaves_other_states_alone() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/a/up"), file("/a/done")])
        .await
        .unwrap();
    env.register(&ids).await;
    env.ledger
        .set_status_bulk(&ids[..1], FileStatus::Uploaded)
        .await
        .unwrap();
    env.ledger
        .set_status_bulk(&ids[1..], FileStatus::Verified)
        .await
        .unwrap();

    let summary = env.ledger.remove_from_manifest(manifest.id, "/a").await.unwrap();

    assert_eq!(summary, RemovalSummary::default());
    assert_eq!(status_of(&env, &ids[0]).await, Some(FileStatus::Uploaded));
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Verified));
}

#[tokio::test]
async fn test_remove_prefix_matches_wildcards_literally() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(
            manifest.id,
            &[
                file("/data/100%/x.bin"),
                file("/data/1000/y.bin"),
                file("/data/1_0/z.bin"),
                file("/data/110/w.bin"),
            ],
        )
        .await
        .unwrap();

    let percent = env
        .ledger
        .remove_from_manifest(manifest.id, "/data/100%")
        .await
        .unwrap();
    assert_eq!(percent.deleted, 1);
    assert_eq!(status_of(&env, &ids[0]).await, None);
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Local));

    let underscore = env
        .ledger
        .remove_from_manifest(manifest.id, "/data/1_")
        .await
        .unwrap();
    assert_eq!(underscore.deleted, 1);
    assert_eq!(status_of(&env, &ids[2]).await, None);
    assert_eq!(status_of(&env, &ids[3]).await, Some(FileStatus::Local));
}

#[tokio::test]
async fn test_confirmed_removals_only_delete_removed_rows() {
    let env = TestLedger::start().await;
    let manifest = env.manifest().await;
    let ids = env
        .ledger
        .add_files(manifest.id, &[file("/d/1"), file("/d/2")])
        .await
        .unwrap();
    env.ledger
        .set_status_bulk(&ids[..1], FileStatus::Removed)
        .await
        .unwrap();

    let deleted = env.ledger.delete_confirmed_removals(&ids).await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(status_of(&env, &ids[0]).await, None);
    assert_eq!(status_of(&env, &ids[1]).await, Some(FileStatus::Local));
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test]
async fn test_sync_registers_in_batches_and_reuses_remote_id() {
    let env = TestLedger::start().await;
    let platform = FakePlatform::default();
    let manifest = env.manifest().await;
    let files: Vec<NewManifestFile> = (0..600)
        .map(|i| file(&format!("/bulk/{:04}.bin", i)))
        .collect();
    env.ledger.add_files(manifest.id, &files).await.unwrap();
    let cancel = CancellationToken::new();

    let summary = sync_manifest(&env.ledger, &platform, manifest.id, &cancel)
        .await
        .unwrap();

    assert_eq!(summary.node_id, NODE_ID);
    assert_eq!(summary.registered, 600);
    let expected_batches = 600_usize.div_ceil(SYNC_BATCH_SIZE as usize);
    assert_eq!(platform.sync_calls.load(Ordering::SeqCst), expected_batches);

    let stored = env.ledger.get_manifest(manifest.id).await.unwrap().unwrap();
    assert_eq!(stored.remote_node_id.as_deref(), Some(NODE_ID));

    // Soft-delete a slice, then sync again to withdraw it
    let removal = env
        .ledger
        .remove_from_manifest(manifest.id, "/bulk/00")
        .await
        .unwrap();
    assert_eq!(removal.marked_removed, 100);

    let summary = sync_manifest(&env.ledger, &platform, manifest.id, &cancel)
        .await
        .unwrap();

    assert_eq!(summary.registered, 0);
    assert_eq!(summary.removed, 100);
    assert_eq!(platform.create_calls.load(Ordering::SeqCst), 1);

    let counts = env.ledger.count_by_status(manifest.id).await.unwrap();
    assert_eq!(counts.get(&FileStatus::Registered), Some(&500));
    assert_eq!(counts.get(&FileStatus::Removed), None);
}

#[tokio::test]
async fn test_sync_stops_when_cancelled() {
    let env = TestLedger::start().await;
    let platform = FakePlatform::default();
    let (manifest, _) = env.manifest_with_files(3).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = sync_manifest(&env.ledger, &platform, manifest.id, &cancel)
        .await
        .unwrap();

    assert_eq!(summary.registered, 0);
    assert_eq!(platform.sync_calls.load(Ordering::SeqCst), 0);
    let counts = env.ledger.count_by_status(manifest.id).await.unwrap();
    assert_eq!(counts.get(&FileStatus::Local), Some(&3));
}

#[tokio::test]
async fn test_sync_surfaces_platform_errors() {
    let env = TestLedger::start().await;
    let platform = FakePlatform::default();
    platform.fail_create.store(true, Ordering::SeqCst);
    let (manifest, _) = env.manifest_with_files(1).await;

    let result = sync_manifest(&env.ledger, &platform, manifest.id, &CancellationToken::new()).await;

    assert!(result.is_err());
    let stored = env.ledger.get_manifest(manifest.id).await.unwrap().unwrap();
    assert!(stored.remote_node_id.is_none());
}
