//! Shared fixtures for ferry-agent integration tests
//!
//! Every test gets its own SQLite ledger in a temporary directory, plus
//! in-process fakes for the remote platform and the object store.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ferry_agent::db::{DbConfig, LedgerStore};
use ferry_agent::models::{Manifest, NewManifest, NewManifestFile};
use ferry_agent::platform::{
    FileAction, FilePage, FileRegistration, Platform, PlatformError, PlatformResult,
    RemoteFileStatus, SyncResponse,
};
use ferry_agent::storage::{
    Body, MultipartHandle, MultipartUploader, PutOutcome, PutRequest, StorageError, StorageResult,
};
use ferry_common::FileStatus;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

pub const NODE_ID: &str = "node-1";

// ============================================================================
// Ledger
// ============================================================================

/// Ledger backed by a throwaway database file
pub struct TestLedger {
    pub ledger: LedgerStore,
    pub dir: TempDir,
}

impl TestLedger {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = DbConfig {
            url: format!("sqlite://{}", dir.path().join("ledger.db").display()),
            max_connections: 4,
            ..Default::default()
        };
        let ledger = LedgerStore::connect(&config)
            .await
            .expect("Failed to open test ledger");
        Self { ledger, dir }
    }

    /// Write a source file of `size` bytes under the temp dir
    pub fn write_source(&self, name: &str, size: usize) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, vec![7u8; size]).expect("Failed to write source file");
        path
    }

    pub async fn manifest(&self) -> Manifest {
        self.ledger
            .create_manifest(&new_manifest())
            .await
            .expect("Failed to create manifest")
    }

    /// Move rows to `Registered`, as a successful sync would
    pub async fn register(&self, upload_ids: &[String]) {
        self.ledger
            .set_status_bulk(upload_ids, FileStatus::Registered)
            .await
            .expect("Failed to register files");
    }

    /// Create a manifest with `count` real source files, all `Local`
    pub async fn manifest_with_files(&self, count: usize) -> (Manifest, Vec<String>) {
        let manifest = self.manifest().await;
        let files: Vec<NewManifestFile> = (0..count)
            .map(|i| {
                let path = self.write_source(&format!("m{}-f{}.bin", manifest.id, i), 1024 + i);
                NewManifestFile::new(
                    path.display().to_string(),
                    "/raw",
                    format!("f{}.bin", i),
                )
            })
            .collect();
        let ids = self
            .ledger
            .add_files(manifest.id, &files)
            .await
            .expect("Failed to add files");
        (manifest, ids)
    }
}

pub fn new_manifest() -> NewManifest {
    NewManifest {
        user_id: "user-1".to_string(),
        user_name: "Test User".to_string(),
        org_id: "org-1".to_string(),
        org_name: "Test Org".to_string(),
        dataset_id: "dataset-1".to_string(),
        dataset_name: "Test Dataset".to_string(),
    }
}

pub fn file(source_path: &str) -> NewManifestFile {
    let name = source_path.rsplit('/').next().unwrap_or(source_path);
    NewManifestFile::new(source_path, "/", name)
}

// ============================================================================
// Platform
// ============================================================================

/// Accepts every registration and removal it is sent
pub struct FakePlatform {
    pub create_calls: AtomicUsize,
    pub sync_calls: AtomicUsize,
    pub fail_create: AtomicBool,
    pub synced: Mutex<Vec<FileRegistration>>,
    /// Upload ids reported back as finalized
    pub finalized: Mutex<Vec<String>>,
    pub page_size: usize,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            synced: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            page_size: 100,
        }
    }
}

impl FakePlatform {
    pub fn finalize(&self, upload_ids: &[String]) {
        self.finalized
            .lock()
            .unwrap()
            .extend(upload_ids.iter().cloned());
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn create_manifest(&self, _manifest: &Manifest) -> PlatformResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PlatformError::Api {
                status: 503,
                message: "platform unavailable".to_string(),
            });
        }
        Ok(NODE_ID.to_string())
    }

    async fn sync_files(
        &self,
        _node_id: &str,
        files: &[FileRegistration],
    ) -> PlatformResult<SyncResponse> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.synced.lock().unwrap().extend(files.iter().cloned());

        let mut response = SyncResponse::default();
        for file in files {
            match file.action {
                FileAction::Register => response.registered.push(file.upload_id.clone()),
                FileAction::Remove => response.removed.push(file.upload_id.clone()),
            }
        }
        Ok(response)
    }

    async fn files_by_status(
        &self,
        _node_id: &str,
        _status: RemoteFileStatus,
        continuation_token: Option<&str>,
    ) -> PlatformResult<FilePage> {
        let finalized = self.finalized.lock().unwrap().clone();
        let start: usize = continuation_token
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);
        let end = (start + self.page_size).min(finalized.len());
        let upload_ids = finalized.get(start..end).unwrap_or_default().to_vec();

        Ok(FilePage {
            upload_ids,
            continuation_token: (end < finalized.len()).then(|| end.to_string()),
        })
    }
}

// ============================================================================
// Object store
// ============================================================================

/// In-memory multipart store.
///
/// Uploads for manifests listed in `block_manifests` create a multipart
/// upload and then hang until cancelled. After an abort, `list_parts`
/// reports a shrinking part count for `abort_lag` calls before reaching 0.
#[derive(Default)]
pub struct FakeUploader {
    pub block_manifests: Mutex<HashSet<String>>,
    pub abort_lag: usize,
    pub completed: Mutex<Vec<String>>,
    pub in_flight: AtomicUsize,
    pub aborted: Mutex<Vec<MultipartHandle>>,
    pub parts: Mutex<HashMap<String, usize>>,
    pub next_id: AtomicUsize,
}

impl FakeUploader {
    pub fn blocking(manifest_id: i64, abort_lag: usize) -> Self {
        let uploader = Self {
            abort_lag,
            ..Default::default()
        };
        uploader
            .block_manifests
            .lock()
            .unwrap()
            .insert(manifest_id.to_string());
        uploader
    }

    pub fn completed_keys(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    pub fn remaining_parts(&self, handle: &MultipartHandle) -> Option<usize> {
        self.parts.lock().unwrap().get(&handle.multipart_id).copied()
    }

    /// Seed an in-progress multipart upload holding `parts` parts
    pub fn seed_aborted(&self, parts: usize) -> MultipartHandle {
        let handle = MultipartHandle {
            key: "node/seeded".to_string(),
            multipart_id: format!("mp-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
        };
        self.parts
            .lock()
            .unwrap()
            .insert(handle.multipart_id.clone(), parts);
        handle
    }
}

#[async_trait]
impl MultipartUploader for FakeUploader {
    async fn put(
        &self,
        request: PutRequest,
        mut body: Body,
        cancel: &CancellationToken,
    ) -> StorageResult<PutOutcome> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;

        let blocked = self
            .block_manifests
            .lock()
            .unwrap()
            .contains(&request.metadata.manifest_id);
        if blocked {
            let handle = MultipartHandle {
                key: request.key.clone(),
                multipart_id: format!("mp-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            };
            self.parts
                .lock()
                .unwrap()
                .insert(handle.multipart_id.clone(), 1);
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            return Err(StorageError::Cancelled {
                multipart: Some(handle),
            });
        }

        self.completed.lock().unwrap().push(request.key.clone());
        Ok(PutOutcome {
            key: request.key,
            parts: 1,
            bytes: data.len() as u64,
        })
    }

    async fn abort(&self, handle: &MultipartHandle) -> StorageResult<()> {
        self.aborted.lock().unwrap().push(handle.clone());
        let mut parts = self.parts.lock().unwrap();
        match parts.get_mut(&handle.multipart_id) {
            Some(remaining) => {
                *remaining = self.abort_lag;
                Ok(())
            }
            None => Err(StorageError::NoSuchUpload(handle.multipart_id.clone())),
        }
    }

    async fn list_parts(&self, handle: &MultipartHandle) -> StorageResult<usize> {
        let mut parts = self.parts.lock().unwrap();
        match parts.get_mut(&handle.multipart_id) {
            Some(remaining) => {
                let current = *remaining;
                *remaining = remaining.saturating_sub(1);
                Ok(current)
            }
            None => Err(StorageError::NoSuchUpload(handle.multipart_id.clone())),
        }
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_for<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
