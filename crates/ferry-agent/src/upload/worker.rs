//! Upload worker pool
//!
//! `Registered` rows are streamed from the ledger into a work queue holding
//! at most one row per worker, so the producer stalls as soon as every
//! worker is busy and one row is waiting for each. Workers upload one file
//! at a time and report the outcome as a [`StatusUpdate`].

use std::sync::Arc;

use ferry_common::{Event, FileStatus, UploadPhase};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status_writer::StatusUpdate;
use crate::broadcast::Broadcaster;
use crate::db::{DbResult, LedgerStore};
use crate::models::{Manifest, ManifestFile};
use crate::storage::{
    CountingReader, MultipartHandle, MultipartUploader, ObjectMetadata, PutRequest, StorageError,
};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_PART_SIZE: u64 = 32 * 1024 * 1024;

/// Bounds on confirming a multipart abort after cancellation
#[derive(Debug, Clone, Copy)]
pub struct AbortPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for AbortPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub part_size: u64,
    pub abort: AbortPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            part_size: DEFAULT_PART_SIZE,
            abort: AbortPolicy::default(),
        }
    }
}

/// Per-pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub queued: u64,
    pub uploaded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl PoolSummary {
    fn merge(&mut self, other: PoolSummary) {
        self.uploaded += other.uploaded;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

enum FileOutcome {
    Uploaded,
    Failed,
    Cancelled,
}

/// State shared by the workers of one pipeline run
struct WorkerContext {
    manifest_id: i64,
    node_id: String,
    metadata: ObjectMetadata,
    uploader: Arc<dyn MultipartUploader>,
    broadcaster: Broadcaster,
    status_tx: mpsc::Sender<StatusUpdate>,
    cancel: CancellationToken,
    config: PoolConfig,
}

impl WorkerContext {
    async fn report(&self, upload_id: &str, status: FileStatus) {
        if self
            .status_tx
            .send(StatusUpdate::new(upload_id, status))
            .await
            .is_err()
        {
            error!(upload_id, %status, "Status writer closed, update lost");
        }
    }

    async fn upload_file(&self, worker_id: u32, file: &ManifestFile) -> FileOutcome {
        let source = match tokio::fs::File::open(&file.source_path).await {
            Ok(source) => source,
            Err(e) => {
                warn!(worker_id, upload_id = %file.upload_id, path = %file.source_path, error = %e, "Failed to open source file");
                self.report(&file.upload_id, FileStatus::Failed).await;
                return FileOutcome::Failed;
            }
        };
        let total_bytes = match source.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!(worker_id, upload_id = %file.upload_id, path = %file.source_path, error = %e, "Failed to stat source file");
                self.report(&file.upload_id, FileStatus::Failed).await;
                return FileOutcome::Failed;
            }
        };

        self.broadcaster.broadcast(Event::progress(
            &file.source_path,
            total_bytes,
            0,
            worker_id,
            UploadPhase::Init,
        ));

        let broadcaster = self.broadcaster.clone();
        let file_id = file.source_path.clone();
        let body = CountingReader::new(source, move |current_bytes| {
            broadcaster.broadcast(Event::progress(
                &file_id,
                total_bytes,
                current_bytes,
                worker_id,
                UploadPhase::InProgress,
            ));
        });

        let request = PutRequest {
            key: format!("{}/{}", self.node_id, file.upload_id),
            size: total_bytes,
            part_size: self.config.part_size,
            metadata: self.metadata.clone(),
        };

        match self.uploader.put(request, Box::new(body), &self.cancel).await {
            Ok(outcome) => {
                self.broadcaster.broadcast(Event::progress(
                    &file.source_path,
                    total_bytes,
                    total_bytes,
                    worker_id,
                    UploadPhase::Complete,
                ));
                debug!(worker_id, upload_id = %file.upload_id, key = %outcome.key, parts = outcome.parts, "File uploaded");
                self.report(&file.upload_id, FileStatus::Uploaded).await;
                FileOutcome::Uploaded
            }
            Err(StorageError::Cancelled { multipart }) => {
                info!(worker_id, upload_id = %file.upload_id, "Upload cancelled mid-transfer");
                if let Some(handle) = multipart {
                    abort_and_confirm(self.uploader.as_ref(), &handle, self.config.abort).await;
                }
                FileOutcome::Cancelled
            }
            Err(e) => {
                error!(worker_id, upload_id = %file.upload_id, path = %file.source_path, error = %e, "Upload failed");
                self.report(&file.upload_id, FileStatus::Failed).await;
                FileOutcome::Failed
            }
        }
    }
}

/// Abort a multipart upload and wait until the store reports no parts left.
///
/// Returns whether removal was confirmed within the policy's attempts. A
/// missing upload counts as confirmed.
pub async fn abort_and_confirm(
    uploader: &dyn MultipartUploader,
    handle: &MultipartHandle,
    policy: AbortPolicy,
) -> bool {
    if let Err(e) = uploader.abort(handle).await {
        warn!(key = %handle.key, multipart_id = %handle.multipart_id, error = %e, "Multipart abort request failed");
    }

    for attempt in 1..=policy.attempts {
        match uploader.list_parts(handle).await {
            Ok(0) | Err(StorageError::NoSuchUpload(_)) => {
                info!(key = %handle.key, attempt, "Multipart upload aborted, no parts remain");
                return true;
            }
            Ok(remaining) => {
                debug!(key = %handle.key, attempt, remaining, "Multipart parts still present");
            }
            Err(e) => {
                warn!(key = %handle.key, attempt, error = %e, "Failed to list multipart parts");
            }
        }
        if attempt < policy.attempts {
            sleep(policy.backoff).await;
        }
    }

    error!(
        key = %handle.key,
        multipart_id = %handle.multipart_id,
        attempts = policy.attempts,
        "Could not confirm multipart abort, orphaned parts may remain"
    );
    false
}

async fn worker_loop(
    worker_id: u32,
    ctx: Arc<WorkerContext>,
    jobs: Arc<Mutex<mpsc::Receiver<ManifestFile>>>,
) -> PoolSummary {
    let mut summary = PoolSummary::default();

    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                job = jobs.recv() => job,
            }
        };
        let Some(file) = job else {
            break;
        };

        match ctx.upload_file(worker_id, &file).await {
            FileOutcome::Uploaded => summary.uploaded += 1,
            FileOutcome::Failed => summary.failed += 1,
            FileOutcome::Cancelled => summary.cancelled += 1,
        }
    }

    debug!(worker_id, manifest_id = ctx.manifest_id, "Worker stopped");
    summary
}

pub struct WorkerPool {
    ledger: LedgerStore,
    uploader: Arc<dyn MultipartUploader>,
    broadcaster: Broadcaster,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(
        ledger: LedgerStore,
        uploader: Arc<dyn MultipartUploader>,
        broadcaster: Broadcaster,
        config: PoolConfig,
    ) -> Self {
        Self {
            ledger,
            uploader,
            broadcaster,
            config,
        }
    }

    /// Upload every `Registered` row of `manifest` under `node_id`.
    ///
    /// Returns once the queue is drained and all workers have stopped, or
    /// after cancellation once in-flight files have unwound. Per-file errors
    /// never fail the run; only a broken ledger stream does.
    pub async fn run(
        &self,
        manifest: &Manifest,
        node_id: &str,
        status_tx: mpsc::Sender<StatusUpdate>,
        cancel: &CancellationToken,
    ) -> DbResult<PoolSummary> {
        let workers = self.config.workers.max(1);
        let ctx = Arc::new(WorkerContext {
            manifest_id: manifest.id,
            node_id: node_id.to_string(),
            metadata: ObjectMetadata {
                organization_id: manifest.org_id.clone(),
                dataset_id: manifest.dataset_id.clone(),
                manifest_id: manifest.id.to_string(),
            },
            uploader: self.uploader.clone(),
            broadcaster: self.broadcaster.clone(),
            status_tx,
            cancel: cancel.clone(),
            config: self.config,
        });

        let (job_tx, job_rx) = mpsc::channel::<ManifestFile>(workers);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut set = JoinSet::new();
        for worker_id in 1..=workers as u32 {
            set.spawn(worker_loop(worker_id, ctx.clone(), job_rx.clone()));
        }

        let mut summary = PoolSummary::default();
        let mut produced = Ok(());
        {
            let mut rows = self
                .ledger
                .stream_files_by_status(manifest.id, FileStatus::Registered);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    row = rows.next() => row,
                };
                match next {
                    Some(Ok(file)) => {
                        let sent = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            sent = job_tx.send(file) => sent,
                        };
                        if sent.is_err() {
                            break;
                        }
                        summary.queued += 1;
                    }
                    Some(Err(e)) => {
                        error!(manifest_id = manifest.id, error = %e, "Failed to stream registered files");
                        produced = Err(e);
                        break;
                    }
                    None => break,
                }
            }
        }
        drop(job_tx);

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(worker_summary) => summary.merge(worker_summary),
                Err(e) => error!(manifest_id = manifest.id, error = %e, "Upload worker panicked"),
            }
        }

        info!(
            manifest_id = manifest.id,
            queued = summary.queued,
            uploaded = summary.uploaded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Worker pool finished"
        );

        produced.map(|_| summary)
    }
}
