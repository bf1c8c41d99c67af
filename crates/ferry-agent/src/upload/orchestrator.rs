//! Upload orchestrator
//!
//! Wires sync, the worker pool, the verification poller and the status
//! writer together for one manifest, and runs the whole thing as a
//! supervised background task.

use std::sync::Arc;

use ferry_common::{Event, LifecycleStage, ManifestStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::poller::{VerificationPoller, DEFAULT_POLL_INTERVAL};
use super::registry::{SessionRegistry, UploadSession};
use super::status_writer::{StatusUpdate, StatusWriter};
use super::worker::{PoolConfig, PoolSummary, WorkerPool};
use super::{PipelineError, PipelineResult};
use crate::broadcast::Broadcaster;
use crate::db::LedgerStore;
use crate::platform::Platform;
use crate::storage::MultipartUploader;
use crate::sync::sync_manifest;

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Timers owned by the pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimings {
    /// How long the poller keeps running after the last upload finishes
    pub grace_window: Duration,
    pub poll_interval: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            grace_window: DEFAULT_GRACE_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Immediate reply to an upload request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub status: String,
}

impl UploadAck {
    pub fn initiated() -> Self {
        Self {
            status: "initiated".to_string(),
        }
    }
}

/// How one pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub pool: PoolSummary,
    pub cancelled: bool,
    /// Whether this run held the manifest's grace window
    pub owned_grace_window: bool,
    pub final_status: ManifestStatus,
}

/// Deregisters the session and releases the grace window however the
/// pipeline exits, including by panic.
struct SessionGuard {
    registry: SessionRegistry,
    session: UploadSession,
    owns_grace_window: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.owns_grace_window {
            self.registry
                .end_grace_window(self.session.manifest_id, self.session.session_id);
        }
        self.registry.deregister(&self.session);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    ledger: LedgerStore,
    platform: Arc<dyn Platform>,
    uploader: Arc<dyn MultipartUploader>,
    broadcaster: Broadcaster,
    registry: SessionRegistry,
    pool_config: PoolConfig,
    timings: PipelineTimings,
    /// Supervisors of every spawned pipeline
    tasks: TaskTracker,
}

impl UploadOrchestrator {
    pub fn new(
        ledger: LedgerStore,
        platform: Arc<dyn Platform>,
        uploader: Arc<dyn MultipartUploader>,
        broadcaster: Broadcaster,
        registry: SessionRegistry,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            ledger,
            platform,
            uploader,
            broadcaster,
            registry,
            pool_config,
            timings: PipelineTimings::default(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_timings(mut self, timings: PipelineTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Pipelines spawned and not yet finished
    pub fn running_pipelines(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every pipeline and wait for their teardown: multipart aborts,
    /// the final status flush and the manifest's final status.
    ///
    /// Returns `false` if `timeout` elapsed with pipelines still running.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let cancelled = self.registry.shutdown();
        info!(
            cancelled,
            running = self.tasks.len(),
            "Waiting for upload pipelines to wind down"
        );

        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => {
                info!("All upload pipelines stopped");
                true
            }
            Err(_) => {
                warn!(
                    running = self.tasks.len(),
                    timeout_secs = timeout.as_secs(),
                    "Upload pipelines still running at shutdown deadline"
                );
                false
            }
        }
    }

    /// Start uploading a manifest in the background and return immediately
    pub fn upload_manifest(&self, manifest_id: i64) -> UploadAck {
        self.spawn_pipeline(manifest_id);
        UploadAck::initiated()
    }

    /// Spawn the pipeline under a supervisor. The returned handle resolves
    /// once the pipeline has finished and any failure has been reported.
    pub fn spawn_pipeline(&self, manifest_id: i64) -> JoinHandle<Option<PipelineOutcome>> {
        let this = self.clone();
        let pipeline = tokio::spawn(async move { this.run_pipeline(manifest_id).await });

        let ledger = self.ledger.clone();
        let broadcaster = self.broadcaster.clone();
        self.tasks.spawn(async move {
            let failure = match pipeline.await {
                Ok(Ok(outcome)) => return Some(outcome),
                Ok(Err(e)) => e.to_string(),
                Err(join_err) => match join_err.try_into_panic() {
                    Ok(payload) => format!("pipeline panicked: {}", panic_message(payload.as_ref())),
                    Err(join_err) => format!("pipeline aborted: {}", join_err),
                },
            };

            error!(manifest_id, error = %failure, "Upload pipeline failed");
            if let Err(e) = ledger
                .set_manifest_status(manifest_id, ManifestStatus::Failed)
                .await
            {
                warn!(manifest_id, error = %e, "Failed to record manifest failure");
            }
            broadcaster.broadcast(Event::lifecycle(
                Some(manifest_id),
                LifecycleStage::PipelineFailed,
                failure,
            ));
            None
        })
    }

    async fn run_pipeline(&self, manifest_id: i64) -> PipelineResult<PipelineOutcome> {
        self.ledger
            .get_manifest(manifest_id)
            .await?
            .ok_or(PipelineError::ManifestNotFound(manifest_id))?;

        let session = self.registry.register(manifest_id);
        let mut guard = SessionGuard {
            registry: self.registry.clone(),
            session: session.clone(),
            owns_grace_window: false,
        };
        let cancel = session.cancel.clone();

        self.ledger
            .set_manifest_status(manifest_id, ManifestStatus::Uploading)
            .await?;
        self.broadcaster.broadcast(Event::lifecycle(
            Some(manifest_id),
            LifecycleStage::PipelineStarted,
            format!("upload started for manifest {}", manifest_id),
        ));
        info!(manifest_id, session = %session.session_id, "Upload pipeline started");

        let (status_tx, writer) = StatusWriter::spawn(Arc::new(self.ledger.clone()));

        let stop_poller = CancellationToken::new();
        // Stops the poller on early return or panic too
        let _stop_poller_on_exit = stop_poller.clone().drop_guard();
        let poller = VerificationPoller::new(
            manifest_id,
            self.ledger.clone(),
            self.platform.clone(),
            status_tx.clone(),
            self.timings.poll_interval,
        )
        .spawn(cancel.clone(), stop_poller.clone());

        if let Err(e) = sync_manifest(&self.ledger, self.platform.as_ref(), manifest_id, &cancel).await {
            warn!(manifest_id, error = %e, "Sync failed, uploading files already registered");
        }

        let pool_result = self.run_pool(manifest_id, status_tx.clone(), &cancel).await;

        if !cancel.is_cancelled() {
            guard.owns_grace_window = self
                .registry
                .try_begin_grace_window(manifest_id, session.session_id);
            if guard.owns_grace_window {
                info!(
                    manifest_id,
                    grace_secs = self.timings.grace_window.as_secs(),
                    "Uploads finished, waiting for remote finalization"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(self.timings.grace_window) => {}
                }
            } else {
                info!(manifest_id, "Grace window already running for manifest, skipping");
            }
        }

        stop_poller.cancel();
        if let Err(e) = poller.await {
            error!(manifest_id, error = %e, "Verification poller task failed");
        }

        drop(status_tx);
        match writer.await {
            Ok(stats) => info!(manifest_id, events = stats.events, "Final status flush complete"),
            Err(e) => error!(manifest_id, error = %e, "Status writer task failed"),
        }

        let owned_grace_window = guard.owns_grace_window;
        drop(guard);

        let cancelled = cancel.is_cancelled();
        let final_status = match (&pool_result, cancelled) {
            (Err(_), _) => ManifestStatus::Failed,
            (Ok(_), true) => ManifestStatus::Cancelled,
            (Ok(_), false) => ManifestStatus::Completed,
        };
        self.ledger
            .set_manifest_status(manifest_id, final_status)
            .await?;
        let pool = pool_result?;

        self.broadcaster.broadcast(Event::lifecycle(
            Some(manifest_id),
            LifecycleStage::PipelineFinished,
            format!(
                "manifest {} {}: {} uploaded, {} failed",
                manifest_id, final_status, pool.uploaded, pool.failed
            ),
        ));
        info!(manifest_id, status = %final_status, "Upload pipeline finished");

        Ok(PipelineOutcome {
            pool,
            cancelled,
            owned_grace_window,
            final_status,
        })
    }

    /// Run the worker pool against the manifest's remote id, if sync produced one
    async fn run_pool(
        &self,
        manifest_id: i64,
        status_tx: mpsc::Sender<StatusUpdate>,
        cancel: &CancellationToken,
    ) -> PipelineResult<PoolSummary> {
        let manifest = self
            .ledger
            .get_manifest(manifest_id)
            .await?
            .ok_or(PipelineError::ManifestNotFound(manifest_id))?;

        let Some(node_id) = manifest.remote_node_id.clone() else {
            warn!(manifest_id, "Manifest has no remote id, nothing to upload");
            return Ok(PoolSummary::default());
        };

        let pool = WorkerPool::new(
            self.ledger.clone(),
            self.uploader.clone(),
            self.broadcaster.clone(),
            self.pool_config,
        );
        Ok(pool.run(&manifest, &node_id, status_tx, cancel).await?)
    }
}
