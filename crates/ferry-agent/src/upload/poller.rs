//! Remote verification poller
//!
//! Server-side processing finishes some time after the bytes land, so while
//! a pipeline runs the poller periodically asks the platform which files are
//! finalized and marks them `Verified`.

use std::collections::HashSet;
use std::sync::Arc;

use ferry_common::FileStatus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status_writer::StatusUpdate;
use super::PipelineResult;
use crate::db::LedgerStore;
use crate::platform::{Platform, RemoteFileStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub ticks: u64,
    pub verified: u64,
    pub errors: u64,
}

pub struct VerificationPoller {
    manifest_id: i64,
    ledger: LedgerStore,
    platform: Arc<dyn Platform>,
    status_tx: mpsc::Sender<StatusUpdate>,
    interval: Duration,
    /// Upload ids already reported during this run
    reported: HashSet<String>,
}

impl VerificationPoller {
    pub fn new(
        manifest_id: i64,
        ledger: LedgerStore,
        platform: Arc<dyn Platform>,
        status_tx: mpsc::Sender<StatusUpdate>,
        interval: Duration,
    ) -> Self {
        Self {
            manifest_id,
            ledger,
            platform,
            status_tx,
            interval,
            reported: HashSet::new(),
        }
    }

    /// Run until `parent` is cancelled or `stop` fires
    pub fn spawn(self, parent: CancellationToken, stop: CancellationToken) -> JoinHandle<PollerStats> {
        tokio::spawn(self.run(parent, stop))
    }

    pub async fn run(mut self, parent: CancellationToken, stop: CancellationToken) -> PollerStats {
        let mut stats = PollerStats::default();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = parent.cancelled() => break,
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            stats.ticks += 1;
            let polled = tokio::select! {
                biased;
                _ = parent.cancelled() => break,
                _ = stop.cancelled() => break,
                polled = self.poll_once() => polled,
            };

            match polled {
                Ok(verified) => stats.verified += verified,
                Err(e) => {
                    stats.errors += 1;
                    warn!(manifest_id = self.manifest_id, error = %e, "Verification poll failed, retrying next tick");
                }
            }
        }

        info!(
            manifest_id = self.manifest_id,
            ticks = stats.ticks,
            verified = stats.verified,
            errors = stats.errors,
            "Verification poller stopped"
        );
        stats
    }

    /// Page through every finalized file once and report the ones not seen
    /// before in this run. Returns how many were reported.
    pub async fn poll_once(&mut self) -> PipelineResult<u64> {
        let node_id = match self.ledger.get_manifest(self.manifest_id).await? {
            Some(manifest) => match manifest.remote_node_id {
                Some(node_id) => node_id,
                None => {
                    debug!(manifest_id = self.manifest_id, "No remote id yet, skipping poll");
                    return Ok(0);
                }
            },
            None => {
                debug!(manifest_id = self.manifest_id, "Manifest gone, skipping poll");
                return Ok(0);
            }
        };

        let mut verified = 0;
        let mut continuation_token: Option<String> = None;
        loop {
            let page = self
                .platform
                .files_by_status(&node_id, RemoteFileStatus::Finalized, continuation_token.as_deref())
                .await?;

            for upload_id in page.upload_ids {
                if self.reported.contains(&upload_id) {
                    continue;
                }
                if self
                    .status_tx
                    .send(StatusUpdate::new(upload_id.clone(), FileStatus::Verified))
                    .await
                    .is_err()
                {
                    warn!(manifest_id = self.manifest_id, "Status writer closed during poll");
                    return Ok(verified);
                }
                self.reported.insert(upload_id);
                verified += 1;
            }

            match page.continuation_token {
                Some(token) if !token.is_empty() => continuation_token = Some(token),
                _ => break,
            }
        }

        if verified > 0 {
            debug!(manifest_id = self.manifest_id, verified, "Finalized files reported");
        }
        Ok(verified)
    }
}
