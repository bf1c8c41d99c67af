//! Status batch writer
//!
//! Workers and the verification poller never touch the ledger directly. They
//! send [`StatusUpdate`]s down one bounded channel and a single writer task
//! coalesces them into bulk updates, flushing every [`FLUSH_THRESHOLD`]
//! events or [`FLUSH_INTERVAL`], whichever comes first.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ferry_common::FileStatus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info};

use crate::db::{DbResult, LedgerStore};

pub const FLUSH_THRESHOLD: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub upload_id: String,
    pub status: FileStatus,
}

impl StatusUpdate {
    pub fn new(upload_id: impl Into<String>, status: FileStatus) -> Self {
        Self {
            upload_id: upload_id.into(),
            status,
        }
    }
}

/// Bulk status sink the writer flushes into
#[async_trait]
pub trait StatusStore: Send + Sync + 'static {
    async fn apply_status(&self, upload_ids: &[String], status: FileStatus) -> DbResult<u64>;
}

#[async_trait]
impl StatusStore for LedgerStore {
    async fn apply_status(&self, upload_ids: &[String], status: FileStatus) -> DbResult<u64> {
        self.set_status_bulk(upload_ids, status).await
    }
}

/// Order in which status groups are applied within one flush, so a file that
/// was both uploaded and verified in the same window ends up `Verified`.
fn apply_rank(status: FileStatus) -> u8 {
    match status {
        FileStatus::Local => 0,
        FileStatus::Registered => 1,
        FileStatus::Failed => 2,
        FileStatus::Uploaded => 3,
        FileStatus::Verified => 4,
        FileStatus::Removed => 5,
        FileStatus::Unknown => 6,
    }
}

/// Totals reported when the writer shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub flushes: u64,
    pub events: u64,
    pub rows_updated: u64,
    pub failed_groups: u64,
}

pub struct StatusWriter {
    store: Arc<dyn StatusStore>,
    rx: mpsc::Receiver<StatusUpdate>,
    buffer: Vec<StatusUpdate>,
    stats: WriterStats,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn StatusStore>, rx: mpsc::Receiver<StatusUpdate>) -> Self {
        Self {
            store,
            rx,
            buffer: Vec::with_capacity(FLUSH_THRESHOLD),
            stats: WriterStats::default(),
        }
    }

    /// Start a writer task. Dropping every sender flushes once more and ends it.
    pub fn spawn(store: Arc<dyn StatusStore>) -> (mpsc::Sender<StatusUpdate>, JoinHandle<WriterStats>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(Self::new(store, rx).run());
        (tx, handle)
    }

    pub async fn run(mut self) -> WriterStats {
        let mut deadline = Instant::now() + FLUSH_INTERVAL;

        loop {
            tokio::select! {
                update = self.rx.recv() => match update {
                    Some(update) => {
                        self.buffer.push(update);
                        if self.buffer.len() >= FLUSH_THRESHOLD {
                            self.flush().await;
                            deadline = Instant::now() + FLUSH_INTERVAL;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    self.flush().await;
                    deadline = Instant::now() + FLUSH_INTERVAL;
                }
            }
        }

        self.flush().await;
        info!(
            flushes = self.stats.flushes,
            events = self.stats.events,
            rows_updated = self.stats.rows_updated,
            failed_groups = self.stats.failed_groups,
            "Status writer stopped"
        );
        self.stats
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let mut groups: BTreeMap<u8, (FileStatus, Vec<String>)> = BTreeMap::new();
        let drained = self.buffer.len();
        for update in self.buffer.drain(..) {
            groups
                .entry(apply_rank(update.status))
                .or_insert_with(|| (update.status, Vec::new()))
                .1
                .push(update.upload_id);
        }

        for (status, upload_ids) in groups.into_values() {
            match self.store.apply_status(&upload_ids, status).await {
                Ok(rows) => {
                    self.stats.rows_updated += rows;
                    debug!(%status, events = upload_ids.len(), rows, "Flushed status group");
                }
                Err(e) => {
                    self.stats.failed_groups += 1;
                    error!(%status, events = upload_ids.len(), error = %e, "Failed to flush status group");
                }
            }
        }

        self.stats.flushes += 1;
        self.stats.events += drained as u64;
    }
}
