//! Manifest upload engine
//!
//! One pipeline per [`UploadOrchestrator::upload_manifest`] call: sync with
//! the platform, stream `Registered` rows into a pool of upload workers, and
//! poll the platform for server-side finalization while a single
//! [`StatusWriter`] batches every status change back into the ledger.

use thiserror::Error;

use crate::db::DbError;
use crate::platform::PlatformError;

pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod status_writer;
pub mod worker;

pub use orchestrator::{PipelineTimings, UploadAck, UploadOrchestrator};
pub use poller::VerificationPoller;
pub use registry::{SessionRegistry, UploadSession};
pub use status_writer::{StatusStore, StatusUpdate, StatusWriter};
pub use worker::{AbortPolicy, PoolConfig, PoolSummary, WorkerPool};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Ledger(#[from] DbError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Manifest {0} not found")]
    ManifestNotFound(i64),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
