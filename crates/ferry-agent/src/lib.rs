//! Ferry Agent Library
//!
//! Local daemon that uploads large manifest file sets to the remote data
//! platform.
//!
//! # Overview
//!
//! - **Ledger**: SQLite record of every manifest and the state of each of its files
//! - **Upload engine**: a cancellable worker pool doing chunked S3 multipart
//!   uploads, a poller that watches for server-side finalization, and a single
//!   batched status writer
//! - **Broadcaster**: fans progress and lifecycle events out to every connected client
//! - **RPC surface**: HTTP/JSON on loopback plus a server-sent event feed
//!
//! # File lifecycle
//!
//! Files start `local`, become `registered` once the platform has allocated a
//! target during sync, `uploaded` when a worker has transferred them, and
//! `verified` once the platform reports processing finished. Removal by path
//! prefix deletes `local` rows and soft-deletes `registered` ones until the
//! platform confirms.
//!
//! # Example
//!
//! ```no_run
//! use ferry_agent::{config::Config, db::LedgerStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let ledger = LedgerStore::connect(&config.db_config()).await?;
//!     ledger.health_check().await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod api;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod platform;
pub mod storage;
pub mod sync;
pub mod upload;

pub use broadcast::Broadcaster;
pub use db::LedgerStore;
pub use error::{AppError, AppResult};
pub use upload::UploadOrchestrator;
