//! Ferry Common Library
//!
//! Shared types, utilities, and error handling for the Ferry upload agent.
//!
//! # Overview
//!
//! - **Error Handling**: the common error and result types
//! - **Checksums**: SHA-256 helpers used for multipart part integrity
//! - **Types**: file/manifest statuses and the progress events streamed to clients
//! - **Logging**: tracing subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use ferry_common::types::FileStatus;
//!
//! let status: FileStatus = "registered".parse().unwrap_or_default();
//! assert_eq!(status, FileStatus::Registered);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{FerryError, Result};
pub use types::{Event, FileStatus, LifecycleStage, ManifestStatus, UploadPhase};
