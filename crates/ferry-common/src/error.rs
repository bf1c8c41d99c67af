//! Error types for Ferry

use thiserror::Error;

/// Result type alias for Ferry operations
pub type Result<T> = std::result::Result<T, FerryError>;

/// Main error type shared across Ferry crates
#[derive(Error, Debug)]
pub enum FerryError {
    #[error("Unrecognized status label: {0}")]
    InvalidStatus(String),
}
