//! Error types for the livesync engine.

use thiserror::Error;

/// All possible errors from the livesync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    // Wire errors
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reject empty or whitespace-only collection names.
pub fn validate_collection(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidCollection(name.to_string()));
    }
    Ok(())
}
