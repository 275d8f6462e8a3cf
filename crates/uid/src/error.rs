//! Error types for identifier handling

use thiserror::Error;

/// Result type for identifier operations
pub type Result<T> = std::result::Result<T, UidError>;

/// Identifier errors
#[derive(Debug, Error)]
pub enum UidError {
    #[error("Invalid hex identifier: {0}")]
    InvalidHex(String),

    #[error("Invalid server id: {0}")]
    InvalidServerId(String),
}
