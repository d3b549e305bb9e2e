//! Error types for QuartzKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using QuartzError
pub type Result<T> = std::result::Result<T, QuartzError>;

/// Unified error type for QuartzKV operations
#[derive(Debug, Error)]
pub enum QuartzError {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    #[error("path escapes storage root: {0}")]
    PathTraversal(String),

    #[error("value of {size} bytes exceeds backend limit of {max} bytes")]
    ValueTooLarge { size: u64, max: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("metadata catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    // -------------------------------------------------------------------------
    // Protocol / Integrity Errors
    // -------------------------------------------------------------------------
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // State Errors
    // -------------------------------------------------------------------------
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("store is read-only (secondary replica)")]
    ReadOnly,

    /// Internal signal for a TTL-expired key found on a read path.
    /// The store facade surfaces this to callers as `NotFound`.
    #[error("key expired")]
    Expired,
}

impl From<redis::RedisError> for QuartzError {
    fn from(err: redis::RedisError) -> Self {
        QuartzError::Backend(format!("redis: {}", err))
    }
}
