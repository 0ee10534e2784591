//! Common error types for services

use thiserror::Error;

/// Service error types
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Front connection failed or dropped
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Configuration rejected at startup
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage rejected the write transiently (lock contention, timeout)
    #[error("storage busy: {0}")]
    StorageBusy(String),

    /// Storage failed permanently
    #[error("storage failed: {0}")]
    Storage(String),

    /// Request rejected by a control surface
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Trading calendar could not resolve a day
    #[error("calendar unavailable: {0}")]
    Calendar(String),

    /// Input row/tick failed validation and was skipped
    #[error("validation failed: {0}")]
    Validation(String),
}

impl ServiceError {
    /// Whether a retry at the storage boundary may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StorageBusy(_))
    }
}
