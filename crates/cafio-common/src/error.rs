//! Error types for CAFIO
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for CAFIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for CAFIO
#[derive(Debug, Error)]
pub enum Error {
    // I/O and streaming errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("size mismatch for {member}: declared {declared} bytes, streamed {actual}")]
    SizeMismatch {
        member: String,
        declared: u64,
        actual: u64,
    },

    #[error("stream copy exceeded deadline of {seconds}s")]
    Timeout { seconds: u64 },

    // Container format errors
    #[error("unsupported container format version: {0}")]
    UnsupportedVersion(String),

    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    // Writer/reader discipline errors
    #[error("duplicate member path: {0}")]
    DuplicateMember(String),

    #[error("writer already finalized")]
    UseAfterFinalize,

    #[error("container index not loaded, call load_index() first")]
    IndexNotLoaded,

    #[error("container writer poisoned by a previous failed append")]
    WriterPoisoned,

    // Lookup errors
    #[error("not found: {0}")]
    NotFound(String),

    // Input errors
    #[error("validation failed: {0}")]
    Validation(String),

    // Handoff errors
    #[error("container upload failed: {0}")]
    PutFailed(String),

    #[error("catalog insert failed: {0}")]
    IndexInsertFailed(String),

    #[error("record already exists: {0}")]
    Conflict(String),

    // Collaborator availability
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a corrupt container error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptContainer(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Timeout { .. }
                | Self::ConnectionFailed(_)
                | Self::PutFailed(_)
                | Self::IndexInsertFailed(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
