//! Error taxonomy for checkpointed advances.
//!
//! Storage failures arrive already classified as [`StoreError`]; the
//! conversion below is the only mapping between the two. Only
//! [`CheckpointError::Conflict`] is retried internally.

use thiserror::Error;

use heightmark_storage::StoreError;

/// Errors from connecting, advancing or closing.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Missing or invalid configuration. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The storage connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Optimistic write conflict. Retried by the advance engine; surfaced
    /// only after the retry budget is exhausted.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Any other checkpoint lookup, creation or update failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The requested height range is malformed.
    #[error("invalid height range: from {from} to {to}")]
    InvalidRange {
        /// Requested start height.
        from: i64,
        /// Requested end height.
        to: i64,
    },

    /// The database has not been connected, or has been closed.
    #[error("checkpoint database is not connected")]
    NotConnected,

    /// The caller's mutation failed with its own error.
    #[error("mutation failed: {0}")]
    Mutation(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CheckpointError {
    /// Wraps a caller error raised inside a mutation callback.
    pub fn mutation(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Mutation(err.into())
    }

    /// Returns `true` if the advance engine retries this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<StoreError> for CheckpointError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::Connection(msg) => Self::Connection(msg),
            StoreError::Configuration(msg) => Self::Configuration(msg),
            StoreError::Backend(msg) => Self::Storage(msg),
        }
    }
}
