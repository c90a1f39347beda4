//! Storage error classification.
//!
//! Every backend converts its native error encoding into [`StoreError`] at
//! the adapter boundary. Callers decide retry policy by matching on the
//! variant and never inspect backend error codes themselves.

use thiserror::Error;

/// Classified storage failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Optimistic write conflict detected by the backend's transaction
    /// isolation (e.g. `PostgreSQL` SQLSTATE `40001`). Safe to retry the
    /// whole transaction.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// The connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The backend rejected the supplied connection settings.
    #[error("invalid store configuration: {0}")]
    Configuration(String),

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns `true` if the failure is a transaction conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns `true` if the failure concerns the connection itself.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("document encoding: {e}"))
    }
}
