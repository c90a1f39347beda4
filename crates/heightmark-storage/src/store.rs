//! Storage capability traits.
//!
//! The advance protocol needs exactly four things from a backend: open a
//! connection, look up (or lazily create) a checkpoint record, open a
//! transaction, and inside that transaction apply the conditional height
//! update. Everything else a backend offers is exposed through its concrete
//! transaction type, which doubles as the caller's write handle.
//!
//! ```text
//! StoreConnector::connect ──► CheckpointStore ──► begin_transaction ──► StoreTransaction
//!                              find_checkpoint                          conditional_update
//!                              create_checkpoint                        (caller writes)
//!                              close                                    commit / rollback
//! ```

use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::CheckpointRecord;

/// Opens a connection to a checkpoint backend.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// The store handed out on a successful connect.
    type Store: CheckpointStore;

    /// Establishes a connection to `url`, using `database_name` as the
    /// database that holds checkpoint records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the backend is unreachable and
    /// [`StoreError::Configuration`] if `url` cannot be interpreted.
    async fn connect(&self, url: &str, database_name: &str) -> Result<Self::Store, StoreError>;
}

/// Durable single-record-per-stream checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Transaction scope, also passed to callers as their write handle.
    type Transaction: StoreTransaction;

    /// Point lookup by stream identifier.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] on backend failure.
    async fn find_checkpoint(
        &self,
        identifier: &str,
    ) -> Result<Option<CheckpointRecord>, StoreError>;

    /// Creates the record for `identifier` at `height` unless one already
    /// exists, and returns the stored record either way.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] on backend failure.
    async fn create_checkpoint(
        &self,
        identifier: &str,
        height: i64,
    ) -> Result<CheckpointRecord, StoreError>;

    /// Opens a transaction scope.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] if the scope cannot be opened.
    async fn begin_transaction(&self) -> Result<Self::Transaction, StoreError>;

    /// Releases the underlying connection. Calling it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] if the backend reports a failure
    /// while shutting down.
    async fn close(&self) -> Result<(), StoreError>;
}

/// An open transaction scope.
#[async_trait]
pub trait StoreTransaction: Send {
    /// `SET height = to WHERE identifier = identifier AND height < from`.
    ///
    /// Returns the number of records matched (0 or 1). A zero-row match is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on a serialization conflict, or
    /// another classified [`StoreError`].
    async fn conditional_update(
        &mut self,
        identifier: &str,
        from: i64,
        to: i64,
    ) -> Result<u64, StoreError>;

    /// Commits every write made through this scope atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the commit lost a race with a
    /// concurrent writer, or another classified [`StoreError`].
    async fn commit(self) -> Result<(), StoreError>;

    /// Discards every write made through this scope.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] if the backend fails to roll back.
    async fn rollback(self) -> Result<(), StoreError>;
}
