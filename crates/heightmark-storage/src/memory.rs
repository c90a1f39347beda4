//! In-memory checkpoint store.
//!
//! [`MemoryCheckpointStore`] keeps checkpoint records and caller documents in
//! process memory behind a shared lock. Transactions are optimistic: each one
//! remembers the store version it started from, stages its writes privately,
//! and fails its commit with [`StoreError::Conflict`] if another writing
//! commit landed first. That gives the same first-committer-wins behaviour a
//! serializable SQL backend surfaces, which makes the store suitable for
//! exercising the advance protocol without a database.
//!
//! The store also carries fault-injection hooks and counters so tests can
//! observe exactly how many transactions a caller opened.
//!
//! Every [`MemoryConnector::connect`] hands out a separate connection handle
//! over the same data. Closing one handle leaves the others usable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;
use crate::record::CheckpointRecord;
use crate::store::{CheckpointStore, StoreConnector, StoreTransaction};

#[derive(Debug, Default)]
struct MemoryState {
    checkpoints: HashMap<String, CheckpointRecord>,
    collections: HashMap<String, BTreeMap<String, Value>>,
    /// Bumped by every commit that wrote something.
    version: u64,
    pending_conflicts: u32,
    pending_failure: Option<StoreError>,
    connect_failure: Option<StoreError>,
    stats: MemoryStats,
}

fn ensure_open(closed: &AtomicBool) -> Result<(), StoreError> {
    if closed.load(Ordering::Acquire) {
        return Err(StoreError::Connection("memory store is closed".into()));
    }
    Ok(())
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        match self.pending_failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Operation counters for a [`MemoryCheckpointStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Successful `connect` calls.
    pub connects: u64,
    /// Connection handles closed.
    pub closes: u64,
    /// Checkpoint records created.
    pub checkpoints_created: u64,
    /// Transactions opened.
    pub transactions_begun: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions explicitly rolled back.
    pub transactions_rolled_back: u64,
    /// Conditional updates that matched a record.
    pub heights_advanced: u64,
}

/// Connection handle over shared in-memory checkpoint data.
///
/// Clones share both the data and the handle's open/closed state;
/// [`MemoryConnector::connect`] opens a new handle over the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<MemoryState>>,
    closed: Arc<AtomicBool>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens another handle over the same data.
    fn open_handle(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes the next `n` conditional updates fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.state.lock().pending_conflicts = n;
    }

    /// Makes the next lookup, creation or conditional update fail with `err`.
    pub fn inject_failure(&self, err: StoreError) {
        self.state.lock().pending_failure = Some(err);
    }

    /// Makes the next connect attempt through a [`MemoryConnector`] fail.
    pub fn fail_next_connect(&self, err: StoreError) {
        self.state.lock().connect_failure = Some(err);
    }

    /// Returns the committed height for `identifier`.
    #[must_use]
    pub fn height(&self, identifier: &str) -> Option<i64> {
        self.state
            .lock()
            .checkpoints
            .get(identifier)
            .map(|r| r.height)
    }

    /// Returns the number of checkpoint records.
    #[must_use]
    pub fn checkpoint_count(&self) -> usize {
        self.state.lock().checkpoints.len()
    }

    /// Returns a committed document.
    #[must_use]
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Returns the number of committed documents in `collection`.
    #[must_use]
    pub fn collection_len(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Returns `true` once [`close`](CheckpointStore::close) has been called
    /// on this handle.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    type Transaction = MemoryTransaction;

    async fn find_checkpoint(
        &self,
        identifier: &str,
    ) -> Result<Option<CheckpointRecord>, StoreError> {
        ensure_open(&self.closed)?;
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state.checkpoints.get(identifier).cloned())
    }

    async fn create_checkpoint(
        &self,
        identifier: &str,
        height: i64,
    ) -> Result<CheckpointRecord, StoreError> {
        ensure_open(&self.closed)?;
        let mut state = self.state.lock();
        state.take_failure()?;

        if let Some(existing) = state.checkpoints.get(identifier) {
            return Ok(existing.clone());
        }

        let record = CheckpointRecord::new(identifier, height);
        state
            .checkpoints
            .insert(identifier.to_string(), record.clone());
        state.version += 1;
        state.stats.checkpoints_created += 1;
        debug!(identifier, height, "created checkpoint record");
        Ok(record)
    }

    async fn begin_transaction(&self) -> Result<MemoryTransaction, StoreError> {
        ensure_open(&self.closed)?;
        let mut state = self.state.lock();
        state.stats.transactions_begun += 1;
        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            read_version: state.version,
            height_update: None,
            writes: BTreeMap::new(),
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().stats.closes += 1;
        }
        Ok(())
    }
}

/// Transaction scope and write handle for [`MemoryCheckpointStore`].
///
/// Writes are staged until [`commit`](StoreTransaction::commit) and are
/// visible to reads through the same transaction only.
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    closed: Arc<AtomicBool>,
    read_version: u64,
    height_update: Option<(String, i64)>,
    writes: BTreeMap<(String, String), Option<Value>>,
}

impl MemoryTransaction {
    /// Inserts or replaces the document `id` in `collection`.
    pub fn upsert(&mut self, collection: &str, id: impl Into<String>, doc: Value) {
        self.writes
            .insert((collection.to_string(), id.into()), Some(doc));
    }

    /// Upserts every `(id, document)` pair in `collection`.
    pub fn upsert_many<I, K>(&mut self, collection: &str, docs: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (id, doc) in docs {
            self.upsert(collection, id, doc);
        }
    }

    /// Removes the document `id` from `collection`.
    pub fn delete(&mut self, collection: &str, id: impl Into<String>) {
        self.writes.insert((collection.to_string(), id.into()), None);
    }

    /// Reads a document, seeing this transaction's own staged writes.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        if let Some(staged) = self.writes.get(&(collection.to_string(), id.to_string())) {
            return staged.clone();
        }
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Returns `true` if the transaction has staged any write.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        self.height_update.is_some() || !self.writes.is_empty()
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn conditional_update(
        &mut self,
        identifier: &str,
        from: i64,
        to: i64,
    ) -> Result<u64, StoreError> {
        ensure_open(&self.closed)?;
        let mut state = self.state.lock();
        state.take_failure()?;
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(StoreError::Conflict(format!(
                "injected conflict on checkpoint '{identifier}'"
            )));
        }

        let current = match &self.height_update {
            Some((id, staged)) if id == identifier => Some(*staged),
            _ => state.checkpoints.get(identifier).map(|r| r.height),
        };

        match current {
            Some(height) if height < from => {
                self.height_update = Some((identifier.to_string(), to));
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn commit(self) -> Result<(), StoreError> {
        ensure_open(&self.closed)?;
        let mut state = self.state.lock();

        if !self.has_writes() {
            state.stats.transactions_committed += 1;
            return Ok(());
        }

        if state.version != self.read_version {
            return Err(StoreError::Conflict(format!(
                "store changed since transaction start (read version {}, now {})",
                self.read_version, state.version
            )));
        }

        if let Some((identifier, height)) = self.height_update {
            if let Some(record) = state.checkpoints.get_mut(&identifier) {
                record.height = height;
                record.updated_at = Utc::now();
            }
            state.stats.heights_advanced += 1;
        }

        for ((collection, id), doc) in self.writes {
            let docs = state.collections.entry(collection).or_default();
            match doc {
                Some(doc) => {
                    docs.insert(id, doc);
                }
                None => {
                    docs.remove(&id);
                }
            }
        }

        state.version += 1;
        state.stats.transactions_committed += 1;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.state.lock().stats.transactions_rolled_back += 1;
        Ok(())
    }
}

/// Connector that opens handles over a shared [`MemoryCheckpointStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryCheckpointStore,
}

impl MemoryConnector {
    /// Creates a connector over `store`.
    #[must_use]
    pub fn new(store: MemoryCheckpointStore) -> Self {
        Self { store }
    }

    /// Returns the handle whose data this connector shares.
    #[must_use]
    pub fn store(&self) -> &MemoryCheckpointStore {
        &self.store
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Store = MemoryCheckpointStore;

    async fn connect(
        &self,
        url: &str,
        database_name: &str,
    ) -> Result<MemoryCheckpointStore, StoreError> {
        let mut state = self.store.state.lock();
        if let Some(err) = state.connect_failure.take() {
            return Err(err);
        }
        state.stats.connects += 1;
        debug!(url, database = database_name, "opened memory checkpoint store");
        Ok(self.store.open_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UNKNOWN_HEIGHT;
    use serde_json::json;

    async fn seeded(identifier: &str, height: i64) -> MemoryCheckpointStore {
        let store = MemoryCheckpointStore::new();
        store.create_checkpoint(identifier, height).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryCheckpointStore::new();
        let first = store.create_checkpoint("s", UNKNOWN_HEIGHT).await.unwrap();
        let second = store.create_checkpoint("s", 99).await.unwrap();

        assert_eq!(first.height, UNKNOWN_HEIGHT);
        assert_eq!(second.height, UNKNOWN_HEIGHT);
        assert_eq!(store.checkpoint_count(), 1);
        assert_eq!(store.stats().checkpoints_created, 1);
    }

    #[tokio::test]
    async fn test_conditional_update_predicate() {
        let store = seeded("s", 10).await;

        let mut tx = store.begin_transaction().await.unwrap();
        assert_eq!(tx.conditional_update("s", 10, 20).await.unwrap(), 0);
        assert_eq!(tx.conditional_update("s", 11, 20).await.unwrap(), 1);
        // Staged height is visible to the same transaction.
        assert_eq!(tx.conditional_update("s", 15, 30).await.unwrap(), 0);
        tx.commit().await.unwrap();

        assert_eq!(store.height("s"), Some(20));
    }

    #[tokio::test]
    async fn test_missing_identifier_matches_nothing() {
        let store = MemoryCheckpointStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        assert_eq!(tx.conditional_update("nope", 0, 5).await.unwrap(), 0);
        tx.commit().await.unwrap();
        assert_eq!(store.height("nope"), None);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = seeded("s", UNKNOWN_HEIGHT).await;

        let mut tx = store.begin_transaction().await.unwrap();
        tx.conditional_update("s", 0, 5).await.unwrap();
        tx.upsert("blocks", "1", json!({"n": 1}));
        tx.rollback().await.unwrap();

        assert_eq!(store.height("s"), Some(UNKNOWN_HEIGHT));
        assert!(store.document("blocks", "1").is_none());
        assert_eq!(store.stats().transactions_rolled_back, 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = seeded("s", UNKNOWN_HEIGHT).await;
        {
            let mut tx = store.begin_transaction().await.unwrap();
            tx.conditional_update("s", 0, 5).await.unwrap();
            tx.upsert("blocks", "1", json!({"n": 1}));
        }
        assert_eq!(store.height("s"), Some(UNKNOWN_HEIGHT));
        assert_eq!(store.collection_len("blocks"), 0);
    }

    #[tokio::test]
    async fn test_first_committer_wins() {
        let store = seeded("s", UNKNOWN_HEIGHT).await;

        let mut a = store.begin_transaction().await.unwrap();
        let mut b = store.begin_transaction().await.unwrap();
        assert_eq!(a.conditional_update("s", 0, 5).await.unwrap(), 1);
        assert_eq!(b.conditional_update("s", 0, 7).await.unwrap(), 1);

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.height("s"), Some(5));
    }

    #[tokio::test]
    async fn test_read_only_commit_never_conflicts() {
        let store = seeded("s", 10).await;

        let mut reader = store.begin_transaction().await.unwrap();
        let mut writer = store.begin_transaction().await.unwrap();
        writer.conditional_update("s", 11, 12).await.unwrap();
        writer.commit().await.unwrap();

        assert_eq!(reader.conditional_update("s", 5, 6).await.unwrap(), 0);
        reader.commit().await.unwrap();
        assert_eq!(store.height("s"), Some(12));
    }

    #[tokio::test]
    async fn test_documents_read_your_writes() {
        let store = MemoryCheckpointStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        tx.upsert_many("tx", [("a", json!(1)), ("b", json!(2))]);
        tx.delete("tx", "b");

        assert_eq!(tx.get("tx", "a"), Some(json!(1)));
        assert_eq!(tx.get("tx", "b"), None);
        assert!(store.document("tx", "a").is_none());

        tx.commit().await.unwrap();
        assert_eq!(store.document("tx", "a"), Some(json!(1)));
        assert_eq!(store.collection_len("tx"), 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = seeded("s", UNKNOWN_HEIGHT).await;
        store.inject_conflicts(2);

        for _ in 0..2 {
            let mut tx = store.begin_transaction().await.unwrap();
            let err = tx.conditional_update("s", 0, 1).await.unwrap_err();
            assert!(err.is_conflict());
        }
        let mut tx = store.begin_transaction().await.unwrap();
        assert_eq!(tx.conditional_update("s", 0, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let store = MemoryCheckpointStore::new();
        store.inject_failure(StoreError::Backend("disk full".into()));

        let err = store.find_checkpoint("s").await.unwrap_err();
        assert_eq!(err, StoreError::Backend("disk full".into()));
        assert!(store.find_checkpoint("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = MemoryCheckpointStore::new();
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(store.is_closed());
        assert_eq!(store.stats().closes, 1);
        let err = store.begin_transaction().await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_closing_one_connection_leaves_others_open() {
        let connector = MemoryConnector::default();
        let a = connector.connect("memory://", "db").await.unwrap();
        let b = connector.connect("memory://", "db").await.unwrap();
        a.create_checkpoint("s", UNKNOWN_HEIGHT).await.unwrap();

        let mut stale = a.begin_transaction().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(!b.is_closed());
        let err = stale.conditional_update("s", 0, 1).await.unwrap_err();
        assert!(err.is_connection());

        let mut tx = b.begin_transaction().await.unwrap();
        assert_eq!(tx.conditional_update("s", 0, 3).await.unwrap(), 1);
        tx.commit().await.unwrap();
        assert_eq!(a.height("s"), Some(3));

        // A later connect does not reopen the closed handle.
        let c = connector.connect("memory://", "db").await.unwrap();
        assert!(a.is_closed());
        assert!(!c.is_closed());
        assert_eq!(connector.store().stats().closes, 1);
    }

    #[tokio::test]
    async fn test_connector_opens_fresh_handles_and_fails_on_demand() {
        let connector = MemoryConnector::default();
        connector.store().close().await.unwrap();

        let store = connector.connect("memory://", "db").await.unwrap();
        assert!(!store.is_closed());
        assert!(connector.store().is_closed());

        connector
            .store()
            .fail_next_connect(StoreError::Connection("refused".into()));
        let err = connector.connect("memory://", "db").await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(connector.store().stats().connects, 1);
    }
}
