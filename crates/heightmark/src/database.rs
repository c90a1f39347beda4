//! Connection lifecycle for one checkpointed stream.
//!
//! [`CheckpointDatabase`] owns the storage connection, the advance engine
//! and the guard cursor. It is generic over a [`StoreConnector`] so the
//! same lifecycle runs against PostgreSQL or the in-memory store.
//!
//! ```rust,ignore
//! let mut db = CheckpointDatabase::new(config, PostgresConnector::new());
//! let resume_from = db.connect().await? + 1;
//! // ... ingest loop calling db.transact(..) / db.advance(..)
//! db.close().await?;
//! ```

use std::sync::Arc;

use heightmark_storage::{CheckpointStore, StoreConnector, UNKNOWN_HEIGHT};
use tracing::{info, warn};

use crate::config::CheckpointConfig;
use crate::engine::{AdvanceEngine, MutationFuture, TransactOutcome};
use crate::error::CheckpointError;
use crate::guard::AdvanceGuard;
use crate::metrics::{CheckpointMetrics, MetricsSnapshot};

/// Lifecycle manager for a stream's checkpoint.
///
/// States are `new -> connected -> closed`; `connect` may be called again
/// after `close`. Dropping a connected database releases the connection
/// without waiting for it to shut down cleanly.
pub struct CheckpointDatabase<C: StoreConnector> {
    config: CheckpointConfig,
    connector: C,
    engine: Option<AdvanceEngine<C::Store>>,
    guard: AdvanceGuard,
    start_height: Option<i64>,
    metrics: Arc<CheckpointMetrics>,
}

impl<C: StoreConnector> CheckpointDatabase<C> {
    /// Creates an unconnected database.
    pub fn new(config: CheckpointConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            engine: None,
            guard: AdvanceGuard::default(),
            start_height: None,
            metrics: Arc::new(CheckpointMetrics::new()),
        }
    }

    /// Connects and resolves the stream's stored height, creating the
    /// checkpoint record at [`UNKNOWN_HEIGHT`] if it does not exist yet.
    ///
    /// Returns the stored height; callers resume from the height after it.
    /// Connecting an already-connected database closes the old connection
    /// first. The guard cursor is reset on every connect.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Configuration`] for an empty database name or
    ///   stream identifier, or an unusable URL
    /// - [`CheckpointError::Connection`] if the connection cannot be
    ///   established within the configured timeout
    /// - [`CheckpointError::Storage`] if the connector's setup or the
    ///   checkpoint lookup or creation fails; a connection opened by this
    ///   call is closed before returning
    ///
    /// A failure to close the previous connection is logged and does not
    /// prevent the new one.
    pub async fn connect(&mut self) -> Result<i64, CheckpointError> {
        self.config.validate()?;

        if self.engine.is_some() {
            warn!(
                identifier = %self.config.stream_identifier,
                "connect called on a connected checkpoint database, reconnecting"
            );
            if let Err(err) = self.close().await {
                warn!(error = %err, "failed to close previous connection, reconnecting anyway");
            }
        }

        let connecting = self
            .connector
            .connect(&self.config.url, &self.config.database_name);
        let store = match tokio::time::timeout(self.config.connect_timeout, connecting).await {
            Ok(Ok(store)) => store,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(CheckpointError::Connection(format!(
                    "timed out after {:?} connecting to database '{}'",
                    self.config.connect_timeout, self.config.database_name
                )))
            }
        };

        let identifier = self.config.stream_identifier.clone();
        let height = match resolve_height(&store, &identifier).await {
            Ok(height) => height,
            Err(err) => {
                if let Err(close_err) = store.close().await {
                    warn!(error = %close_err, "failed to close store after lookup failure");
                }
                return Err(err);
            }
        };

        info!(
            identifier = %identifier,
            database = %self.config.database_name,
            height,
            "checkpoint database connected"
        );

        self.engine = Some(AdvanceEngine::new(
            Arc::new(store),
            identifier,
            self.config.retry_policy(),
            Arc::clone(&self.metrics),
        ));
        self.guard = AdvanceGuard::default();
        self.start_height = Some(height);
        Ok(height)
    }

    /// Applies `mutate` and advances the checkpoint from `from` to `to`
    /// atomically. See [`AdvanceEngine::transact`].
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotConnected`] before `connect` or after
    /// `close`; otherwise any error from [`AdvanceEngine::transact`].
    pub async fn transact<F>(
        &self,
        from: i64,
        to: i64,
        mutate: F,
    ) -> Result<TransactOutcome, CheckpointError>
    where
        F: for<'t> FnMut(
                &'t mut <C::Store as CheckpointStore>::Transaction,
            ) -> MutationFuture<'t>
            + Send,
    {
        self.engine()?.transact(from, to, mutate).await
    }

    /// Advances the checkpoint to `height` with no writes, skipping
    /// heights this connection already committed. See
    /// [`AdvanceGuard::advance_to`].
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotConnected`] before `connect` or after
    /// `close`; otherwise any error from [`AdvanceEngine::transact`].
    pub async fn advance(&mut self, height: i64) -> Result<Option<TransactOutcome>, CheckpointError> {
        let engine = self.engine.as_ref().ok_or(CheckpointError::NotConnected)?;
        self.guard.advance_to(engine, height).await
    }

    /// Closes the connection. Closing an unconnected or closed database is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to shut down; the database is
    /// considered closed either way.
    pub async fn close(&mut self) -> Result<(), CheckpointError> {
        let Some(engine) = self.engine.take() else {
            return Ok(());
        };
        engine.store().close().await?;
        info!(identifier = %self.config.stream_identifier, "checkpoint database closed");
        Ok(())
    }

    /// Returns `true` between a successful `connect` and `close`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.engine.is_some()
    }

    /// Height returned by the most recent successful `connect`.
    #[must_use]
    pub fn start_height(&self) -> Option<i64> {
        self.start_height
    }

    /// Guard cursor: the last height committed through `advance`.
    #[must_use]
    pub fn last_committed(&self) -> i64 {
        self.guard.last_committed()
    }

    /// Returns the connected store.
    #[must_use]
    pub fn store(&self) -> Option<&C::Store> {
        self.engine.as_ref().map(AdvanceEngine::store)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Returns a snapshot of the advance counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn engine(&self) -> Result<&AdvanceEngine<C::Store>, CheckpointError> {
        self.engine.as_ref().ok_or(CheckpointError::NotConnected)
    }
}

impl<C: StoreConnector + std::fmt::Debug> std::fmt::Debug for CheckpointDatabase<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointDatabase")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .field("connected", &self.is_connected())
            .field("start_height", &self.start_height)
            .field("last_committed", &self.guard.last_committed())
            .finish_non_exhaustive()
    }
}

async fn resolve_height<S: CheckpointStore>(store: &S, identifier: &str) -> Result<i64, CheckpointError> {
    if let Some(record) = store.find_checkpoint(identifier).await? {
        return Ok(record.height);
    }
    let record = store.create_checkpoint(identifier, UNKNOWN_HEIGHT).await?;
    info!(identifier, "created checkpoint record");
    Ok(record.height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use heightmark_storage::{MemoryCheckpointStore, MemoryConnector, StoreError};

    use crate::engine::mutation;

    fn database(store: &MemoryCheckpointStore) -> CheckpointDatabase<MemoryConnector> {
        CheckpointDatabase::new(
            CheckpointConfig::new("memory://", "indexer", "s"),
            MemoryConnector::new(store.clone()),
        )
    }

    #[tokio::test]
    async fn test_not_connected_before_connect() {
        let store = MemoryCheckpointStore::new();
        let mut db = database(&store);

        assert!(!db.is_connected());
        assert!(matches!(
            db.transact(0, 1, |_| mutation(async { Ok(()) })).await,
            Err(CheckpointError::NotConnected)
        ));
        assert!(matches!(db.advance(1).await, Err(CheckpointError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_resolves_then_closes() {
        let store = MemoryCheckpointStore::new();
        let mut db = database(&store);

        assert_eq!(db.connect().await.unwrap(), UNKNOWN_HEIGHT);
        assert_eq!(db.start_height(), Some(UNKNOWN_HEIGHT));
        assert!(db.store().is_some());

        db.close().await.unwrap();
        assert!(!db.is_connected());
        assert_eq!(store.stats().closes, 1);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resets_guard() {
        let store = MemoryCheckpointStore::new();
        let mut db = database(&store);
        db.connect().await.unwrap();
        db.advance(4).await.unwrap();
        assert_eq!(db.last_committed(), 4);

        assert_eq!(db.connect().await.unwrap(), 4);
        assert_eq!(db.last_committed(), UNKNOWN_HEIGHT);
        assert_eq!(store.stats().connects, 2);
        assert_eq!(store.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_connector_config_error_is_kept() {
        let store = MemoryCheckpointStore::new();
        store.fail_next_connect(StoreError::Configuration("bad url".into()));
        let mut db = database(&store);

        assert!(matches!(
            db.connect().await,
            Err(CheckpointError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_connector_errors_keep_their_kind() {
        let store = MemoryCheckpointStore::new();
        let mut db = database(&store);

        store.fail_next_connect(StoreError::Backend("permission denied for schema public".into()));
        let err = db.connect().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Storage(_)));
        assert_eq!(err.to_string(), "storage error: permission denied for schema public");

        store.fail_next_connect(StoreError::Connection("connection refused".into()));
        let err = db.connect().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Connection(_)));
        assert_eq!(err.to_string(), "connection failed: connection refused");
        assert!(!db.is_connected());
    }

    /// Memory store whose `close` always fails.
    #[derive(Debug, Clone)]
    struct UncloseableStore(MemoryCheckpointStore);

    #[async_trait::async_trait]
    impl CheckpointStore for UncloseableStore {
        type Transaction = <MemoryCheckpointStore as CheckpointStore>::Transaction;

        async fn find_checkpoint(
            &self,
            identifier: &str,
        ) -> Result<Option<heightmark_storage::CheckpointRecord>, StoreError> {
            self.0.find_checkpoint(identifier).await
        }

        async fn create_checkpoint(
            &self,
            identifier: &str,
            height: i64,
        ) -> Result<heightmark_storage::CheckpointRecord, StoreError> {
            self.0.create_checkpoint(identifier, height).await
        }

        async fn begin_transaction(&self) -> Result<Self::Transaction, StoreError> {
            self.0.begin_transaction().await
        }

        async fn close(&self) -> Result<(), StoreError> {
            Err(StoreError::Connection("socket already gone".into()))
        }
    }

    #[derive(Debug)]
    struct UncloseableConnector(MemoryConnector);

    #[async_trait::async_trait]
    impl StoreConnector for UncloseableConnector {
        type Store = UncloseableStore;

        async fn connect(&self, url: &str, database_name: &str) -> Result<UncloseableStore, StoreError> {
            self.0.connect(url, database_name).await.map(UncloseableStore)
        }
    }

    #[tokio::test]
    async fn test_reconnect_survives_failed_close() {
        let store = MemoryCheckpointStore::new();
        let mut db = CheckpointDatabase::new(
            CheckpointConfig::new("memory://", "indexer", "s"),
            UncloseableConnector(MemoryConnector::new(store.clone())),
        );
        db.connect().await.unwrap();
        db.advance(6).await.unwrap();

        assert_eq!(db.connect().await.unwrap(), 6);
        assert!(db.is_connected());
        assert_eq!(store.stats().connects, 2);
    }

    #[derive(Debug)]
    struct StalledConnector;

    #[async_trait::async_trait]
    impl StoreConnector for StalledConnector {
        type Store = MemoryCheckpointStore;

        async fn connect(&self, _url: &str, _database_name: &str) -> Result<MemoryCheckpointStore, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mut config = CheckpointConfig::new("memory://", "indexer", "s");
        config.connect_timeout = Duration::from_millis(200);
        let mut db = CheckpointDatabase::new(config, StalledConnector);

        let err = db.connect().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Connection(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
