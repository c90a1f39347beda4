//! `PostgreSQL` connector, store and transaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info, warn};

use super::entity::Entity;
use super::sql::{
    build_checkpoint_schema_sql, build_conditional_update_sql, build_insert_checkpoint_sql,
    build_select_checkpoint_sql, build_upsert_sql, BEGIN_SQL, COMMIT_SQL, ROLLBACK_SQL,
};
use super::classify;
use crate::error::StoreError;
use crate::record::CheckpointRecord;
use crate::store::{CheckpointStore, StoreConnector, StoreTransaction};

/// Opens [`PostgresCheckpointStore`] connections.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    connect_timeout: Duration,
}

impl PostgresConnector {
    /// Creates a connector with a 10 second connect timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for PostgresConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreConnector for PostgresConnector {
    type Store = PostgresCheckpointStore;

    async fn connect(
        &self,
        url: &str,
        database_name: &str,
    ) -> Result<PostgresCheckpointStore, StoreError> {
        let mut config: tokio_postgres::Config = url
            .parse()
            .map_err(|e| StoreError::Configuration(format!("invalid PostgreSQL url: {e}")))?;
        config.dbname(database_name);
        config.connect_timeout(self.connect_timeout);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| StoreError::Connection(format!("PostgreSQL connect: {e}")))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL checkpoint connection error");
            }
        });

        let store = PostgresCheckpointStore::new(client, driver);
        store.ensure_schema().await?;

        info!(database = database_name, "connected PostgreSQL checkpoint store");
        Ok(store)
    }
}

/// Connection state shared between the store and its open transaction.
struct PgSession {
    client: Option<Client>,
    /// A transaction was opened and never committed or rolled back.
    dirty: bool,
}

impl PgSession {
    fn client(&self) -> Result<&Client, StoreError> {
        self.client
            .as_ref()
            .ok_or_else(|| StoreError::Connection("PostgreSQL connection closed".into()))
    }

    async fn reset_if_dirty(&mut self) -> Result<(), StoreError> {
        if self.dirty {
            warn!("rolling back abandoned checkpoint transaction");
            self.client()?
                .batch_execute(ROLLBACK_SQL)
                .await
                .map_err(|e| classify(&e))?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Checkpoint store over a single `PostgreSQL` connection.
///
/// The connection is held exclusively by an open [`PostgresTransaction`];
/// lookups issued meanwhile wait for it to finish.
pub struct PostgresCheckpointStore {
    session: Arc<Mutex<PgSession>>,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PostgresCheckpointStore {
    fn new(client: Client, driver: JoinHandle<()>) -> Self {
        Self {
            session: Arc::new(Mutex::new(PgSession {
                client: Some(client),
                dirty: false,
            })),
            driver: parking_lot::Mutex::new(Some(driver)),
        }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let session = self.session.lock().await;
        session
            .client()?
            .batch_execute(build_checkpoint_schema_sql())
            .await
            .map_err(|e| classify(&e))
    }
}

fn record_from_row(row: &Row) -> Result<CheckpointRecord, StoreError> {
    let decode = |e: tokio_postgres::Error| StoreError::Backend(format!("decode checkpoint: {e}"));
    Ok(CheckpointRecord {
        identifier: row.try_get("identifier").map_err(decode)?,
        height: row.try_get("height").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    type Transaction = PostgresTransaction;

    async fn find_checkpoint(
        &self,
        identifier: &str,
    ) -> Result<Option<CheckpointRecord>, StoreError> {
        let mut session = self.session.lock().await;
        session.reset_if_dirty().await?;
        let row = session
            .client()?
            .query_opt(build_select_checkpoint_sql(), &[&identifier])
            .await
            .map_err(|e| classify(&e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn create_checkpoint(
        &self,
        identifier: &str,
        height: i64,
    ) -> Result<CheckpointRecord, StoreError> {
        let mut session = self.session.lock().await;
        session.reset_if_dirty().await?;
        let client = session.client()?;

        let inserted = client
            .execute(build_insert_checkpoint_sql(), &[&identifier, &height])
            .await
            .map_err(|e| classify(&e))?;
        if inserted == 0 {
            debug!(identifier, "checkpoint record already existed");
        }

        let row = client
            .query_opt(build_select_checkpoint_sql(), &[&identifier])
            .await
            .map_err(|e| classify(&e))?
            .ok_or_else(|| {
                StoreError::Backend(format!("checkpoint '{identifier}' missing after insert"))
            })?;
        record_from_row(&row)
    }

    async fn begin_transaction(&self) -> Result<PostgresTransaction, StoreError> {
        let mut session = Arc::clone(&self.session).lock_owned().await;
        session.reset_if_dirty().await?;
        session
            .client()?
            .batch_execute(BEGIN_SQL)
            .await
            .map_err(|e| classify(&e))?;
        session.dirty = true;
        Ok(PostgresTransaction { session })
    }

    async fn close(&self) -> Result<(), StoreError> {
        let client = self.session.lock().await.client.take();
        let driver = self.driver.lock().take();
        drop(client);

        if let Some(driver) = driver {
            driver
                .await
                .map_err(|e| StoreError::Connection(format!("connection task: {e}")))?;
            info!("closed PostgreSQL checkpoint store");
        }
        Ok(())
    }
}

impl Drop for PostgresCheckpointStore {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for PostgresCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCheckpointStore")
            .field("driver_running", &self.driver.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Serializable transaction on the store's connection, and the caller's
/// write handle inside an advance.
pub struct PostgresTransaction {
    session: OwnedMutexGuard<PgSession>,
}

impl PostgresTransaction {
    /// Executes a statement, returning the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`].
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, StoreError> {
        self.session
            .client()?
            .execute(sql, params)
            .await
            .map_err(|e| classify(&e))
    }

    /// Runs a query, returning all rows.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`].
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, StoreError> {
        self.session
            .client()?
            .query(sql, params)
            .await
            .map_err(|e| classify(&e))
    }

    /// Inserts `entity`, or updates its non-key columns if a row with the
    /// same key exists.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`].
    pub async fn upsert<E: Entity>(&mut self, entity: &E) -> Result<u64, StoreError> {
        let sql = build_upsert_sql(E::TABLE, E::COLUMNS, E::KEY_COLUMNS);
        self.execute(&sql, &entity.values()).await
    }

    /// Upserts every entity with one prepared statement.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] on the first failing row.
    pub async fn upsert_all<E: Entity>(&mut self, entities: &[E]) -> Result<u64, StoreError> {
        if entities.is_empty() {
            return Ok(0);
        }
        let client = self.session.client()?;
        let sql = build_upsert_sql(E::TABLE, E::COLUMNS, E::KEY_COLUMNS);
        let statement = client.prepare(&sql).await.map_err(|e| classify(&e))?;

        let mut affected = 0;
        for entity in entities {
            affected += client
                .execute(&statement, &entity.values())
                .await
                .map_err(|e| classify(&e))?;
        }
        debug!(table = E::TABLE, rows = entities.len(), "bulk upsert");
        Ok(affected)
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn conditional_update(
        &mut self,
        identifier: &str,
        from: i64,
        to: i64,
    ) -> Result<u64, StoreError> {
        self.execute(build_conditional_update_sql(), &[&identifier, &from, &to])
            .await
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut session = self.session;
        session
            .client()?
            .batch_execute(COMMIT_SQL)
            .await
            .map_err(|e| classify(&e))?;
        session.dirty = false;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        let mut session = self.session;
        session
            .client()?
            .batch_execute(ROLLBACK_SQL)
            .await
            .map_err(|e| classify(&e))?;
        session.dirty = false;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("open", &self.session.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_defaults() {
        let connector = PostgresConnector::default();
        assert_eq!(connector.connect_timeout(), Duration::from_secs(10));

        let connector = connector.with_connect_timeout(Duration::from_millis(250));
        assert_eq!(connector.connect_timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let err = PostgresConnector::new()
            .connect("postgres://host:notaport", "db")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)), "{err}");
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_connection_error() {
        // Port 1 on loopback refuses connections.
        let err = PostgresConnector::new()
            .with_connect_timeout(Duration::from_millis(500))
            .connect("postgres://heightmark@127.0.0.1:1", "db")
            .await
            .unwrap_err();
        assert!(err.is_connection(), "{err}");
    }
}
