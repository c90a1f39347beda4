//! `PostgreSQL` checkpoint store.
//!
//! Stores one row per stream in `heightmark_checkpoints` and runs every
//! advance inside a `SERIALIZABLE` transaction on a single connection, so
//! concurrent writers from other processes surface as SQLSTATE `40001`
//! ([`StoreError::Conflict`](crate::StoreError::Conflict)).
//!
//! # Module Structure
//!
//! - [`sql`] - Statement text and builders
//! - [`entity`] - The [`Entity`] trait used by the upsert helpers
//! - [`store`] - [`PostgresConnector`], [`PostgresCheckpointStore`], [`PostgresTransaction`]
//!
//! # Usage
//!
//! ```rust,ignore
//! use heightmark_storage::postgres::PostgresConnector;
//! use heightmark_storage::StoreConnector;
//!
//! let store = PostgresConnector::new()
//!     .connect("postgres://ingest@localhost", "indexer")
//!     .await?;
//! ```

pub mod entity;
pub mod sql;
pub mod store;

pub use entity::Entity;
pub use store::{PostgresCheckpointStore, PostgresConnector, PostgresTransaction};

use tokio_postgres::error::SqlState;

use crate::error::StoreError;

/// SQLSTATE reported when a serializable transaction loses a race.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// Classifies a `tokio-postgres` error.
pub(crate) fn classify(err: &tokio_postgres::Error) -> StoreError {
    classify_code(err.code().map(SqlState::code), err.is_closed(), err.to_string())
}

/// Classification rule, separated from the error type so it can be tested
/// without a server.
fn classify_code(code: Option<&str>, closed: bool, message: String) -> StoreError {
    match code {
        Some(SERIALIZATION_FAILURE) => StoreError::Conflict(message),
        _ if closed => StoreError::Connection(message),
        _ => StoreError::Backend(message),
    }
}
