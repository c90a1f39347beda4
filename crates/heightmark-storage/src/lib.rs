//! # `heightmark` Storage
//!
//! The checkpoint store: one durable record per stream identifier holding the
//! last fully applied height, and the narrow set of storage capabilities the
//! advance protocol needs from a backend.
//!
//! ## Backends
//!
//! - [`postgres`] - `PostgreSQL` via `tokio-postgres` (feature `postgres`)
//! - [`memory`] - In-process store with optimistic concurrency, used by tests
//!   and embedders that do not need durability

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Storage error classification.
pub mod error;

/// Checkpoint record type.
pub mod record;

/// Storage capability traits (`StoreConnector`, `CheckpointStore`, `StoreTransaction`).
pub mod store;

/// In-memory checkpoint store.
pub mod memory;

/// `PostgreSQL` checkpoint store.
#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::StoreError;
pub use memory::{MemoryCheckpointStore, MemoryConnector, MemoryTransaction};
pub use record::{CheckpointRecord, UNKNOWN_HEIGHT};
pub use store::{CheckpointStore, StoreConnector, StoreTransaction};
