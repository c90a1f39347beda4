//! # heightmark
//!
//! Checkpointed transactional writes for ingestion pipelines that consume a
//! monotonically increasing sequence of heights (blocks, batches, events).
//!
//! A caller connects once to learn where to resume, then submits
//! `(from, to, mutation)` triples in increasing height order. Each triple
//! runs the caller's writes and the checkpoint advance as one transaction,
//! retrying on write conflicts.
//!
//! ```text
//! CheckpointDatabase::connect ──► start height
//!        │
//!        ▼
//!  caller loop ──► advance(h) ──► AdvanceGuard ──┐
//!              └─► transact(from, to, f) ────────┴─► AdvanceEngine ──► CheckpointStore
//! ```
//!
//! ## Modules
//!
//! - [`database`] - Connection lifecycle (`connect` / `close`)
//! - [`engine`] - Transactional advance with conflict retry
//! - [`guard`] - In-process deduplication of repeated advances
//! - [`config`] - Connection and retry configuration
//! - [`error`] - Error taxonomy
//! - [`metrics`] - Atomic counters

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Connection and retry configuration.
pub mod config;

/// Error taxonomy.
pub mod error;

/// Advance metrics.
pub mod metrics;

/// Transactional advance engine.
pub mod engine;

/// Idempotent advance guard.
pub mod guard;

/// Connection lifecycle manager.
pub mod database;

pub use config::CheckpointConfig;
pub use database::CheckpointDatabase;
pub use engine::{mutation, AdvanceEngine, ConflictRetryPolicy, MutationFuture, TransactOutcome};
pub use error::CheckpointError;
pub use guard::AdvanceGuard;
pub use metrics::{CheckpointMetrics, MetricsSnapshot};

pub use heightmark_storage as storage;
pub use heightmark_storage::{
    CheckpointRecord, CheckpointStore, StoreConnector, StoreError, StoreTransaction,
    UNKNOWN_HEIGHT,
};
