//! Advance metrics.
//!
//! [`CheckpointMetrics`] is shared between the database, engine and guard
//! through an `Arc` and updated with relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for checkpoint advances.
#[derive(Debug, Default)]
pub struct CheckpointMetrics {
    /// Transactions committed.
    pub transactions_committed: AtomicU64,

    /// Attempts abandoned on a write conflict and retried.
    pub conflicts_retried: AtomicU64,

    /// `transact` calls that returned an error.
    pub transactions_failed: AtomicU64,

    /// Commits whose conditional update moved the checkpoint.
    pub checkpoint_advances: AtomicU64,

    /// Commits whose conditional update matched nothing.
    pub checkpoint_noops: AtomicU64,

    /// `advance` calls skipped by the guard.
    pub advances_skipped: AtomicU64,
}

impl CheckpointMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a commit; `advanced` is whether the checkpoint moved.
    pub fn record_commit(&self, advanced: bool) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        if advanced {
            self.checkpoint_advances.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkpoint_noops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a conflict that will be retried.
    pub fn record_conflict_retry(&self) {
        self.conflicts_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed `transact`.
    pub fn record_failure(&self) {
        self.transactions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a guard short-circuit.
    pub fn record_skip(&self) {
        self.advances_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            conflicts_retried: self.conflicts_retried.load(Ordering::Relaxed),
            transactions_failed: self.transactions_failed.load(Ordering::Relaxed),
            checkpoint_advances: self.checkpoint_advances.load(Ordering::Relaxed),
            checkpoint_noops: self.checkpoint_noops.load(Ordering::Relaxed),
            advances_skipped: self.advances_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CheckpointMetrics`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transactions_committed: u64,
    pub conflicts_retried: u64,
    pub transactions_failed: u64,
    pub checkpoint_advances: u64,
    pub checkpoint_noops: u64,
    pub advances_skipped: u64,
}
