//! Idempotent advance guard.
//!
//! Remembers the last height this process committed so that repeated
//! `advance(h)` calls for the same `h` skip the database entirely. The
//! cursor lives in memory only and starts at [`UNKNOWN_HEIGHT`] on every
//! connect; it never consults the stored checkpoint.

use futures::FutureExt;
use heightmark_storage::{CheckpointStore, UNKNOWN_HEIGHT};
use tracing::trace;

use crate::engine::{AdvanceEngine, TransactOutcome};
use crate::error::CheckpointError;

/// In-process cursor over committed advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceGuard {
    last_committed: i64,
}

impl Default for AdvanceGuard {
    fn default() -> Self {
        Self::new(UNKNOWN_HEIGHT)
    }
}

impl AdvanceGuard {
    /// Creates a guard whose cursor starts at `initial`.
    #[must_use]
    pub fn new(initial: i64) -> Self {
        Self {
            last_committed: initial,
        }
    }

    /// Last height committed through this guard.
    #[must_use]
    pub fn last_committed(&self) -> i64 {
        self.last_committed
    }

    /// Advances the checkpoint to `height` with no accompanying writes.
    ///
    /// Returns `Ok(None)` without touching storage when `height` equals the
    /// cursor. Otherwise runs `transact(height, height)` and moves the cursor
    /// to `height` once it commits, whether or not the stored height changed.
    /// On error the cursor is left as it was.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`AdvanceEngine::transact`].
    pub async fn advance_to<S: CheckpointStore>(
        &mut self,
        engine: &AdvanceEngine<S>,
        height: i64,
    ) -> Result<Option<TransactOutcome>, CheckpointError> {
        if height == self.last_committed {
            engine.metrics().record_skip();
            trace!(identifier = engine.identifier(), height, "advance already committed");
            return Ok(None);
        }

        let outcome = engine
            .transact(height, height, |_| futures::future::ok(()).boxed())
            .await?;
        self.last_committed = height;
        Ok(Some(outcome))
    }
}
