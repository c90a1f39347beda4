//! Transactional advance engine.
//!
//! [`AdvanceEngine::transact`] runs the checkpoint update and a caller's
//! mutation in one storage transaction:
//!
//! 1. `begin_transaction`
//! 2. `conditional_update(identifier, from, to)`: `height < from` guards
//!    against regressing the checkpoint
//! 3. `mutate(&mut transaction)`: the caller's own writes
//! 4. `commit`
//!
//! A [`CheckpointError::Conflict`] from any step rolls back and restarts at
//! step 1, up to [`ConflictRetryPolicy::max_retries`] times. Every other
//! error rolls back and propagates immediately.
//!
//! A conditional update that matches nothing is not an error: the mutation
//! still runs and commits. Callers own the ordering of their ranges.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use heightmark_storage::{CheckpointStore, StoreTransaction};
use tracing::{debug, error, warn};

use crate::error::CheckpointError;
use crate::metrics::CheckpointMetrics;

/// Future returned by a mutation callback.
pub type MutationFuture<'t> = BoxFuture<'t, Result<(), CheckpointError>>;

/// Boxes an async block into a [`MutationFuture`].
///
/// ```rust,ignore
/// let blocks = Arc::new(blocks);
/// db.transact(from, to, move |tx| {
///     let blocks = Arc::clone(&blocks);
///     mutation(async move {
///         tx.upsert_all(&blocks).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// ```
pub fn mutation<'t, Fut>(fut: Fut) -> MutationFuture<'t>
where
    Fut: Future<Output = Result<(), CheckpointError>> + Send + 't,
{
    Box::pin(fut)
}

/// How write conflicts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Sleep before each retry.
    pub backoff: Duration,
}

impl ConflictRetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Total attempts, the first one included.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

/// Result of a successful [`AdvanceEngine::transact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactOutcome {
    /// Whether the stored height moved to `to`. `false` means the stored
    /// height was already at or above `from`.
    pub advanced: bool,
    /// Attempts made, the successful one included.
    pub attempts: u32,
}

/// Runs mutations and checkpoint advances atomically for one stream.
pub struct AdvanceEngine<S: CheckpointStore> {
    store: Arc<S>,
    identifier: String,
    policy: ConflictRetryPolicy,
    metrics: Arc<CheckpointMetrics>,
}

impl<S: CheckpointStore> AdvanceEngine<S> {
    /// Creates an engine advancing `identifier` in `store`.
    pub fn new(
        store: Arc<S>,
        identifier: impl Into<String>,
        policy: ConflictRetryPolicy,
        metrics: Arc<CheckpointMetrics>,
    ) -> Self {
        Self {
            store,
            identifier: identifier.into(),
            policy,
            metrics,
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the stream identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> ConflictRetryPolicy {
        self.policy
    }

    /// Returns the shared metrics.
    #[must_use]
    pub fn metrics(&self) -> &CheckpointMetrics {
        &self.metrics
    }

    /// Applies `mutate` and advances the checkpoint to `to` in one
    /// transaction, retrying on write conflicts.
    ///
    /// `mutate` is called once per attempt with the transaction as its write
    /// handle, so it must be safe to run again after a rolled-back attempt.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::InvalidRange`] if `from > to` or `from < 0`
    /// - [`CheckpointError::Conflict`] once the retry budget is exhausted
    /// - any other error from storage or `mutate`, unchanged, after rollback
    pub async fn transact<F>(
        &self,
        from: i64,
        to: i64,
        mut mutate: F,
    ) -> Result<TransactOutcome, CheckpointError>
    where
        F: for<'t> FnMut(&'t mut S::Transaction) -> MutationFuture<'t> + Send,
    {
        if from < 0 || from > to {
            return Err(CheckpointError::InvalidRange { from, to });
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(from, to, &mut mutate).await {
                Ok(advanced) => {
                    self.metrics.record_commit(advanced);
                    debug!(
                        identifier = %self.identifier,
                        from,
                        to,
                        advanced,
                        attempts,
                        "checkpoint transaction committed"
                    );
                    return Ok(TransactOutcome { advanced, attempts });
                }
                Err(err) if err.is_retryable() && attempts <= self.policy.max_retries => {
                    self.metrics.record_conflict_retry();
                    warn!(
                        identifier = %self.identifier,
                        from,
                        to,
                        attempt = attempts,
                        error = %err,
                        "write conflict, retrying checkpoint transaction"
                    );
                    if !self.policy.backoff.is_zero() {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
                Err(err) => {
                    self.metrics.record_failure();
                    if err.is_retryable() {
                        error!(
                            identifier = %self.identifier,
                            from,
                            to,
                            attempts,
                            "checkpoint transaction still conflicting after retries"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One begin / update / mutate / commit pass. Returns whether the
    /// conditional update matched.
    async fn attempt<F>(&self, from: i64, to: i64, mutate: &mut F) -> Result<bool, CheckpointError>
    where
        F: for<'t> FnMut(&'t mut S::Transaction) -> MutationFuture<'t> + Send,
    {
        let mut tx = self.store.begin_transaction().await?;

        let matched = match tx.conditional_update(&self.identifier, from, to).await {
            Ok(rows) => rows > 0,
            Err(err) => return Err(Self::abort(tx, err.into()).await),
        };

        let mutated = mutate(&mut tx).await;
        if let Err(err) = mutated {
            return Err(Self::abort(tx, err).await);
        }

        tx.commit().await?;
        Ok(matched)
    }

    async fn abort(tx: S::Transaction, err: CheckpointError) -> CheckpointError {
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "rollback after failed attempt also failed");
        }
        err
    }
}

impl<S: CheckpointStore> std::fmt::Debug for AdvanceEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvanceEngine")
            .field("identifier", &self.identifier)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
