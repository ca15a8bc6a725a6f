//! Idempotency ledger: one `ActionRecord` per (job, action) pair.
//!
//! The dispatcher claims a pair before running its side effect and records the
//! outcome afterwards. Claims are atomic per key, so duplicate events racing
//! on the same pair cannot both execute it.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vidflow_core::JobId;
use vidflow_jobs::{ActionId, ActionOutcome, ActionRecord};

pub use in_memory::InMemoryActionLedger;
pub use postgres::PostgresActionLedger;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("no claim recorded for job {job_id}, action {action_id}")]
    NotClaimed { job_id: JobId, action_id: ActionId },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of trying to claim a (job, action) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the pair and must execute and `finish` it.
    Acquired(ActionRecord),
    /// Already done; executing again would duplicate the side effect.
    AlreadySucceeded(ActionRecord),
    /// Another dispatcher holds a live claim.
    InFlight(ActionRecord),
}

#[async_trait]
pub trait ActionLedger: Send + Sync {
    async fn get(&self, job_id: JobId, action_id: &ActionId) -> Result<Option<ActionRecord>, LedgerError>;

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ActionRecord>, LedgerError>;

    /// Claim the pair for execution.
    ///
    /// - no record: created `in_progress`, `Acquired`
    /// - `failed`, or `in_progress` untouched for `lease`: taken over, `Acquired`
    /// - `succeeded`: `AlreadySucceeded`
    /// - live `in_progress`: `InFlight`
    async fn try_claim(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Claim, LedgerError>;

    /// Record the outcome of a claimed pair.
    async fn finish(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        outcome: ActionOutcome,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord, LedgerError>;
}

#[async_trait]
impl<T> ActionLedger for std::sync::Arc<T>
where
    T: ActionLedger + ?Sized,
{
    async fn get(&self, job_id: JobId, action_id: &ActionId) -> Result<Option<ActionRecord>, LedgerError> {
        (**self).get(job_id, action_id).await
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ActionRecord>, LedgerError> {
        (**self).list_for_job(job_id).await
    }

    async fn try_claim(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Claim, LedgerError> {
        (**self).try_claim(job_id, action_id, now, lease).await
    }

    async fn finish(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        outcome: ActionOutcome,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord, LedgerError> {
        (**self).finish(job_id, action_id, outcome, attempts, now).await
    }
}
