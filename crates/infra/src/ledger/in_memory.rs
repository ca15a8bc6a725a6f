//! In-memory action ledger for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vidflow_core::JobId;
use vidflow_jobs::{ActionId, ActionOutcome, ActionRecord};

use super::{ActionLedger, Claim, LedgerError};

#[derive(Debug, Default)]
pub struct InMemoryActionLedger {
    records: RwLock<HashMap<(JobId, ActionId), ActionRecord>>,
}

impl InMemoryActionLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> LedgerError {
    LedgerError::Storage("action ledger lock poisoned".to_string())
}

#[async_trait]
impl ActionLedger for InMemoryActionLedger {
    async fn get(&self, job_id: JobId, action_id: &ActionId) -> Result<Option<ActionRecord>, LedgerError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&(job_id, action_id.clone())).cloned())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ActionRecord>, LedgerError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.action_id.cmp(&b.action_id));
        Ok(result)
    }

    async fn try_claim(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Claim, LedgerError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let key = (job_id, action_id.clone());

        let Some(existing) = records.get_mut(&key) else {
            let record = ActionRecord::claimed(job_id, action_id.clone(), now);
            records.insert(key, record.clone());
            return Ok(Claim::Acquired(record));
        };

        if existing.is_succeeded() {
            return Ok(Claim::AlreadySucceeded(existing.clone()));
        }
        if !existing.is_claimable(now, lease) {
            return Ok(Claim::InFlight(existing.clone()));
        }

        existing.outcome = ActionOutcome::InProgress;
        existing.updated_at = now;
        Ok(Claim::Acquired(existing.clone()))
    }

    async fn finish(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        outcome: ActionOutcome,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord, LedgerError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let record = records
            .get_mut(&(job_id, action_id.clone()))
            .ok_or_else(|| LedgerError::NotClaimed {
                job_id,
                action_id: action_id.clone(),
            })?;

        record.outcome = outcome;
        record.attempts = attempts;
        record.updated_at = now;
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidflow_jobs::{ActionKind, Platform};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn first_claim_wins_and_duplicates_see_it_in_flight() {
        let ledger = InMemoryActionLedger::new();
        let job = JobId::new();
        let action = ActionKind::Publish(Platform::TikTok).id();

        assert!(matches!(ledger.try_claim(job, &action, t(0), LEASE).await.unwrap(), Claim::Acquired(_)));
        assert!(matches!(ledger.try_claim(job, &action, t(1), LEASE).await.unwrap(), Claim::InFlight(_)));
    }

    #[tokio::test]
    async fn succeeded_actions_are_never_reclaimed() {
        let ledger = InMemoryActionLedger::new();
        let job = JobId::new();
        let action = ActionKind::Webhook.id();

        ledger.try_claim(job, &action, t(0), LEASE).await.unwrap();
        ledger
            .finish(job, &action, ActionOutcome::Succeeded { detail: None }, 1, t(1))
            .await
            .unwrap();

        let claim = ledger.try_claim(job, &action, t(1000), LEASE).await.unwrap();
        assert!(matches!(claim, Claim::AlreadySucceeded(r) if r.attempts == 1));
    }

    #[tokio::test]
    async fn failed_and_abandoned_claims_can_be_taken_over() {
        let ledger = InMemoryActionLedger::new();
        let job = JobId::new();
        let failed = ActionKind::Publish(Platform::Twitter).id();
        let abandoned = ActionKind::Publish(Platform::TikTok).id();

        ledger.try_claim(job, &failed, t(0), LEASE).await.unwrap();
        ledger
            .finish(job, &failed, ActionOutcome::Failed { error: "429".into() }, 3, t(1))
            .await
            .unwrap();
        let claim = ledger.try_claim(job, &failed, t(2), LEASE).await.unwrap();
        assert!(matches!(claim, Claim::Acquired(r) if r.attempts == 3 && r.outcome == ActionOutcome::InProgress));

        ledger.try_claim(job, &abandoned, t(0), LEASE).await.unwrap();
        assert!(matches!(ledger.try_claim(job, &abandoned, t(59), LEASE).await.unwrap(), Claim::InFlight(_)));
        assert!(matches!(ledger.try_claim(job, &abandoned, t(60), LEASE).await.unwrap(), Claim::Acquired(_)));

        assert_eq!(ledger.list_for_job(job).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn finishing_an_unclaimed_action_is_an_error() {
        let ledger = InMemoryActionLedger::new();
        let err = ledger
            .finish(JobId::new(), &ActionKind::Webhook.id(), ActionOutcome::InProgress, 0, t(0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotClaimed { .. }));
    }
}
