//! Job store decorator that publishes a notification per committed state change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use vidflow_core::{ExpectedVersion, JobId};
use vidflow_events::{NotificationBroker, NotificationEvent};
use vidflow_jobs::{Job, JobState};

use crate::config::QueueLimits;

use super::store::{JobCounts, JobStore, JobStoreError, JobTransition};

/// Wraps a store and a broker.
///
/// 1) The inner store commits (durable step)
/// 2) The committed state is published (best-effort; at-least-once acceptable)
///
/// Publishing never fails the write: the job store stays the source of truth
/// and consumers reconcile against it. `polling -> polling` retries are not
/// published.
#[derive(Debug, Clone)]
pub struct PublishingJobStore<S, B> {
    store: S,
    broker: B,
}

impl<S, B> PublishingJobStore<S, B> {
    pub fn new(store: S, broker: B) -> Self {
        Self { store, broker }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.broker)
    }
}

#[async_trait]
impl<S, B> JobStore for PublishingJobStore<S, B>
where
    S: JobStore,
    B: NotificationBroker<NotificationEvent>,
{
    fn queue_limits(&self) -> QueueLimits {
        self.store.queue_limits()
    }

    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        self.store.insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(id).await
    }

    async fn compare_and_set(&self, job: Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        self.store.compare_and_set(job, expected).await
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.store.list_by_state(state, limit).await
    }

    async fn due_for_poll(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.store.due_for_poll(now, limit).await
    }

    async fn list_updated_since(
        &self,
        state: JobState,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.store.list_updated_since(state, since, limit).await
    }

    async fn counts(&self) -> Result<JobCounts, JobStoreError> {
        self.store.counts().await
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.store.purge_terminal_before(cutoff).await
    }

    fn after_commit(&self, transition: &JobTransition) {
        self.store.after_commit(transition);

        if !transition.is_state_change() {
            return;
        }

        let event = NotificationEvent::for_job(&transition.job, transition.job.updated_at);
        if let Err(err) = self.broker.publish(event) {
            warn!(
                job_id = %transition.job.id,
                state = %transition.job.state,
                error = %err,
                "failed to publish job notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vidflow_core::Priority;
    use vidflow_events::{Channel, InMemoryBroker};
    use vidflow_jobs::{NewJob, PollPolicy, PollStatus};

    use crate::jobs::InMemoryJobStore;

    #[tokio::test]
    async fn publishes_state_changes_but_not_poll_retries() {
        let broker = Arc::new(InMemoryBroker::<NotificationEvent>::new());
        let store = PublishingJobStore::new(InMemoryJobStore::new(), broker.clone());
        let mut all = broker.subscribe(&Channel::all_jobs());
        let mut completed = broker.subscribe(&Channel::for_state(JobState::Completed));
        let policy = PollPolicy::default();
        let now = Utc::now();

        let id = store
            .create(NewJob::new("X", Priority::NORMAL), now)
            .await
            .unwrap()
            .job
            .id;
        store.submit(id, "H".into(), now).await.unwrap();
        store.begin_polling(id, now).await.unwrap();
        for _ in 0..3 {
            store
                .record_poll_result(id, PollStatus::StillProcessing, &policy, now)
                .await
                .unwrap();
        }
        store
            .record_poll_result(id, PollStatus::Succeeded { result_ref: "R".into() }, &policy, now)
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = all.try_recv() {
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![
                JobState::Pending,
                JobState::Submitted,
                JobState::Polling,
                JobState::Completed,
            ]
        );

        let event = completed.try_recv().unwrap();
        assert_eq!((event.job_id, event.result_ref.as_deref()), (id, Some("R")));
        assert!(completed.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_writes_publish_nothing() {
        let broker = Arc::new(InMemoryBroker::<NotificationEvent>::new());
        let store = PublishingJobStore::new(InMemoryJobStore::new(), broker.clone());
        let mut all = broker.subscribe(&Channel::all_jobs());
        let now = Utc::now();

        let id = store.create(NewJob::new("X", Priority::LOW), now).await.unwrap().job.id;
        store.fail(id, "cancelled".into(), now).await.unwrap();
        assert!(store.submit(id, "late".into(), now).await.is_err());

        assert_eq!(all.try_recv().unwrap().state, JobState::Pending);
        let failed = all.try_recv().unwrap();
        assert_eq!(failed.error.as_deref(), Some("cancelled"));
        assert!(all.try_recv().is_err());
    }
}
