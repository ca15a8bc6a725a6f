//! Job store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use vidflow_core::{ExpectedVersion, JobId};
use vidflow_jobs::{Job, JobState, NewJob, PollPolicy, PollStatus, TransitionError};

use crate::config::QueueLimits;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    /// Another writer committed first; reread before retrying.
    #[error("job {job_id}: stale state (expected version {expected}, found {actual})")]
    StaleState {
        job_id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("queue full: {pending} pending jobs (max {max})")]
    QueueFull { pending: usize, max: usize },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    fn from_transition(job_id: JobId, err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidTransition { from, to } => {
                Self::InvalidTransition { job_id, from, to }
            }
        }
    }

    /// Concurrency conflicts the caller resolves by rereading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StaleState { .. } | Self::InvalidTransition { .. })
    }
}

/// Per-state job totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub submitted: usize,
    pub polling: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Submitted => self.submitted,
            JobState::Polling => self.polling,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn add(&mut self, state: JobState, n: usize) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Submitted => &mut self.submitted,
            JobState::Polling => &mut self.polling,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        };
        *slot += n;
    }

    pub fn total(&self) -> usize {
        self.pending + self.submitted + self.polling + self.completed + self.failed
    }
}

/// A committed write: the state before it (`None` on creation) and the job after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub from: Option<JobState>,
    pub job: Job,
}

impl JobTransition {
    /// False for self-loops (`polling -> polling`).
    pub fn is_state_change(&self) -> bool {
        self.from != Some(self.job.state)
    }
}

/// Job store abstraction.
///
/// Implementations provide the primitives; the lifecycle operations are
/// provided on top of them and behave identically for every backend.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Back-pressure applied by `create`.
    fn queue_limits(&self) -> QueueLimits;

    /// Persist a new job. Fails with `AlreadyExists` on an id collision.
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Replace the stored job iff its version matches `expected`.
    ///
    /// Returns the committed job with its version incremented.
    async fn compare_and_set(&self, job: Job, expected: ExpectedVersion) -> Result<Job, JobStoreError>;

    /// Jobs in `state`, highest priority first, then oldest first.
    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Submitted/polling jobs whose next poll time has elapsed, most overdue first.
    async fn due_for_poll(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs in `state` updated at or after `since`, oldest update first.
    async fn list_updated_since(
        &self,
        state: JobState,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn counts(&self) -> Result<JobCounts, JobStoreError>;

    /// Delete terminal jobs last updated before `cutoff`. Returns the number removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Hook invoked after every committed lifecycle write.
    fn after_commit(&self, _transition: &JobTransition) {}

    /// Create a `pending` job, refusing when the pending queue is full.
    ///
    /// The queue check and the insert are separate steps, so concurrent
    /// creators may overshoot the limit slightly.
    async fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<JobTransition, JobStoreError> {
        let limits = self.queue_limits();
        let pending = self.counts().await?.pending;
        if pending >= limits.max_pending {
            return Err(JobStoreError::QueueFull {
                pending,
                max: limits.max_pending,
            });
        }
        if pending >= limits.warning_threshold {
            warn!(pending, max = limits.max_pending, "render queue is filling up");
        }

        let job = self.insert(Job::create(new, now)).await?;
        debug!(job_id = %job.id, priority = %job.priority, "job created");

        let transition = JobTransition { from: None, job };
        self.after_commit(&transition);
        Ok(transition)
    }

    /// `pending -> submitted`, recording the external render handle.
    async fn submit(&self, id: JobId, handle: String, now: DateTime<Utc>) -> Result<JobTransition, JobStoreError> {
        apply_transition(self, id, move |job| job.submit(handle, now)).await
    }

    /// `submitted -> polling`.
    async fn begin_polling(&self, id: JobId, now: DateTime<Utc>) -> Result<JobTransition, JobStoreError> {
        apply_transition(self, id, move |job| job.begin_polling(now)).await
    }

    /// Fold a classified status check into the job (see `Job::apply_poll`).
    async fn record_poll_result(
        &self,
        id: JobId,
        status: PollStatus,
        policy: &PollPolicy,
        now: DateTime<Utc>,
    ) -> Result<JobTransition, JobStoreError> {
        apply_transition(self, id, move |job| job.apply_poll(&status, policy, now)).await
    }

    /// Force-fail a job whose render exceeded its timeout.
    async fn time_out(&self, id: JobId, policy: &PollPolicy, now: DateTime<Utc>) -> Result<JobTransition, JobStoreError> {
        apply_transition(self, id, move |job| job.time_out(policy, now)).await
    }

    /// Any non-terminal state `-> failed` (operator override, permanent error).
    async fn fail(&self, id: JobId, reason: String, now: DateTime<Utc>) -> Result<JobTransition, JobStoreError> {
        apply_transition(self, id, move |job| job.fail(reason, now)).await
    }
}

/// Read, transition, compare-and-set.
///
/// The transition runs against the version read here; if another writer
/// commits in between, the write is rejected with `StaleState`.
pub async fn apply_transition<S, F>(store: &S, id: JobId, transition: F) -> Result<JobTransition, JobStoreError>
where
    S: JobStore + ?Sized,
    F: FnOnce(&Job) -> Result<Job, TransitionError> + Send,
{
    let current = store.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
    let next = transition(&current).map_err(|e| JobStoreError::from_transition(id, e))?;
    let job = store
        .compare_and_set(next, ExpectedVersion::Exact(current.version))
        .await?;

    debug!(job_id = %id, from = %current.state, to = %job.state, version = job.version, "job transition committed");

    let transition = JobTransition {
        from: Some(current.state),
        job,
    };
    store.after_commit(&transition);
    Ok(transition)
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn queue_limits(&self) -> QueueLimits {
        (**self).queue_limits()
    }

    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn compare_and_set(&self, job: Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        (**self).compare_and_set(job, expected).await
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_state(state, limit).await
    }

    async fn due_for_poll(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).due_for_poll(now, limit).await
    }

    async fn list_updated_since(
        &self,
        state: JobState,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_updated_since(state, since, limit).await
    }

    async fn counts(&self) -> Result<JobCounts, JobStoreError> {
        (**self).counts().await
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).purge_terminal_before(cutoff).await
    }

    fn after_commit(&self, transition: &JobTransition) {
        (**self).after_commit(transition)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    limits: QueueLimits,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_limits(mut self, limits: QueueLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn queue_limits(&self) -> QueueLimits {
        self.limits
    }

    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&id).cloned())
    }

    async fn compare_and_set(&self, mut job: Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let stored = jobs.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;

        if !expected.matches(stored.version) {
            return Err(JobStoreError::StaleState {
                job_id: job.id,
                expected,
                actual: stored.version,
            });
        }

        job.version = stored.version + 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.state == state).cloned().collect();

        result.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        result.truncate(limit);
        Ok(result)
    }

    async fn due_for_poll(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.is_due_for_poll(now)).cloned().collect();

        result.sort_by_key(|j| (j.next_poll_at, j.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_updated_since(
        &self,
        state: JobState,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.state == state && j.updated_at >= since)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.updated_at, j.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn counts(&self) -> Result<JobCounts, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state.is_terminal() && j.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidflow_core::Priority;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn new_job(content: &str, priority: u32) -> NewJob {
        NewJob::new(content, Priority::new(priority))
    }

    #[tokio::test]
    async fn lifecycle_operations_follow_the_state_machine() {
        let store = InMemoryJobStore::new();
        let policy = PollPolicy::default();

        let created = store.create(new_job("X", 1), t(0)).await.unwrap();
        assert_eq!(created.from, None);
        assert_eq!(created.job.state, JobState::Pending);
        let id = created.job.id;

        let submitted = store.submit(id, "H".into(), t(1)).await.unwrap();
        assert_eq!(submitted.from, Some(JobState::Pending));
        assert_eq!(submitted.job.version, 1);

        store.begin_polling(id, t(2)).await.unwrap();
        let still = store
            .record_poll_result(id, PollStatus::StillProcessing, &policy, t(3))
            .await
            .unwrap();
        assert!(!still.is_state_change());

        let done = store
            .record_poll_result(id, PollStatus::Succeeded { result_ref: "R".into() }, &policy, t(4))
            .await
            .unwrap();
        assert!(done.is_state_change());
        assert_eq!(done.job.state, JobState::Completed);
        assert_eq!(done.job.version, 4);
    }

    #[tokio::test]
    async fn submitting_twice_is_an_invalid_transition() {
        let store = InMemoryJobStore::new();
        let id = store.create(new_job("X", 1), t(0)).await.unwrap().job.id;
        store.submit(id, "H".into(), t(1)).await.unwrap();

        let err = store.submit(id, "H2".into(), t(2)).await.unwrap_err();
        assert_eq!(
            err,
            JobStoreError::InvalidTransition {
                job_id: id,
                from: JobState::Submitted,
                to: JobState::Submitted,
            }
        );
    }

    #[tokio::test]
    async fn compare_and_set_leaves_exactly_one_winner() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("X", 1), t(0)).await.unwrap().job;

        let a = job.submit("A", t(1)).unwrap();
        let b = job.fail("operator", t(1)).unwrap();

        let first = store.compare_and_set(a, ExpectedVersion::Exact(job.version)).await;
        let second = store.compare_and_set(b, ExpectedVersion::Exact(job.version)).await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(JobStoreError::StaleState { actual: 1, .. })));
        assert_eq!(store.get(job.id).await.unwrap().unwrap().state, JobState::Submitted);
    }

    #[tokio::test]
    async fn concurrent_submissions_commit_once() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = store.create(new_job("X", 1), t(0)).await.unwrap().job.id;

        let (a, b) = tokio::join!(
            store.submit(id, "A".into(), t(1)),
            store.submit(id, "B".into(), t(1)),
        );

        let wins = [a.is_ok(), b.is_ok()].into_iter().filter(|ok| *ok).count();
        assert_eq!(wins, 1);
        let loser = a.err().or(b.err()).unwrap();
        assert!(loser.is_conflict());
    }

    #[tokio::test]
    async fn create_refuses_when_the_queue_is_full() {
        let store = InMemoryJobStore::new().with_queue_limits(QueueLimits {
            max_pending: 2,
            warning_threshold: 1,
        });
        store.create(new_job("a", 1), t(0)).await.unwrap();
        store.create(new_job("b", 1), t(0)).await.unwrap();

        let err = store.create(new_job("c", 1), t(0)).await.unwrap_err();
        assert_eq!(err, JobStoreError::QueueFull { pending: 2, max: 2 });
    }

    #[tokio::test]
    async fn pending_jobs_are_listed_by_priority_then_age() {
        let store = InMemoryJobStore::new();
        let low = store.create(new_job("low", 0), t(0)).await.unwrap().job.id;
        let high_late = store.create(new_job("high-late", 2), t(5)).await.unwrap().job.id;
        let high_early = store.create(new_job("high-early", 2), t(1)).await.unwrap().job.id;

        let ids: Vec<_> = store
            .list_by_state(JobState::Pending, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![high_early, high_late, low]);
    }

    #[tokio::test]
    async fn due_for_poll_skips_jobs_scheduled_later() {
        let store = InMemoryJobStore::new();
        let policy = PollPolicy::default();
        let due = store.create(new_job("due", 1), t(0)).await.unwrap().job.id;
        let later = store.create(new_job("later", 1), t(0)).await.unwrap().job.id;
        store.create(new_job("pending", 1), t(0)).await.unwrap();

        store.submit(due, "H1".into(), t(1)).await.unwrap();
        store.submit(later, "H2".into(), t(1)).await.unwrap();
        store.begin_polling(later, t(1)).await.unwrap();
        store
            .record_poll_result(later, PollStatus::StillProcessing, &policy, t(1))
            .await
            .unwrap();

        let ids: Vec<_> = store.due_for_poll(t(2), 10).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![due]);
    }

    #[tokio::test]
    async fn cancel_fails_live_jobs_but_not_finished_ones() {
        let store = InMemoryJobStore::new();
        let live = store.create(new_job("live", 1), t(0)).await.unwrap().job.id;
        let cancelled = store.fail(live, "operator override".into(), t(1)).await.unwrap();
        assert_eq!(cancelled.job.last_error.as_deref(), Some("operator override"));

        let err = store.fail(live, "again".into(), t(2)).await.unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { from: JobState::Failed, .. }));
    }

    #[tokio::test]
    async fn purge_only_removes_old_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let old_failed = store.create(new_job("a", 1), t(0)).await.unwrap().job.id;
        store.fail(old_failed, "x".into(), t(1)).await.unwrap();
        let recent_failed = store.create(new_job("b", 1), t(0)).await.unwrap().job.id;
        store.fail(recent_failed, "x".into(), t(100)).await.unwrap();
        let old_pending = store.create(new_job("c", 1), t(0)).await.unwrap().job.id;

        assert_eq!(store.purge_terminal_before(t(50)).await.unwrap(), 1);
        assert!(store.get(old_failed).await.unwrap().is_none());
        assert!(store.get(recent_failed).await.unwrap().is_some());
        assert!(store.get(old_pending).await.unwrap().is_some());

        let counts = store.counts().await.unwrap();
        assert_eq!((counts.pending, counts.failed, counts.total()), (1, 1, 2));
    }

    #[tokio::test]
    async fn updated_since_lists_recent_changes_oldest_first() {
        let store = InMemoryJobStore::new();
        let early = store.create(new_job("early", 1), t(0)).await.unwrap().job.id;
        let late = store.create(new_job("late", 1), t(0)).await.unwrap().job.id;
        let stale = store.create(new_job("stale", 1), t(0)).await.unwrap().job.id;
        store.fail(late, "x".into(), t(30)).await.unwrap();
        store.fail(early, "x".into(), t(20)).await.unwrap();
        store.fail(stale, "x".into(), t(5)).await.unwrap();

        let ids: Vec<_> = store
            .list_updated_since(JobState::Failed, t(10), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![early, late]);
    }
}
