//! Render poller: checks outstanding renders and advances their jobs.
//!
//! Each pass reads the store's "due for poll" set, so scheduling does not
//! depend on any single job's lifecycle. Per job:
//!
//! 1. past its render timeout: forced to `failed`, no external call
//! 2. `submitted`: moved to `polling`
//! 3. the renderer is asked for the status (under a call timeout)
//! 4. the classified status is recorded, which reschedules or finishes the job
//!
//! Every write is a compare-and-set against the version just read; when
//! another writer (an operator cancel, a second poller) got there first, the
//! job is reread and abandoned if it is already terminal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use vidflow_core::JobId;
use vidflow_jobs::{Job, JobState, PollPolicy, PollStatus};

use crate::external::{RenderService, RenderStatus, call_with_timeout};
use crate::jobs::{JobStore, JobStoreError};
use crate::workers::{InFlight, WorkerHandle};

/// What one status check did to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    StillProcessing { job_id: JobId },
    /// A transient failure was counted; the job stays in `polling`.
    Retrying { job_id: JobId, reason: String },
    Completed { job_id: JobId, result_ref: String },
    Failed { job_id: JobId, reason: String },
    /// Outstanding longer than its render timeout.
    TimedOut { job_id: JobId },
    /// Another writer changed the job first.
    Abandoned { job_id: JobId, state: Option<JobState> },
    Error { job_id: JobId, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub outcomes: Vec<PollOutcome>,
}

impl PollReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, PollOutcome::Completed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PollOutcome::Failed { .. } | PollOutcome::TimedOut { .. }))
    }

    fn count(&self, pred: impl Fn(&PollOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

pub struct RenderPoller<S> {
    store: S,
    render: Arc<dyn RenderService>,
    policy: PollPolicy,
    call_timeout: Duration,
    batch_size: usize,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl<S: JobStore + 'static> RenderPoller<S> {
    pub fn new(store: S, render: Arc<dyn RenderService>, policy: PollPolicy) -> Self {
        Self {
            store,
            render,
            policy,
            call_timeout: Duration::from_secs(30),
            batch_size: 50,
            permits: Arc::new(Semaphore::new(8)),
            in_flight: InFlight::new(),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(concurrency.max(1)));
        self
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Start a check for every due job not already being checked.
    pub async fn dispatch_due(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        tasks: &mut JoinSet<PollOutcome>,
    ) -> Result<usize, JobStoreError> {
        let due = self.store.due_for_poll(now, self.batch_size).await?;

        let mut started = 0;
        for job in due {
            let Some(guard) = self.in_flight.try_begin(job.id) else {
                continue;
            };
            let poller = Arc::clone(self);
            tasks.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = poller.permits.acquire().await else {
                    return PollOutcome::Abandoned { job_id: job.id, state: Some(job.state) };
                };
                poller.check(job, now).await
            });
            started += 1;
        }
        Ok(started)
    }

    /// One full pass over the jobs due at `now`.
    pub async fn poll_once(self: &Arc<Self>, now: DateTime<Utc>) -> Result<PollReport, JobStoreError> {
        let mut tasks = JoinSet::new();
        self.dispatch_due(now, &mut tasks).await?;

        let mut report = PollReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(err) => warn!(error = %err, "poll task panicked"),
            }
        }
        Ok(report)
    }

    async fn check(&self, job: Job, now: DateTime<Utc>) -> PollOutcome {
        let job_id = job.id;

        if job.is_timed_out(&self.policy, now) {
            return match self.store.time_out(job_id, &self.policy, now).await {
                Ok(transition) => {
                    warn!(
                        job_id = %job_id,
                        error = transition.job.last_error.as_deref().unwrap_or_default(),
                        "render timed out"
                    );
                    PollOutcome::TimedOut { job_id }
                }
                Err(err) => self.on_write_error(job_id, err).await,
            };
        }

        let Some(handle) = job.external_handle.clone() else {
            let reason = "render handle missing".to_string();
            return match self.store.fail(job_id, reason.clone(), now).await {
                Ok(_) => PollOutcome::Failed { job_id, reason },
                Err(err) => self.on_write_error(job_id, err).await,
            };
        };

        if job.state == JobState::Submitted {
            if let Err(err) = self.store.begin_polling(job_id, now).await {
                return self.on_write_error(job_id, err).await;
            }
        }

        let status = match call_with_timeout(self.call_timeout, "render status check", self.render.check_status(&handle)).await {
            Ok(RenderStatus::Processing) => PollStatus::StillProcessing,
            Ok(RenderStatus::Done { result_ref }) => PollStatus::Succeeded { result_ref },
            Ok(RenderStatus::Error { reason }) => PollStatus::Failed { reason },
            Err(err) if err.is_transient() => PollStatus::Transient {
                reason: err.reason().to_string(),
            },
            Err(err) => PollStatus::Failed {
                reason: err.reason().to_string(),
            },
        };
        debug!(job_id = %job_id, handle = %handle, status = ?status, "render status checked");

        let transient = matches!(status, PollStatus::Transient { .. });
        match self.store.record_poll_result(job_id, status, &self.policy, now).await {
            Ok(transition) => {
                let job = transition.job;
                match job.state {
                    JobState::Completed => {
                        let result_ref = job.result_ref.unwrap_or_default();
                        info!(job_id = %job_id, result_ref = %result_ref, polls = job.poll_count, "render completed");
                        PollOutcome::Completed { job_id, result_ref }
                    }
                    JobState::Failed => {
                        let reason = job.last_error.unwrap_or_default();
                        warn!(job_id = %job_id, reason = %reason, "render failed");
                        PollOutcome::Failed { job_id, reason }
                    }
                    _ if transient => PollOutcome::Retrying {
                        job_id,
                        reason: job.last_error.unwrap_or_default(),
                    },
                    _ => PollOutcome::StillProcessing { job_id },
                }
            }
            Err(err) => self.on_write_error(job_id, err).await,
        }
    }

    async fn on_write_error(&self, job_id: JobId, err: JobStoreError) -> PollOutcome {
        if !err.is_conflict() && !matches!(err, JobStoreError::NotFound(_)) {
            warn!(job_id = %job_id, error = %err, "failed to record poll result");
            return PollOutcome::Error {
                job_id,
                error: err.to_string(),
            };
        }

        let state = match self.store.get(job_id).await {
            Ok(job) => job.map(|j| j.state),
            Err(read_err) => {
                return PollOutcome::Error {
                    job_id,
                    error: read_err.to_string(),
                };
            }
        };
        debug!(job_id = %job_id, state = ?state, error = %err, "job changed during poll; abandoning");
        PollOutcome::Abandoned { job_id, state }
    }

    pub fn spawn(self: Arc<Self>, period: Duration) -> WorkerHandle {
        WorkerHandle::spawn("render-poller", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tasks = JoinSet::new();
            info!(interval_ms = period.as_millis() as u64, "render poller started");

            loop {
                tokio::select! {
                    _ = shutdown.requested() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.dispatch_due(Utc::now(), &mut tasks).await {
                            warn!(error = %err, "failed to list jobs due for poll");
                        }
                    }
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(err) = joined {
                            warn!(error = %err, "poll task panicked");
                        }
                    }
                }
            }

            while tasks.join_next().await.is_some() {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vidflow_core::{ExternalError, Priority};
    use vidflow_jobs::{NewJob, RetryPolicy};

    use crate::jobs::InMemoryJobStore;

    #[derive(Default)]
    struct ScriptedStatus {
        script: Mutex<VecDeque<Result<RenderStatus, ExternalError>>>,
        checks: Mutex<usize>,
    }

    impl ScriptedStatus {
        fn with(script: Vec<Result<RenderStatus, ExternalError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                checks: Mutex::new(0),
            })
        }

        fn checks(&self) -> usize {
            *self.checks.lock().unwrap()
        }
    }

    #[async_trait]
    impl RenderService for ScriptedStatus {
        async fn submit(&self, _job: &Job) -> Result<String, ExternalError> {
            Ok("H".into())
        }

        async fn check_status(&self, _handle: &str) -> Result<RenderStatus, ExternalError> {
            *self.checks.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or(Ok(RenderStatus::Processing))
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn policy(max_transient_retries: u32) -> PollPolicy {
        PollPolicy {
            backoff: RetryPolicy::exponential(0, Duration::from_secs(1), Duration::from_secs(4)).with_jitter(0.0),
            max_transient_retries,
            render_timeout: Duration::from_secs(600),
        }
    }

    async fn submitted_job(store: &InMemoryJobStore) -> JobId {
        let id = store.create(NewJob::new("X", Priority::NORMAL), t(0)).await.unwrap().job.id;
        store.submit(id, "H".into(), t(0)).await.unwrap();
        id
    }

    fn poller(store: Arc<InMemoryJobStore>, render: Arc<ScriptedStatus>, policy: PollPolicy) -> Arc<RenderPoller<Arc<InMemoryJobStore>>> {
        Arc::new(RenderPoller::new(store, render, policy).with_call_timeout(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn polls_until_the_render_is_done() {
        let store = InMemoryJobStore::arc();
        let id = submitted_job(&store).await;
        let render = ScriptedStatus::with(vec![
            Ok(RenderStatus::Processing),
            Ok(RenderStatus::Processing),
            Ok(RenderStatus::Processing),
            Ok(RenderStatus::Done { result_ref: "R".into() }),
        ]);
        let poller = poller(store.clone(), render.clone(), policy(3));

        for step in 1..=3 {
            let report = poller.poll_once(t(step * 10)).await.unwrap();
            assert_eq!(report.outcomes, vec![PollOutcome::StillProcessing { job_id: id }]);
        }
        let report = poller.poll_once(t(40)).await.unwrap();
        assert_eq!(report.outcomes, vec![PollOutcome::Completed { job_id: id, result_ref: "R".into() }]);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!((job.state, job.result_ref.as_deref(), job.poll_count), (JobState::Completed, Some("R"), 4));
        assert!(poller.poll_once(t(100)).await.unwrap().is_empty());
        assert_eq!(render.checks(), 4);
    }

    #[tokio::test]
    async fn jobs_are_not_polled_before_their_backoff_elapses() {
        let store = InMemoryJobStore::arc();
        submitted_job(&store).await;
        let render = ScriptedStatus::with(vec![]);
        let poller = poller(store.clone(), render.clone(), policy(3));

        assert_eq!(poller.poll_once(t(1)).await.unwrap().len(), 1);
        // Next poll is scheduled one second after the first.
        assert!(poller.poll_once(t(1)).await.unwrap().is_empty());
        assert_eq!(poller.poll_once(t(2)).await.unwrap().len(), 1);
        assert_eq!(render.checks(), 2);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_up_to_the_ceiling() {
        let store = InMemoryJobStore::arc();
        let id = submitted_job(&store).await;
        let render = ScriptedStatus::with(vec![
            Err(ExternalError::transient("HTTP 502")),
            Err(ExternalError::transient("HTTP 502")),
            Err(ExternalError::transient("HTTP 502")),
        ]);
        let poller = poller(store.clone(), render, policy(2));

        for step in 1..=2 {
            let report = poller.poll_once(t(step * 10)).await.unwrap();
            assert_eq!(report.outcomes, vec![PollOutcome::Retrying { job_id: id, reason: "HTTP 502".into() }]);
        }
        let report = poller.poll_once(t(30)).await.unwrap();
        assert_eq!(report.failed(), 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("HTTP 502 (gave up after 3 transient failures)"));
    }

    #[tokio::test]
    async fn renderer_errors_fail_the_job_with_their_reason() {
        let store = InMemoryJobStore::arc();
        let id = submitted_job(&store).await;
        let render = ScriptedStatus::with(vec![Ok(RenderStatus::Error { reason: "no face detected".into() })]);

        let report = poller(store.clone(), render, policy(3)).poll_once(t(1)).await.unwrap();
        assert_eq!(report.outcomes, vec![PollOutcome::Failed { job_id: id, reason: "no face detected".into() }]);
        assert_eq!(store.get(id).await.unwrap().unwrap().last_error.as_deref(), Some("no face detected"));
    }

    #[tokio::test]
    async fn wedged_renders_time_out_regardless_of_retries() {
        let store = InMemoryJobStore::arc();
        let id = submitted_job(&store).await;
        let render = ScriptedStatus::with(vec![]);
        let poller = poller(store.clone(), render.clone(), policy(1_000));

        poller.poll_once(t(10)).await.unwrap();
        let report = poller.poll_once(t(601)).await.unwrap();
        assert_eq!(report.outcomes, vec![PollOutcome::TimedOut { job_id: id }]);
        assert_eq!(render.checks(), 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("render timed out after 600s"));
    }

    #[tokio::test]
    async fn per_job_timeouts_override_the_default() {
        let store = InMemoryJobStore::arc();
        let new = NewJob::new("X", Priority::NORMAL).with_render_timeout(Duration::from_secs(30));
        let id = store.create(new, t(0)).await.unwrap().job.id;
        store.submit(id, "H".into(), t(0)).await.unwrap();

        let report = poller(store.clone(), ScriptedStatus::with(vec![]), policy(3))
            .poll_once(t(31))
            .await
            .unwrap();
        assert_eq!(report.outcomes, vec![PollOutcome::TimedOut { job_id: id }]);
    }

    /// Cancels the job while its status check is in flight.
    struct CancellingRender {
        store: Arc<InMemoryJobStore>,
        job_id: Mutex<Option<JobId>>,
    }

    #[async_trait]
    impl RenderService for CancellingRender {
        async fn submit(&self, _job: &Job) -> Result<String, ExternalError> {
            Ok("H".into())
        }

        async fn check_status(&self, _handle: &str) -> Result<RenderStatus, ExternalError> {
            let id = self.job_id.lock().unwrap().take();
            if let Some(id) = id {
                self.store.fail(id, "cancelled by operator".into(), t(5)).await.unwrap();
            }
            Ok(RenderStatus::Done { result_ref: "R".into() })
        }
    }

    #[tokio::test]
    async fn cancelled_jobs_are_abandoned_not_overwritten() {
        let store = InMemoryJobStore::arc();
        let id = submitted_job(&store).await;
        let render = Arc::new(CancellingRender {
            store: store.clone(),
            job_id: Mutex::new(Some(id)),
        });

        let poller = Arc::new(RenderPoller::new(store.clone(), render, policy(3)));
        let report = poller.poll_once(t(10)).await.unwrap();
        assert_eq!(report.outcomes, vec![PollOutcome::Abandoned { job_id: id, state: Some(JobState::Failed) }]);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!((job.state, job.result_ref), (JobState::Failed, None));
        assert_eq!(job.last_error.as_deref(), Some("cancelled by operator"));
    }
}
