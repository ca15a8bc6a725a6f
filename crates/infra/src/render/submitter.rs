//! Render submission: hands pending jobs to the renderer and records the handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use vidflow_core::{ExternalError, JobId};
use vidflow_jobs::{Job, JobState, RetryPolicy};

use crate::external::{RenderService, call_with_timeout};
use crate::jobs::{JobStore, JobStoreError};
use crate::workers::{InFlight, WorkerHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Retry with backoff.
    #[error("render service unavailable: {0}")]
    RenderServiceUnavailable(String),
    /// The renderer refused the job; it moves to `failed`.
    #[error("render rejected: {0}")]
    RenderRejected(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<ExternalError> for SubmitError {
    fn from(err: ExternalError) -> Self {
        match err {
            ExternalError::Transient(reason) => SubmitError::RenderServiceUnavailable(reason),
            ExternalError::Permanent(reason) => SubmitError::RenderRejected(reason),
        }
    }
}

/// Sends one job to the renderer and moves it `pending -> submitted`.
pub struct RenderSubmitter<S> {
    store: S,
    render: Arc<dyn RenderService>,
    call_timeout: Duration,
}

impl<S: JobStore> RenderSubmitter<S> {
    pub fn new(store: S, render: Arc<dyn RenderService>, call_timeout: Duration) -> Self {
        Self {
            store,
            render,
            call_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Submit `job` and return the renderer's handle.
    ///
    /// The job is reread first; anything but `pending` is refused without
    /// calling the renderer, so a job cancelled in the meantime is never sent.
    pub async fn submit(&self, job: &Job) -> Result<String, SubmitError> {
        let current = self
            .store
            .get(job.id)
            .await?
            .ok_or(JobStoreError::NotFound(job.id))?;
        if current.state != JobState::Pending {
            return Err(JobStoreError::InvalidTransition {
                job_id: job.id,
                from: current.state,
                to: JobState::Submitted,
            }
            .into());
        }

        let handle = call_with_timeout(self.call_timeout, "render submission", self.render.submit(&current)).await?;

        match self.store.submit(job.id, handle.clone(), Utc::now()).await {
            Ok(_) => {
                info!(job_id = %job.id, handle = %handle, "render submitted");
                Ok(handle)
            }
            Err(err) => {
                // The renderer has the job but the store does not know it.
                error!(job_id = %job.id, handle = %handle, error = %err, "render handle could not be recorded");
                Err(err.into())
            }
        }
    }
}

/// What happened to one pending job during a submission pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { job_id: JobId, handle: String },
    /// Rejected, or still unavailable after the retry ceiling; the job is `failed`.
    Failed { job_id: JobId, reason: String },
    /// The job left `pending` while we worked on it.
    Skipped { job_id: JobId },
    /// Storage trouble; the job stays `pending` for the next pass.
    Error { job_id: JobId, error: String },
}

/// Periodically submits pending jobs, highest priority first.
pub struct SubmissionWorker<S> {
    submitter: RenderSubmitter<S>,
    retry: RetryPolicy,
    batch_size: usize,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl<S: JobStore + 'static> SubmissionWorker<S> {
    pub fn new(submitter: RenderSubmitter<S>, retry: RetryPolicy, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            submitter,
            retry,
            batch_size: concurrency * 4,
            permits: Arc::new(Semaphore::new(concurrency)),
            in_flight: InFlight::new(),
        }
    }

    /// Start submitting every pending job not already being handled.
    pub async fn dispatch_pending(
        self: &Arc<Self>,
        tasks: &mut JoinSet<SubmitOutcome>,
    ) -> Result<usize, JobStoreError> {
        let pending = self
            .submitter
            .store()
            .list_by_state(JobState::Pending, self.batch_size)
            .await?;

        let mut started = 0;
        for job in pending {
            let Some(guard) = self.in_flight.try_begin(job.id) else {
                continue;
            };
            let worker = Arc::clone(self);
            tasks.spawn(async move {
                let _guard = guard;
                worker.process(job).await
            });
            started += 1;
        }
        Ok(started)
    }

    /// One full pass: submit what is pending and wait for every submission.
    pub async fn run_once(self: &Arc<Self>) -> Result<Vec<SubmitOutcome>, JobStoreError> {
        let mut tasks = JoinSet::new();
        self.dispatch_pending(&mut tasks).await?;

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(error = %err, "submission task panicked"),
            }
        }
        Ok(outcomes)
    }

    async fn process(&self, job: Job) -> SubmitOutcome {
        let job_id = job.id;
        let Ok(_permit) = self.permits.acquire().await else {
            return SubmitOutcome::Skipped { job_id };
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.submitter.submit(&job).await {
                Ok(handle) => return SubmitOutcome::Submitted { job_id, handle },
                Err(SubmitError::RenderServiceUnavailable(reason)) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        job_id = %job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "render service unavailable; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(SubmitError::RenderServiceUnavailable(reason)) => {
                    let reason = format!("render service unavailable after {attempt} attempts: {reason}");
                    return self.give_up(job_id, reason).await;
                }
                Err(SubmitError::RenderRejected(reason)) => {
                    return self.give_up(job_id, format!("render rejected: {reason}")).await;
                }
                Err(SubmitError::Store(err)) if err.is_conflict() => {
                    debug!(job_id = %job_id, error = %err, "job no longer pending; skipping");
                    return SubmitOutcome::Skipped { job_id };
                }
                Err(SubmitError::Store(err)) => {
                    return SubmitOutcome::Error {
                        job_id,
                        error: err.to_string(),
                    };
                }
            }
        }
    }

    async fn give_up(&self, job_id: JobId, reason: String) -> SubmitOutcome {
        match self.submitter.store().fail(job_id, reason.clone(), Utc::now()).await {
            Ok(_) => {
                warn!(job_id = %job_id, reason = %reason, "render submission failed");
                SubmitOutcome::Failed { job_id, reason }
            }
            Err(err) if err.is_conflict() => SubmitOutcome::Skipped { job_id },
            Err(err) => SubmitOutcome::Error {
                job_id,
                error: err.to_string(),
            },
        }
    }

    /// Run submission passes every `period` until shut down.
    ///
    /// Passes do not wait for earlier submissions; jobs still in flight are
    /// skipped. On shutdown, running submissions are allowed to finish.
    pub fn spawn(self: Arc<Self>, period: Duration) -> WorkerHandle {
        WorkerHandle::spawn("render-submitter", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tasks = JoinSet::new();
            info!(interval_ms = period.as_millis() as u64, "render submitter started");

            loop {
                tokio::select! {
                    _ = shutdown.requested() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.dispatch_pending(&mut tasks).await {
                            warn!(error = %err, "failed to list pending jobs");
                        }
                    }
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        log_outcome(joined);
                    }
                }
            }

            while let Some(joined) = tasks.join_next().await {
                log_outcome(joined);
            }
        })
    }
}

fn log_outcome(joined: Result<SubmitOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(SubmitOutcome::Error { job_id, error }) => {
            warn!(job_id = %job_id, error = %error, "submission left job pending")
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "submission task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vidflow_core::Priority;
    use vidflow_jobs::NewJob;

    use crate::external::RenderStatus;
    use crate::jobs::InMemoryJobStore;

    /// Answers submissions from a script; once exhausted, hands out handles.
    #[derive(Default)]
    struct ScriptedRender {
        script: Mutex<VecDeque<Result<String, ExternalError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRender {
        fn with(script: Vec<Result<String, ExternalError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RenderService for ScriptedRender {
        async fn submit(&self, job: &Job) -> Result<String, ExternalError> {
            self.calls.lock().unwrap().push(job.content_ref.clone());
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(format!("handle-{}", job.content_ref)))
        }

        async fn check_status(&self, _handle: &str) -> Result<RenderStatus, ExternalError> {
            Ok(RenderStatus::Processing)
        }
    }

    fn worker(store: Arc<InMemoryJobStore>, render: Arc<ScriptedRender>, attempts: u32) -> Arc<SubmissionWorker<Arc<InMemoryJobStore>>> {
        let submitter = RenderSubmitter::new(store, render, Duration::from_secs(1));
        Arc::new(SubmissionWorker::new(
            submitter,
            RetryPolicy::fixed(attempts, Duration::from_millis(1)),
            2,
        ))
    }

    #[tokio::test]
    async fn submits_pending_jobs_and_records_the_handle() {
        let store = InMemoryJobStore::arc();
        let render = ScriptedRender::with(vec![]);
        let id = store.create(NewJob::new("X", Priority::NORMAL), Utc::now()).await.unwrap().job.id;

        let outcomes = worker(store.clone(), render.clone(), 3).run_once().await.unwrap();
        assert_eq!(outcomes, vec![SubmitOutcome::Submitted { job_id: id, handle: "handle-X".into() }]);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Submitted);
        assert_eq!(job.external_handle.as_deref(), Some("handle-X"));
        assert_eq!(render.calls(), vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_escalated() {
        let store = InMemoryJobStore::arc();
        let render = ScriptedRender::with(vec![
            Err(ExternalError::transient("HTTP 503")),
            Err(ExternalError::transient("HTTP 503")),
            Err(ExternalError::transient("HTTP 503")),
        ]);
        let id = store.create(NewJob::new("X", Priority::NORMAL), Utc::now()).await.unwrap().job.id;

        let outcomes = worker(store.clone(), render.clone(), 3).run_once().await.unwrap();
        let reason = "render service unavailable after 3 attempts: HTTP 503".to_string();
        assert_eq!(outcomes, vec![SubmitOutcome::Failed { job_id: id, reason: reason.clone() }]);
        assert_eq!(render.calls().len(), 3);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!((job.state, job.last_error), (JobState::Failed, Some(reason)));
    }

    #[tokio::test]
    async fn a_transient_blip_does_not_fail_the_job() {
        let store = InMemoryJobStore::arc();
        let render = ScriptedRender::with(vec![Err(ExternalError::transient("reset"))]);
        let id = store.create(NewJob::new("X", Priority::NORMAL), Utc::now()).await.unwrap().job.id;

        worker(store.clone(), render.clone(), 3).run_once().await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Submitted);
        assert_eq!(render.calls().len(), 2);
    }

    #[tokio::test]
    async fn rejections_fail_the_job_immediately() {
        let store = InMemoryJobStore::arc();
        let render = ScriptedRender::with(vec![Err(ExternalError::permanent("HTTP 400 Bad Request: empty script"))]);
        let id = store.create(NewJob::new("", Priority::NORMAL), Utc::now()).await.unwrap().job.id;

        worker(store.clone(), render.clone(), 3).run_once().await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("render rejected: HTTP 400 Bad Request: empty script"));
        assert_eq!(render.calls().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_jobs_are_never_sent() {
        let store = InMemoryJobStore::arc();
        let render = ScriptedRender::with(vec![]);
        let job = store.create(NewJob::new("X", Priority::NORMAL), Utc::now()).await.unwrap().job;
        store.fail(job.id, "cancelled".into(), Utc::now()).await.unwrap();

        let submitter = RenderSubmitter::new(store.clone(), render.clone() as Arc<dyn RenderService>, Duration::from_secs(1));
        let err = submitter.submit(&job).await.unwrap_err();
        assert!(matches!(err, SubmitError::Store(JobStoreError::InvalidTransition { from: JobState::Failed, .. })));
        assert!(render.calls().is_empty());
    }
}
