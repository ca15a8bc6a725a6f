//! Action dispatcher: runs a completed job's downstream actions exactly as
//! often as the ledger allows.
//!
//! Every action is claimed in the ledger before its side effect runs, so a
//! duplicate completion event (or a reconciliation sweep racing an event)
//! finds the pair `succeeded` or in flight and does nothing. Actions of one
//! job run concurrently and fail independently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use vidflow_core::{ExternalError, JobId};
use vidflow_events::{Channel, NotificationBroker, NotificationEvent, Subscription};
use vidflow_jobs::{ActionId, ActionKind, ActionOutcome, Job, JobState, RetryPolicy};

use crate::config::{DispatcherConfig, claim_lease_floor};
use crate::external::call_with_timeout;
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::{ActionLedger, Claim, LedgerError};
use crate::workers::WorkerHandle;

use super::registry::ActionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What happened to one (job, action) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Succeeded { action_id: ActionId, attempts: u32 },
    Failed { action_id: ActionId, attempts: u32, error: String },
    /// Recorded as succeeded earlier; nothing was executed.
    AlreadySucceeded { action_id: ActionId },
    /// Another dispatcher holds the claim.
    InFlight { action_id: ActionId },
    /// The ledger could not be read or written; retried on a later event or sweep.
    LedgerUnavailable { action_id: ActionId, error: String },
}

impl ActionResult {
    pub fn action_id(&self) -> &ActionId {
        match self {
            ActionResult::Succeeded { action_id, .. }
            | ActionResult::Failed { action_id, .. }
            | ActionResult::AlreadySucceeded { action_id }
            | ActionResult::InFlight { action_id }
            | ActionResult::LedgerUnavailable { action_id, .. } => action_id,
        }
    }

    /// Whether a side effect was attempted in this dispatch.
    pub fn executed(&self) -> bool {
        matches!(self, ActionResult::Succeeded { .. } | ActionResult::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub job_id: JobId,
    /// One entry per action, sorted by action id. Empty when the job was not
    /// (or no longer) `completed`.
    pub results: Vec<ActionResult>,
}

impl DispatchReport {
    fn skipped(job_id: JobId) -> Self {
        Self {
            job_id,
            results: Vec::new(),
        }
    }

    pub fn executed(&self) -> usize {
        self.results.iter().filter(|r| r.executed()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, ActionResult::Succeeded { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, ActionResult::Failed { .. }))
            .count()
    }
}

pub struct ActionDispatcher<S, L> {
    store: S,
    ledger: L,
    registry: ActionRegistry,
    retry: RetryPolicy,
    call_timeout: Duration,
    claim_lease: Duration,
    reconcile_batch_size: usize,
    reconcile_lookback: Duration,
    permits: Arc<Semaphore>,
}

impl<S, L> ActionDispatcher<S, L>
where
    S: JobStore + 'static,
    L: ActionLedger + 'static,
{
    pub fn new(store: S, ledger: L, registry: ActionRegistry, config: &DispatcherConfig) -> Self {
        Self {
            store,
            ledger,
            registry,
            retry: config.retry_policy(),
            call_timeout: config.call_timeout,
            claim_lease: config.claim_lease,
            reconcile_batch_size: config.reconcile_batch_size.max(1),
            reconcile_lookback: config.reconcile_lookback,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The configured lease, raised to cover a full run under the current retry policy.
    fn claim_lease(&self) -> Duration {
        self.claim_lease.max(claim_lease_floor(&self.retry, self.call_timeout))
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// React to a notification. Only `completed` events trigger actions; the
    /// payload is not trusted, the job is reread from the store.
    pub async fn handle_event(self: &Arc<Self>, event: &NotificationEvent) -> Result<DispatchReport, DispatchError> {
        if event.state != JobState::Completed {
            return Ok(DispatchReport::skipped(event.job_id));
        }
        self.dispatch_job(event.job_id).await
    }

    /// Run every action of a completed job that is not already done.
    pub async fn dispatch_job(self: &Arc<Self>, job_id: JobId) -> Result<DispatchReport, DispatchError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.state != JobState::Completed {
            debug!(job_id = %job_id, state = %job.state, "job not completed; no actions to run");
            return Ok(DispatchReport::skipped(job_id));
        }

        let actions = job.actions.clone();
        Ok(self.run_actions(Arc::new(job), actions).await)
    }

    async fn run_actions(self: &Arc<Self>, job: Arc<Job>, actions: Vec<ActionKind>) -> DispatchReport {
        let mut tasks = JoinSet::new();
        for kind in actions {
            let dispatcher = Arc::clone(self);
            let job = Arc::clone(&job);
            tasks.spawn(async move { dispatcher.run_action(&job, kind).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(job_id = %job.id, error = %err, "action task panicked"),
            }
        }
        results.sort_by(|a, b| a.action_id().cmp(b.action_id()));

        let report = DispatchReport {
            job_id: job.id,
            results,
        };
        if report.executed() > 0 {
            info!(
                job_id = %job.id,
                succeeded = report.succeeded(),
                failed = report.failed(),
                "job actions dispatched"
            );
        }
        report
    }

    async fn run_action(&self, job: &Job, kind: ActionKind) -> ActionResult {
        let action_id = kind.id();
        let Ok(_permit) = self.permits.acquire().await else {
            return ActionResult::InFlight { action_id };
        };

        let previous_attempts = match self
            .ledger
            .try_claim(job.id, &action_id, Utc::now(), self.claim_lease())
            .await
        {
            Ok(Claim::Acquired(record)) => record.attempts,
            Ok(Claim::AlreadySucceeded(_)) => {
                debug!(job_id = %job.id, action = %action_id, "action already succeeded; skipping");
                return ActionResult::AlreadySucceeded { action_id };
            }
            Ok(Claim::InFlight(_)) => {
                debug!(job_id = %job.id, action = %action_id, "action claimed elsewhere; skipping");
                return ActionResult::InFlight { action_id };
            }
            Err(err) => {
                warn!(job_id = %job.id, action = %action_id, error = %err, "failed to claim action");
                return ActionResult::LedgerUnavailable {
                    action_id,
                    error: err.to_string(),
                };
            }
        };

        let (outcome, attempts) = self.execute_with_retry(job, kind, &action_id).await;
        let attempts_total = previous_attempts + attempts;

        let result = match &outcome {
            ActionOutcome::Failed { error } => {
                warn!(job_id = %job.id, action = %action_id, attempts, error = %error, "action failed");
                ActionResult::Failed {
                    action_id: action_id.clone(),
                    attempts: attempts_total,
                    error: error.clone(),
                }
            }
            _ => {
                debug!(job_id = %job.id, action = %action_id, attempts, "action succeeded");
                ActionResult::Succeeded {
                    action_id: action_id.clone(),
                    attempts: attempts_total,
                }
            }
        };

        if let Err(err) = self
            .ledger
            .finish(job.id, &action_id, outcome, attempts_total, Utc::now())
            .await
        {
            // The claim stays `in_progress` and is taken over once the lease lapses.
            warn!(job_id = %job.id, action = %action_id, error = %err, "failed to record action outcome");
            return ActionResult::LedgerUnavailable {
                action_id,
                error: err.to_string(),
            };
        }
        result
    }

    /// Returns the outcome and the number of attempts made.
    async fn execute_with_retry(&self, job: &Job, kind: ActionKind, action_id: &ActionId) -> (ActionOutcome, u32) {
        let Some(handler) = self.registry.get(kind) else {
            let error = format!("no handler registered for {action_id}");
            return (ActionOutcome::Failed { error }, 0);
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<_, ExternalError> =
                call_with_timeout(self.call_timeout, action_id.as_str(), handler.execute(job)).await;

            match result {
                Ok(output) => return (ActionOutcome::Succeeded { detail: output.detail }, attempt),
                Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        job_id = %job.id,
                        action = %action_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "action failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ExternalError::Transient(reason)) => {
                    let error = format!("{reason} (gave up after {attempt} attempts)");
                    return (ActionOutcome::Failed { error }, attempt);
                }
                Err(ExternalError::Permanent(reason)) => {
                    return (ActionOutcome::Failed { error: reason }, attempt);
                }
            }
        }
    }

    /// Dispatch actions of recently completed jobs that have no ledger record.
    ///
    /// Recovers completions whose event was missed (no subscriber connected).
    /// Failed records are left alone; they are retried on redelivery.
    pub async fn reconcile(self: &Arc<Self>) -> Result<usize, DispatchError> {
        let lookback = chrono::Duration::from_std(self.reconcile_lookback).unwrap_or(chrono::Duration::days(1));
        let mut since = Utc::now() - lookback;
        let mut dispatched = 0;

        loop {
            let page = self
                .store
                .list_updated_since(JobState::Completed, since, self.reconcile_batch_size)
                .await?;

            for job in &page {
                let recorded = self.ledger.list_for_job(job.id).await?;
                let missing: Vec<ActionKind> = job
                    .actions
                    .iter()
                    .copied()
                    .filter(|kind| {
                        let id = kind.id();
                        !recorded.iter().any(|r| r.action_id == id)
                    })
                    .collect();
                if missing.is_empty() {
                    continue;
                }

                info!(job_id = %job.id, missing = missing.len(), "reconciling undispatched actions");
                self.run_actions(Arc::new(job.clone()), missing).await;
                dispatched += 1;
            }

            let next = match page.last() {
                Some(last) if page.len() >= self.reconcile_batch_size && last.updated_at > since => last.updated_at,
                _ => break,
            };
            since = next;
        }
        Ok(dispatched)
    }

    /// Consume `jobs.completed` and sweep periodically until shut down.
    ///
    /// Events are handled concurrently; the action semaphore bounds the
    /// external calls. Sweeps run beside event handling, one at a time. A
    /// closed subscription is reopened with backoff while sweeps go on.
    pub fn spawn<B>(self: Arc<Self>, broker: B, reconcile_every: Duration) -> WorkerHandle
    where
        B: NotificationBroker<NotificationEvent> + 'static,
    {
        let channel = Channel::for_state(JobState::Completed);
        let mut subscription = Some(broker.subscribe(&channel));

        WorkerHandle::spawn("action-dispatcher", move |mut shutdown| async move {
            let mut sweep = tokio::time::interval(reconcile_every);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweeping = None;
            let mut tasks = JoinSet::new();
            let mut backoff = RESUBSCRIBE_BACKOFF_MIN;
            let mut resubscribe_at = Instant::now();
            info!(channel = %channel, "action dispatcher started");

            loop {
                tokio::select! {
                    _ = shutdown.requested() => break,
                    event = next_event(&mut subscription) => {
                        let Some(event) = event else {
                            warn!(
                                channel = %channel,
                                retry_in_ms = backoff.as_millis() as u64,
                                "notification subscription closed; resubscribing"
                            );
                            subscription = None;
                            resubscribe_at = Instant::now() + backoff;
                            backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                            continue;
                        };
                        backoff = RESUBSCRIBE_BACKOFF_MIN;
                        let dispatcher = Arc::clone(&self);
                        tasks.spawn(async move {
                            if let Err(err) = dispatcher.handle_event(&event).await {
                                warn!(job_id = %event.job_id, error = %err, "failed to dispatch job actions");
                            }
                        });
                    }
                    _ = tokio::time::sleep_until(resubscribe_at), if subscription.is_none() => {
                        subscription = Some(broker.subscribe(&channel));
                        info!(channel = %channel, "notification subscription reopened");
                        // Completions published while unsubscribed are only found by a sweep.
                        self.start_sweep(&mut sweeping);
                    }
                    _ = sweep.tick() => self.start_sweep(&mut sweeping),
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(err) = joined {
                            warn!(error = %err, "dispatch task panicked");
                        }
                    }
                }
            }

            // Claimed actions are allowed to finish and be recorded.
            if let Some(task) = sweeping {
                if let Err(err) = task.await {
                    warn!(error = %err, "reconciliation sweep panicked");
                }
            }
            while tasks.join_next().await.is_some() {}
        })
    }

    /// Start a sweep unless the previous one is still running.
    fn start_sweep(self: &Arc<Self>, sweeping: &mut Option<JoinHandle<()>>) {
        if sweeping.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("previous reconciliation sweep still running; skipping tick");
            return;
        }
        let dispatcher = Arc::clone(self);
        *sweeping = Some(tokio::spawn(async move {
            if let Err(err) = dispatcher.reconcile().await {
                warn!(error = %err, "reconciliation sweep failed");
            }
        }));
    }
}

const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Next event of the open subscription; pending while there is none.
async fn next_event(subscription: &mut Option<Subscription<NotificationEvent>>) -> Option<NotificationEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use vidflow_core::Priority;
    use vidflow_events::InMemoryBroker;
    use vidflow_jobs::{NewJob, Platform, PollPolicy, PollStatus};

    use crate::actions::{ActionHandler, ActionOutput};
    use crate::jobs::InMemoryJobStore;
    use crate::ledger::InMemoryActionLedger;

    /// Fails transiently `failures` times, then succeeds; counts side effects.
    struct Flaky {
        failures: AtomicUsize,
        calls: AtomicUsize,
        permanent: bool,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                permanent: false,
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(usize::MAX),
                calls: AtomicUsize::new(0),
                permanent: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionHandler for Flaky {
        async fn execute(&self, _job: &Job) -> Result<ActionOutput, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(ExternalError::permanent("HTTP 401 Unauthorized: bad token"));
            }
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ExternalError::transient("HTTP 503"));
            }
            Ok(ActionOutput::with_detail("ok"))
        }
    }

    const TIKTOK: ActionKind = ActionKind::Publish(Platform::TikTok);
    const TWITTER: ActionKind = ActionKind::Publish(Platform::Twitter);

    async fn completed_job(store: &InMemoryJobStore, actions: Vec<ActionKind>) -> JobId {
        let now = Utc::now();
        let new = NewJob::new("X", Priority::NORMAL).with_actions(actions);
        let id = store.create(new, now).await.unwrap().job.id;
        store.submit(id, "H".into(), now).await.unwrap();
        store.begin_polling(id, now).await.unwrap();
        store
            .record_poll_result(id, PollStatus::Succeeded { result_ref: "R".into() }, &PollPolicy::default(), now)
            .await
            .unwrap();
        id
    }

    fn dispatcher(
        store: Arc<InMemoryJobStore>,
        ledger: Arc<InMemoryActionLedger>,
        registry: ActionRegistry,
    ) -> Arc<ActionDispatcher<Arc<InMemoryJobStore>, Arc<InMemoryActionLedger>>> {
        let config = DispatcherConfig {
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(2),
            ..DispatcherConfig::default()
        };
        Arc::new(ActionDispatcher::new(store, ledger, registry, &config))
    }

    fn completed_event(job_id: JobId) -> NotificationEvent {
        NotificationEvent {
            event_id: vidflow_core::EventId::new(),
            job_id,
            state: JobState::Completed,
            result_ref: Some("R".into()),
            error: None,
            emitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_events_execute_each_action_once() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let tiktok = Flaky::new(0);
        let webhook = Flaky::new(0);
        let registry = ActionRegistry::new()
            .register(TIKTOK, tiktok.clone())
            .register(ActionKind::Webhook, webhook.clone());
        let id = completed_job(&store, vec![TIKTOK, ActionKind::Webhook]).await;
        let dispatcher = dispatcher(store, ledger.clone(), registry);

        let first = dispatcher.handle_event(&completed_event(id)).await.unwrap();
        assert_eq!(first.succeeded(), 2);

        let second = dispatcher.handle_event(&completed_event(id)).await.unwrap();
        assert_eq!(second.executed(), 0);
        assert!(second.results.iter().all(|r| matches!(r, ActionResult::AlreadySucceeded { .. })));

        assert_eq!((tiktok.calls(), webhook.calls()), (1, 1));
        let records = ledger.list_for_job(id).await.unwrap();
        assert!(records.iter().all(|r| r.is_succeeded() && r.attempts == 1));
    }

    #[tokio::test]
    async fn one_platform_failing_does_not_roll_back_another() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let broken = Flaky::broken();
        let working = Flaky::new(0);
        let registry = ActionRegistry::new()
            .register(TIKTOK, broken.clone())
            .register(TWITTER, working.clone());
        let id = completed_job(&store, vec![TIKTOK, TWITTER]).await;

        let report = dispatcher(store, ledger.clone(), registry).dispatch_job(id).await.unwrap();
        assert_eq!((report.succeeded(), report.failed()), (1, 1));
        assert_eq!(broken.calls(), 1);

        let records = ledger.list_for_job(id).await.unwrap();
        let tiktok = records.iter().find(|r| r.action_id == TIKTOK.id()).unwrap();
        let twitter = records.iter().find(|r| r.action_id == TWITTER.id()).unwrap();
        assert_eq!(tiktok.outcome.message(), Some("HTTP 401 Unauthorized: bad token"));
        assert!(tiktok.is_failed());
        assert!(twitter.is_succeeded());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_the_attempt_budget() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let flaky = Flaky::new(2);
        let hopeless = Flaky::new(10);
        let registry = ActionRegistry::new()
            .register(TIKTOK, flaky.clone())
            .register(TWITTER, hopeless.clone());
        let id = completed_job(&store, vec![TIKTOK, TWITTER]).await;

        let report = dispatcher(store, ledger, registry).dispatch_job(id).await.unwrap();
        assert_eq!(
            report.results,
            vec![
                ActionResult::Succeeded { action_id: TIKTOK.id(), attempts: 3 },
                ActionResult::Failed {
                    action_id: TWITTER.id(),
                    attempts: 3,
                    error: "HTTP 503 (gave up after 3 attempts)".into(),
                },
            ]
        );
        assert_eq!((flaky.calls(), hopeless.calls()), (3, 3));
    }

    #[tokio::test]
    async fn failed_actions_are_retried_on_redelivery_but_successes_are_not() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let recovering = Flaky::new(3);
        let working = Flaky::new(0);
        let registry = ActionRegistry::new()
            .register(TIKTOK, recovering.clone())
            .register(TWITTER, working.clone());
        let id = completed_job(&store, vec![TIKTOK, TWITTER]).await;
        let dispatcher = dispatcher(store, ledger.clone(), registry);

        assert_eq!(dispatcher.dispatch_job(id).await.unwrap().failed(), 1);
        let again = dispatcher.handle_event(&completed_event(id)).await.unwrap();
        assert_eq!(
            again.results,
            vec![
                ActionResult::Succeeded { action_id: TIKTOK.id(), attempts: 4 },
                ActionResult::AlreadySucceeded { action_id: TWITTER.id() },
            ]
        );
        assert_eq!(working.calls(), 1);
    }

    #[tokio::test]
    async fn jobs_that_are_not_completed_are_ignored() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let handler = Flaky::new(0);
        let registry = ActionRegistry::new().register(TIKTOK, handler.clone());
        let new = NewJob::new("X", Priority::NORMAL).with_actions([TIKTOK]);
        let id = store.create(new, Utc::now()).await.unwrap().job.id;
        store.fail(id, "cancelled".into(), Utc::now()).await.unwrap();

        // A stale or forged payload does not override the stored state.
        let report = dispatcher(store, ledger, registry).handle_event(&completed_event(id)).await.unwrap();
        assert!(report.results.is_empty());
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn unregistered_actions_are_recorded_as_failed() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let id = completed_job(&store, vec![ActionKind::Webhook]).await;

        let report = dispatcher(store, ledger.clone(), ActionRegistry::new()).dispatch_job(id).await.unwrap();
        assert_eq!(report.failed(), 1);
        let record = ledger.get(id, &ActionKind::Webhook.id()).await.unwrap().unwrap();
        assert_eq!(record.outcome.message(), Some("no handler registered for webhook"));
    }

    #[tokio::test]
    async fn reconcile_dispatches_only_unrecorded_actions() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let tiktok = Flaky::new(0);
        let webhook = Flaky::new(0);
        let registry = ActionRegistry::new()
            .register(TIKTOK, tiktok.clone())
            .register(ActionKind::Webhook, webhook.clone());
        let missed = completed_job(&store, vec![TIKTOK, ActionKind::Webhook]).await;
        let dispatcher = dispatcher(store, ledger.clone(), registry);

        ledger
            .try_claim(missed, &TIKTOK.id(), Utc::now(), Duration::from_secs(300))
            .await
            .unwrap();
        ledger
            .finish(missed, &TIKTOK.id(), ActionOutcome::Failed { error: "x".into() }, 1, Utc::now())
            .await
            .unwrap();

        assert_eq!(dispatcher.reconcile().await.unwrap(), 1);
        assert_eq!((tiktok.calls(), webhook.calls()), (0, 1));
        assert_eq!(dispatcher.reconcile().await.unwrap(), 0);
    }

    /// Records the order handlers start in, to show actions overlap.
    struct Gate {
        entered: Arc<AtomicUsize>,
        peak: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl ActionHandler for Gate {
        async fn execute(&self, _job: &Job) -> Result<ActionOutput, ExternalError> {
            let now = self.entered.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(now);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.entered.fetch_sub(1, Ordering::SeqCst);
            Ok(ActionOutput::default())
        }
    }

    #[tokio::test]
    async fn actions_of_one_job_run_concurrently() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let entered = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(Mutex::new(0));
        let gate = || {
            Arc::new(Gate {
                entered: entered.clone(),
                peak: peak.clone(),
            })
        };
        let registry = ActionRegistry::new()
            .register(TIKTOK, gate())
            .register(TWITTER, gate())
            .register(ActionKind::Webhook, gate());
        let id = completed_job(&store, vec![TIKTOK, TWITTER, ActionKind::Webhook]).await;

        let report = dispatcher(store, ledger, registry).dispatch_job(id).await.unwrap();
        assert_eq!(report.succeeded(), 3);
        assert!(*peak.lock().unwrap() >= 2);
    }

    /// Takes `delay` per call; counts side effects.
    struct Slow {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Slow {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionHandler for Slow {
        async fn execute(&self, _job: &Job) -> Result<ActionOutput, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ActionOutput::default())
        }
    }

    #[tokio::test]
    async fn a_short_lease_is_raised_to_cover_a_slow_action() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let slow = Slow::new(Duration::from_millis(1500));
        let registry = ActionRegistry::new().register(TIKTOK, slow.clone());
        let id = completed_job(&store, vec![TIKTOK]).await;
        let config = DispatcherConfig {
            claim_lease: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(2),
            ..DispatcherConfig::default()
        };
        let dispatcher = Arc::new(ActionDispatcher::new(store, ledger, registry, &config));

        let first = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch_job(id).await }
        });
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let second = dispatcher.dispatch_job(id).await.unwrap();
        assert_eq!(second.results, vec![ActionResult::InFlight { action_id: TIKTOK.id() }]);

        assert_eq!(first.await.unwrap().unwrap().succeeded(), 1);
        assert_eq!(slow.calls(), 1);
    }

    /// Every subscription it hands out is already closed.
    #[derive(Default)]
    struct ClosedBroker {
        subscribes: AtomicUsize,
    }

    impl NotificationBroker<NotificationEvent> for ClosedBroker {
        type Error = std::convert::Infallible;

        fn publish(&self, _message: NotificationEvent) -> Result<(), Self::Error> {
            Ok(())
        }

        fn subscribe(&self, channel: &Channel) -> Subscription<NotificationEvent> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let (_, receiver) = mpsc::unbounded_channel();
            Subscription::new(channel.clone(), receiver)
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn sweeps_and_resubscribes_after_the_subscription_closes() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let handler = Flaky::new(0);
        let registry = ActionRegistry::new().register(TIKTOK, handler.clone());
        let broker = Arc::new(ClosedBroker::default());
        let worker = dispatcher(store.clone(), ledger, registry).spawn(Arc::clone(&broker), Duration::from_millis(50));

        // The closed subscription has been seen by now.
        tokio::time::sleep(Duration::from_millis(100)).await;
        completed_job(&store, vec![TIKTOK]).await;

        wait_until(|| handler.calls() == 1).await;
        wait_until(|| broker.subscribes.load(Ordering::SeqCst) >= 2).await;
        worker.shutdown().await;
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn events_are_handled_while_a_sweep_runs() {
        let store = InMemoryJobStore::arc();
        let ledger = Arc::new(InMemoryActionLedger::new());
        let slow = Slow::new(Duration::from_millis(1000));
        let quick = Flaky::new(0);
        let registry = ActionRegistry::new()
            .register(TIKTOK, slow.clone())
            .register(TWITTER, quick.clone());
        completed_job(&store, vec![TIKTOK]).await;
        let broker = Arc::new(InMemoryBroker::<NotificationEvent>::new());
        // The first tick sweeps up the slow job right away.
        let worker = dispatcher(store.clone(), ledger, registry).spawn(Arc::clone(&broker), Duration::from_secs(3600));
        wait_until(|| slow.calls() == 1).await;

        let id = completed_job(&store, vec![TWITTER]).await;
        broker.publish(completed_event(id)).unwrap();
        tokio::time::timeout(Duration::from_millis(500), async {
            while quick.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        worker.shutdown().await;
        assert_eq!((slow.calls(), quick.calls()), (1, 1));
    }
}
