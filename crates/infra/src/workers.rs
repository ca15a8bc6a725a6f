//! Background worker plumbing: shutdown handles, periodic loops, in-flight
//! bookkeeping, and the housekeeping sweep.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use vidflow_core::JobId;

use crate::config::HousekeepingConfig;
use crate::dedup::DedupTracker;
use crate::jobs::JobStore;

/// Handle to stop and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `run` with a shutdown signal it is expected to observe.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(run(Shutdown { rx }));
        Self {
            name,
            shutdown: tx,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = self.name, error = %err, "worker terminated abnormally");
            }
        }
        info!(worker = self.name, "worker stopped");
    }
}

/// Shutdown signal handed to a worker.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the handle is dropped.
    pub async fn requested(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Run `tick` every `period` until shutdown. Missed ticks are skipped, so a
/// slow tick never causes a burst of catch-up ticks.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    WorkerHandle::spawn(name, move |mut shutdown| async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(worker = name, interval_ms = period.as_millis() as u64, "worker started");

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

/// Jobs currently being worked on by this process.
///
/// Keeps overlapping ticks from picking up the same job twice.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<JobId>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as in flight; `None` if it already is.
    pub fn try_begin(&self, id: JobId) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id).then(|| InFlightGuard {
            ids: Arc::clone(&self.ids),
            id,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its job from the in-flight set when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<JobId>>>,
    id: JobId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Outcome of one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub jobs_purged: u64,
    pub dedup_records_purged: u64,
}

/// Drop terminal jobs older than the configured age and expired dedup records.
pub async fn run_housekeeping<S, D>(store: &S, dedup: &D, config: &HousekeepingConfig) -> HousekeepingReport
where
    S: JobStore + ?Sized,
    D: DedupTracker + ?Sized,
{
    let now = Utc::now();
    let mut report = HousekeepingReport::default();

    match chrono::Duration::from_std(config.job_max_age) {
        Ok(max_age) => match store.purge_terminal_before(now - max_age).await {
            Ok(n) => report.jobs_purged = n,
            Err(err) => warn!(error = %err, "failed to purge finished jobs"),
        },
        Err(err) => warn!(error = %err, "job max age out of range; skipping purge"),
    }

    match dedup.purge_expired(now).await {
        Ok(n) => report.dedup_records_purged = n,
        Err(err) => warn!(error = %err, "failed to purge expired dedup records"),
    }

    if report != HousekeepingReport::default() {
        info!(
            jobs_purged = report.jobs_purged,
            dedup_records_purged = report.dedup_records_purged,
            "housekeeping completed"
        );
    } else {
        debug!("housekeeping: nothing to purge");
    }
    report
}

pub fn spawn_housekeeping<S, D>(store: S, dedup: D, config: HousekeepingConfig) -> WorkerHandle
where
    S: JobStore + 'static,
    D: DedupTracker + 'static,
{
    let store = Arc::new(store);
    let dedup = Arc::new(dedup);
    let period = config.interval;
    spawn_periodic("housekeeping", period, move || {
        let store = Arc::clone(&store);
        let dedup = Arc::clone(&dedup);
        let config = config.clone();
        async move {
            run_housekeeping(store.as_ref(), dedup.as_ref(), &config).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use vidflow_core::{Category, Priority};
    use vidflow_jobs::NewJob;

    use crate::config::DedupPolicy;
    use crate::dedup::InMemoryDedupTracker;
    use crate::jobs::InMemoryJobStore;

    #[test]
    fn in_flight_guards_release_on_drop() {
        let in_flight = InFlight::new();
        let id = JobId::new();

        let guard = in_flight.try_begin(id).unwrap();
        assert!(in_flight.try_begin(id).is_none());
        assert_eq!(in_flight.len(), 1);

        drop(guard);
        assert!(in_flight.is_empty());
        assert!(in_flight.try_begin(id).is_some());
    }

    #[tokio::test]
    async fn periodic_workers_tick_until_shut_down() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic("test", Duration::from_millis(5), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn housekeeping_purges_old_jobs_and_expired_admissions() {
        let store = InMemoryJobStore::new();
        let long_ago = Utc::now() - chrono::Duration::days(30);
        let id = store
            .create(NewJob::new("old", Priority::NORMAL), long_ago)
            .await
            .unwrap()
            .job
            .id;
        store.fail(id, "x".into(), long_ago).await.unwrap();
        store.create(NewJob::new("fresh", Priority::NORMAL), Utc::now()).await.unwrap();

        let dedup = InMemoryDedupTracker::new(DedupPolicy {
            retention: Duration::from_secs(60),
            max_per_category: 10,
        });
        let category = Category::new("news").unwrap();
        dedup.admit(&category, "a", long_ago).await.unwrap();

        let report = run_housekeeping(&store, &dedup, &HousekeepingConfig::default()).await;
        assert_eq!(report, HousekeepingReport { jobs_purged: 1, dedup_records_purged: 1 });
        assert_eq!(store.counts().await.unwrap().total(), 1);
    }
}
