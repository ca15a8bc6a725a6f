//! Intake scheduler: pulls new content per category, admits it through the
//! dedup tracker, and creates a render job for each admitted item.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use vidflow_core::ExternalError;
use vidflow_jobs::{ActionKind, NewJob};

use crate::config::{CategoryPlan, IntakeConfig};
use crate::dedup::{DedupError, DedupTracker};
use crate::external::ContentIntake;
use crate::jobs::{JobStore, JobStoreError};
use crate::workers::{WorkerHandle, spawn_periodic};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntakeError {
    #[error("content intake failed: {0}")]
    Intake(#[from] ExternalError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub fetched: usize,
    pub admitted: usize,
    pub duplicates: usize,
    pub created: usize,
    /// Categories skipped because the pending queue was full.
    pub deferred: usize,
}

impl IntakeReport {
    fn merge(&mut self, other: IntakeReport) {
        self.fetched += other.fetched;
        self.admitted += other.admitted;
        self.duplicates += other.duplicates;
        self.created += other.created;
        self.deferred += other.deferred;
    }
}

pub struct IntakeScheduler<S, D> {
    store: S,
    dedup: D,
    intake: Arc<dyn ContentIntake>,
    plans: Vec<CategoryPlan>,
    cursor_len: usize,
    actions: Vec<ActionKind>,
}

impl<S: JobStore, D: DedupTracker> IntakeScheduler<S, D> {
    pub fn new(store: S, dedup: D, intake: Arc<dyn ContentIntake>, config: &IntakeConfig) -> Self {
        Self {
            store,
            dedup,
            intake,
            plans: config.categories.clone(),
            cursor_len: config.cursor_len,
            actions: Vec::new(),
        }
    }

    /// Action set given to every job this scheduler creates.
    pub fn with_actions(mut self, actions: Vec<ActionKind>) -> Self {
        self.actions = actions;
        self
    }

    /// One pass over every category. A failing category is logged and does
    /// not stop the others.
    pub async fn run_once(&self, now: DateTime<Utc>) -> IntakeReport {
        let mut report = IntakeReport::default();
        for plan in &self.plans {
            match self.run_category(plan, now).await {
                Ok(category_report) => report.merge(category_report),
                Err(err) => warn!(category = %plan.category, error = %err, "intake failed"),
            }
        }
        if report.created > 0 {
            info!(created = report.created, duplicates = report.duplicates, "intake pass completed");
        }
        report
    }

    pub async fn run_category(&self, plan: &CategoryPlan, now: DateTime<Utc>) -> Result<IntakeReport, IntakeError> {
        let mut report = IntakeReport::default();

        // Full queues skip the fetch entirely.
        let limits = self.store.queue_limits();
        let pending = self.store.counts().await?.pending;
        if pending >= limits.max_pending {
            warn!(category = %plan.category, pending, max = limits.max_pending, "queue full; deferring intake");
            report.deferred = 1;
            return Ok(report);
        }

        let recent = self.dedup.recent(&plan.category, self.cursor_len).await?;
        let items = self.intake.fetch_new(&plan.category, &recent).await?;
        report.fetched = items.len();

        for item in items {
            if !self.dedup.admit(&plan.category, &item.identifier, now).await? {
                debug!(category = %plan.category, identifier = %item.identifier, "duplicate content skipped");
                report.duplicates += 1;
                continue;
            }
            report.admitted += 1;

            let new = NewJob::new(item.content_ref, plan.priority)
                .with_category(plan.category.clone())
                .with_actions(self.actions.iter().copied());
            match self.store.create(new, now).await {
                Ok(transition) => {
                    debug!(
                        category = %plan.category,
                        identifier = %item.identifier,
                        job_id = %transition.job.id,
                        "content admitted"
                    );
                    report.created += 1;
                }
                Err(err) => {
                    // The item was never queued; let the next pass offer it again.
                    self.withdraw(plan, &item.identifier).await;
                    report.admitted -= 1;
                    match err {
                        JobStoreError::QueueFull { pending, max } => {
                            warn!(category = %plan.category, pending, max, "queue filled during intake; deferring the rest");
                            report.deferred = 1;
                            break;
                        }
                        err => return Err(err.into()),
                    }
                }
            }
        }
        Ok(report)
    }

    async fn withdraw(&self, plan: &CategoryPlan, identifier: &str) {
        if let Err(err) = self.dedup.forget(&plan.category, identifier).await {
            warn!(
                category = %plan.category,
                identifier,
                error = %err,
                "failed to withdraw admission; item skipped until the dedup window expires"
            );
        }
    }
}

impl<S, D> IntakeScheduler<S, D>
where
    S: JobStore + 'static,
    D: DedupTracker + 'static,
{
    pub fn spawn(self: Arc<Self>, period: Duration) -> WorkerHandle {
        spawn_periodic("intake-scheduler", period, move || {
            let scheduler = Arc::clone(&self);
            async move {
                scheduler.run_once(Utc::now()).await;
            }
        })
    }
}
