//! Entry points offered to collaborators: job submission, status queries,
//! event subscriptions, and operator cancellation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use vidflow_core::{JobId, Priority};
use vidflow_events::{Channel, NotificationBroker, NotificationEvent, Subscription};
use vidflow_jobs::{ActionKind, Job, JobState, NewJob};

use crate::jobs::{JobCounts, JobStore, JobStoreError, JobTransition};

/// Externally visible view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    /// Set once the job is `completed`.
    pub result_ref: Option<String>,
    /// Terminal error reason, verbatim. Only set for `failed` jobs.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            result_ref: job.result_ref.clone(),
            error: match job.state {
                JobState::Failed => job.last_error.clone(),
                _ => None,
            },
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Facade over a (publishing) job store and the broker it publishes to.
pub struct Pipeline<S, B> {
    store: S,
    broker: B,
    default_actions: Vec<ActionKind>,
}

impl<S, B> Pipeline<S, B>
where
    S: JobStore,
    B: NotificationBroker<NotificationEvent>,
{
    pub fn new(store: S, broker: B) -> Self {
        Self {
            store,
            broker,
            default_actions: Vec::new(),
        }
    }

    /// Actions given to jobs submitted without any.
    pub fn with_default_actions(mut self, actions: Vec<ActionKind>) -> Self {
        self.default_actions = actions;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn submit_job(&self, content_ref: impl Into<String>, priority: Priority) -> Result<JobId, JobStoreError> {
        self.submit(NewJob::new(content_ref, priority)).await
    }

    pub async fn submit(&self, mut new: NewJob) -> Result<JobId, JobStoreError> {
        if new.actions.is_empty() {
            new.actions = self.default_actions.clone();
        }
        Ok(self.store.create(new, Utc::now()).await?.job.id)
    }

    pub async fn job_status(&self, id: JobId) -> Result<Option<JobStatusView>, JobStoreError> {
        Ok(self.store.get(id).await?.as_ref().map(JobStatusView::from))
    }

    /// Live events on `channel` from now on; nothing published earlier is replayed.
    pub fn subscribe(&self, channel: &Channel) -> Subscription<NotificationEvent> {
        self.broker.subscribe(channel)
    }

    /// Operator override: fail a job that has not finished yet.
    pub async fn cancel(&self, id: JobId, reason: impl Into<String>) -> Result<JobTransition, JobStoreError> {
        self.store.fail(id, reason.into(), Utc::now()).await
    }

    pub async fn counts(&self) -> Result<JobCounts, JobStoreError> {
        self.store.counts().await
    }
}
