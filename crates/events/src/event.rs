//! Notification events and channel routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vidflow_core::{EventId, JobId};
use vidflow_jobs::{Job, JobState};

/// Name of a broker channel.
///
/// `jobs` carries every job event; `jobs.<state>` carries the events of one
/// state (e.g. `jobs.completed`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub const ALL_JOBS: &'static str = "jobs";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn all_jobs() -> Self {
        Self(Self::ALL_JOBS.to_string())
    }

    pub fn for_state(state: JobState) -> Self {
        Self(format!("{}.{}", Self::ALL_JOBS, state.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A message that knows which channels it belongs to.
pub trait Routed {
    fn channels(&self) -> Vec<Channel>;
}

/// Immutable record of one job state change.
///
/// Consumers may see duplicates or miss events entirely; the job store stays
/// the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: EventId,
    pub job_id: JobId,
    pub state: JobState,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Snapshot the job's current state.
    pub fn for_job(job: &Job, emitted_at: DateTime<Utc>) -> Self {
        Self {
            event_id: EventId::new(),
            job_id: job.id,
            state: job.state,
            result_ref: job.result_ref.clone(),
            error: if job.state == JobState::Failed {
                job.last_error.clone()
            } else {
                None
            },
            emitted_at,
        }
    }
}

impl Routed for NotificationEvent {
    fn channels(&self) -> Vec<Channel> {
        vec![Channel::all_jobs(), Channel::for_state(self.state)]
    }
}
