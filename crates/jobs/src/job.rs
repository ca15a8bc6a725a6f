//! Render job aggregate and its state machine.
//!
//! ```text
//! pending ──► submitted ──► polling ──► completed
//!    │            │           │  ▲
//!    │            │           └──┘ (still processing / transient)
//!    └────────────┴───────────┴───► failed
//! ```
//!
//! Every transition is a pure function `&Job -> Result<Job, TransitionError>`;
//! persistence and compare-and-set live in the store.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vidflow_core::{AggregateRoot, Category, DomainError, JobId, Priority};

use crate::action::ActionKind;
use crate::policy::PollPolicy;

/// Lifecycle state of a render job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    Polling,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Submitted,
        JobState::Polling,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Submitted => "submitted",
            JobState::Polling => "polling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// States the render poller is responsible for.
    pub fn is_awaiting_render(self) -> bool {
        matches!(self, JobState::Submitted | JobState::Polling)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, Polling)
                | (Submitted, Failed)
                | (Polling, Polling)
                | (Polling, Completed)
                | (Polling, Failed)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job state: {s}")))
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },
}

/// Classified result of one external status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollStatus {
    StillProcessing,
    Succeeded { result_ref: String },
    /// The check itself failed but may work next time.
    Transient { reason: String },
    /// The renderer reported a terminal error.
    Failed { reason: String },
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub content_ref: String,
    pub category: Category,
    pub priority: Priority,
    pub actions: Vec<ActionKind>,
    /// Overrides the poll policy's render timeout for this job.
    pub render_timeout: Option<Duration>,
}

impl NewJob {
    pub fn new(content_ref: impl Into<String>, priority: Priority) -> Self {
        Self {
            content_ref: content_ref.into(),
            category: Category::default(),
            priority,
            actions: Vec::new(),
            render_timeout: None,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = ActionKind>) -> Self {
        self.actions = actions.into_iter().collect();
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = Some(timeout);
        self
    }
}

/// One content-to-video render request and its lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Reference to the source content handed to the renderer.
    pub content_ref: String,
    pub category: Category,
    pub priority: Priority,
    /// Downstream actions executed once the render completes.
    pub actions: Vec<ActionKind>,
    pub state: JobState,
    /// Renderer-side handle; set on submission.
    pub external_handle: Option<String>,
    /// Rendered artifact; set on completion.
    pub result_ref: Option<String>,
    pub last_error: Option<String>,
    /// Transient poll failures so far.
    pub retry_count: u32,
    /// Polls recorded so far; drives the poll backoff.
    pub poll_count: u32,
    pub render_timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    /// Committed writes so far; the compare-and-set token.
    pub version: u64,
}

impl AggregateRoot for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Job {
    pub fn create(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            content_ref: new.content_ref,
            category: new.category,
            priority: new.priority,
            actions: new.actions,
            state: JobState::Pending,
            external_handle: None,
            result_ref: None,
            last_error: None,
            retry_count: 0,
            poll_count: 0,
            render_timeout: new.render_timeout,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            next_poll_at: None,
            version: 0,
        }
    }

    fn transition(&self, to: JobState, now: DateTime<Utc>) -> Result<Job, TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let mut next = self.clone();
        next.state = to;
        next.updated_at = now;
        Ok(next)
    }

    /// `pending -> submitted`, recording the renderer's handle.
    pub fn submit(&self, handle: impl Into<String>, now: DateTime<Utc>) -> Result<Job, TransitionError> {
        let mut next = self.transition(JobState::Submitted, now)?;
        next.external_handle = Some(handle.into());
        next.submitted_at = Some(now);
        next.next_poll_at = Some(now);
        Ok(next)
    }

    /// `submitted -> polling`.
    pub fn begin_polling(&self, now: DateTime<Utc>) -> Result<Job, TransitionError> {
        self.transition(JobState::Polling, now)
    }

    /// Fold one classified status check into the job.
    pub fn apply_poll(
        &self,
        status: &PollStatus,
        policy: &PollPolicy,
        now: DateTime<Utc>,
    ) -> Result<Job, TransitionError> {
        match status {
            PollStatus::StillProcessing => {
                let mut next = self.transition(JobState::Polling, now)?;
                next.schedule_next_poll(policy, now);
                Ok(next)
            }
            PollStatus::Transient { reason } => {
                if self.retry_count >= policy.max_transient_retries {
                    let mut next = self.transition(JobState::Failed, now)?;
                    next.retry_count += 1;
                    next.poll_count += 1;
                    next.next_poll_at = None;
                    next.last_error = Some(format!(
                        "{reason} (gave up after {} transient failures)",
                        next.retry_count
                    ));
                    return Ok(next);
                }
                let mut next = self.transition(JobState::Polling, now)?;
                next.retry_count += 1;
                next.last_error = Some(reason.clone());
                next.schedule_next_poll(policy, now);
                Ok(next)
            }
            PollStatus::Succeeded { result_ref } => {
                let mut next = self.transition(JobState::Completed, now)?;
                next.poll_count += 1;
                next.result_ref = Some(result_ref.clone());
                next.last_error = None;
                next.next_poll_at = None;
                Ok(next)
            }
            PollStatus::Failed { reason } => {
                let mut next = self.transition(JobState::Failed, now)?;
                next.poll_count += 1;
                next.last_error = Some(reason.clone());
                next.next_poll_at = None;
                Ok(next)
            }
        }
    }

    fn schedule_next_poll(&mut self, policy: &PollPolicy, now: DateTime<Utc>) {
        self.poll_count += 1;
        let delay = chrono::Duration::from_std(policy.next_poll_delay(self.poll_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.next_poll_at = Some(now + delay);
    }

    /// Any non-terminal state `-> failed` (operator override, permanent error).
    pub fn fail(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Job, TransitionError> {
        let mut next = self.transition(JobState::Failed, now)?;
        next.last_error = Some(reason.into());
        next.next_poll_at = None;
        Ok(next)
    }

    /// Force-fail a job whose render exceeded its wall-clock bound.
    pub fn time_out(&self, policy: &PollPolicy, now: DateTime<Utc>) -> Result<Job, TransitionError> {
        let timeout = self.render_timeout(policy);
        self.fail(format!("render timed out after {}s", timeout.as_secs()), now)
    }

    pub fn render_timeout(&self, policy: &PollPolicy) -> Duration {
        self.render_timeout.unwrap_or(policy.render_timeout)
    }

    /// Whether the render has been outstanding longer than its timeout.
    pub fn is_timed_out(&self, policy: &PollPolicy, now: DateTime<Utc>) -> bool {
        let (Some(submitted_at), Ok(timeout)) = (
            self.submitted_at,
            chrono::Duration::from_std(self.render_timeout(policy)),
        ) else {
            return false;
        };
        self.state.is_awaiting_render() && now.signed_duration_since(submitted_at) > timeout
    }

    /// Whether the poller should check this job at `now`.
    pub fn is_due_for_poll(&self, now: DateTime<Utc>) -> bool {
        self.state.is_awaiting_render() && self.next_poll_at.is_none_or(|at| at <= now)
    }
}
