//! Downstream actions and the idempotency records kept for them.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vidflow_core::{DomainError, JobId};

/// External platform a finished video can be published to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    TikTok,
    Twitter,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::TikTok, Platform::Twitter];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::TikTok => "tiktok",
            Platform::Twitter => "twitter",
        }
    }
}

impl core::fmt::Display for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiktok" => Ok(Platform::TikTok),
            "twitter" | "x" => Ok(Platform::Twitter),
            other => Err(DomainError::validation(format!("unknown platform: {other}"))),
        }
    }
}

/// A downstream action configured on a job.
///
/// The set is closed: adding an action means adding a variant and registering
/// a handler for it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionKind {
    Publish(Platform),
    Webhook,
}

impl ActionKind {
    /// Stable ledger key: `publish:<platform>` or `webhook`.
    pub fn id(&self) -> ActionId {
        match self {
            ActionKind::Publish(platform) => ActionId(format!("publish:{platform}")),
            ActionKind::Webhook => ActionId("webhook".to_string()),
        }
    }

    /// Default action set: publish to each platform, then the webhook if one
    /// is configured.
    pub fn default_set(platforms: &[Platform], with_webhook: bool) -> Vec<ActionKind> {
        let mut actions: Vec<ActionKind> = platforms.iter().copied().map(ActionKind::Publish).collect();
        if with_webhook {
            actions.push(ActionKind::Webhook);
        }
        actions
    }
}

impl core::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.id().as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("webhook") {
            return Ok(ActionKind::Webhook);
        }
        let platform = s.strip_prefix("publish:").unwrap_or(s);
        platform.parse().map(ActionKind::Publish)
    }
}

impl TryFrom<String> for ActionKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionKind> for String {
    fn from(value: ActionKind) -> Self {
        value.id().0
    }
}

/// Ledger key of an action within a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ActionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ActionKind> for ActionId {
    fn from(value: ActionKind) -> Self {
        value.id()
    }
}

/// Execution outcome recorded for a (job, action) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Claimed by a dispatcher; side effect may or may not have happened yet.
    InProgress,
    Succeeded { detail: Option<String> },
    Failed { error: String },
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::InProgress => "in_progress",
            ActionOutcome::Succeeded { .. } => "succeeded",
            ActionOutcome::Failed { .. } => "failed",
        }
    }

    /// Free-form text stored next to the status (detail or error).
    pub fn message(&self) -> Option<&str> {
        match self {
            ActionOutcome::InProgress => None,
            ActionOutcome::Succeeded { detail } => detail.as_deref(),
            ActionOutcome::Failed { error } => Some(error),
        }
    }

    /// Rebuild an outcome from its stored status and message.
    pub fn from_parts(status: &str, message: Option<String>) -> Result<Self, DomainError> {
        match status {
            "in_progress" => Ok(ActionOutcome::InProgress),
            "succeeded" => Ok(ActionOutcome::Succeeded { detail: message }),
            "failed" => Ok(ActionOutcome::Failed {
                error: message.unwrap_or_default(),
            }),
            other => Err(DomainError::validation(format!("unknown action status: {other}"))),
        }
    }
}

/// Idempotency ledger entry: one per (job, action) pair for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub job_id: JobId,
    pub action_id: ActionId,
    pub outcome: ActionOutcome,
    /// Number of times the action's side effect has been attempted.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn claimed(job_id: JobId, action_id: ActionId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            action_id,
            outcome: ActionOutcome::InProgress,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Succeeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Failed { .. })
    }

    /// An in-progress claim older than `lease` is presumed abandoned.
    pub fn is_stale_claim(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        let Ok(lease) = chrono::Duration::from_std(lease) else {
            return false;
        };
        matches!(self.outcome, ActionOutcome::InProgress)
            && now.signed_duration_since(self.updated_at) >= lease
    }

    /// Whether a dispatcher may take this record over.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.is_failed() || self.is_stale_claim(now, lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ids_are_stable() {
        assert_eq!(ActionKind::Publish(Platform::TikTok).id().as_str(), "publish:tiktok");
        assert_eq!(ActionKind::Webhook.id().as_str(), "webhook");
        assert_eq!("publish:twitter".parse::<ActionKind>().unwrap(), ActionKind::Publish(Platform::Twitter));
        assert_eq!("tiktok".parse::<ActionKind>().unwrap(), ActionKind::Publish(Platform::TikTok));
        assert!("publish:myspace".parse::<ActionKind>().is_err());
    }

    #[test]
    fn default_set_appends_webhook_last() {
        let set = ActionKind::default_set(&Platform::ALL, true);
        assert_eq!(
            set,
            vec![
                ActionKind::Publish(Platform::TikTok),
                ActionKind::Publish(Platform::Twitter),
                ActionKind::Webhook,
            ]
        );
        assert_eq!(ActionKind::default_set(&[Platform::Twitter], false).len(), 1);
    }

    #[test]
    fn claims_become_stale_after_the_lease() {
        let t0 = Utc::now();
        let record = ActionRecord::claimed(JobId::new(), ActionKind::Webhook.id(), t0);
        let lease = Duration::from_secs(30);

        assert!(!record.is_claimable(t0 + chrono::Duration::seconds(10), lease));
        assert!(record.is_claimable(t0 + chrono::Duration::seconds(30), lease));
    }

    #[test]
    fn outcome_parts_round_trip() {
        let failed = ActionOutcome::Failed { error: "401".into() };
        let rebuilt = ActionOutcome::from_parts(failed.as_str(), failed.message().map(String::from)).unwrap();
        assert_eq!(rebuilt, failed);
        assert!(ActionOutcome::from_parts("exploded", None).is_err());
    }
}
