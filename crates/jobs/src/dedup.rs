//! Admission records of the deduplication tracker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vidflow_core::Category;

/// A (category, external identifier) pair and when it was admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub category: Category,
    pub identifier: String,
    pub admitted_at: DateTime<Utc>,
}

impl DedupRecord {
    pub fn new(category: Category, identifier: impl Into<String>, admitted_at: DateTime<Utc>) -> Self {
        Self {
            category,
            identifier: identifier.into(),
            admitted_at,
        }
    }

    /// Whether the record has fallen out of the retention window.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.admitted_at <= retention_cutoff(now, retention)
    }
}

/// Records admitted at or before the returned instant are expired.
pub fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
