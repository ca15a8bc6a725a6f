//! Deduplication tracker: which input identifiers were already admitted, per category.
//!
//! `admit` is the only write path and is atomic per (category, identifier):
//! two concurrent admits of the same pair never both return `true`.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vidflow_core::Category;

pub use crate::config::DedupPolicy;
pub use in_memory::InMemoryDedupTracker;
pub use postgres::PostgresDedupTracker;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DedupError {
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait DedupTracker: Send + Sync {
    /// Record the pair and return `true` unless it was admitted within the
    /// retention window (then `false`, with no side effect).
    async fn admit(&self, category: &Category, identifier: &str, now: DateTime<Utc>) -> Result<bool, DedupError>;

    /// Most recently admitted identifiers for a category, newest first.
    ///
    /// At most `max_per_category` identifiers are returned whatever `limit` is.
    async fn recent(&self, category: &Category, limit: usize) -> Result<Vec<String>, DedupError>;

    async fn last_admitted(&self, category: &Category) -> Result<Option<String>, DedupError> {
        Ok(self.recent(category, 1).await?.into_iter().next())
    }

    /// Withdraw an admission whose work could not be queued. Returns whether a record existed.
    async fn forget(&self, category: &Category, identifier: &str) -> Result<bool, DedupError>;

    /// Drop every record outside the retention window. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DedupError>;

    /// Drop every record of a category. Returns the number removed.
    async fn clear_category(&self, category: &Category) -> Result<u64, DedupError>;
}

#[async_trait]
impl<T> DedupTracker for std::sync::Arc<T>
where
    T: DedupTracker + ?Sized,
{
    async fn admit(&self, category: &Category, identifier: &str, now: DateTime<Utc>) -> Result<bool, DedupError> {
        (**self).admit(category, identifier, now).await
    }

    async fn recent(&self, category: &Category, limit: usize) -> Result<Vec<String>, DedupError> {
        (**self).recent(category, limit).await
    }

    async fn forget(&self, category: &Category, identifier: &str) -> Result<bool, DedupError> {
        (**self).forget(category, identifier).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DedupError> {
        (**self).purge_expired(now).await
    }

    async fn clear_category(&self, category: &Category) -> Result<u64, DedupError> {
        (**self).clear_category(category).await
    }
}
