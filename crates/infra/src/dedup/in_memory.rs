//! In-memory deduplication tracker for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vidflow_core::Category;
use vidflow_jobs::retention_cutoff;

use super::{DedupError, DedupPolicy, DedupTracker};

/// Admission log of one category, indexed both ways.
#[derive(Debug, Default)]
struct CategoryLog {
    seq: u64,
    by_identifier: HashMap<String, (DateTime<Utc>, u64)>,
    by_age: BTreeMap<(DateTime<Utc>, u64), String>,
}

impl CategoryLog {
    fn admit(&mut self, identifier: &str, now: DateTime<Utc>, policy: &DedupPolicy) -> bool {
        if let Some(&key) = self.by_identifier.get(identifier) {
            if key.0 > retention_cutoff(now, policy.retention) {
                return false;
            }
            self.by_age.remove(&key);
        }

        self.seq += 1;
        let key = (now, self.seq);
        self.by_identifier.insert(identifier.to_string(), key);
        self.by_age.insert(key, identifier.to_string());

        // Over the cap, only records already outside the window may go.
        if self.by_identifier.len() > policy.max_per_category {
            self.purge_before(retention_cutoff(now, policy.retention));
        }
        true
    }

    fn recent(&self, limit: usize) -> Vec<String> {
        self.by_age.values().rev().take(limit).cloned().collect()
    }

    fn forget(&mut self, identifier: &str) -> bool {
        match self.by_identifier.remove(identifier) {
            Some(key) => {
                self.by_age.remove(&key);
                true
            }
            None => false,
        }
    }

    fn purge_before(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let mut removed = 0;
        while let Some(entry) = self.by_age.first_entry() {
            if entry.key().0 > cutoff {
                break;
            }
            let identifier = entry.remove();
            self.by_identifier.remove(&identifier);
            removed += 1;
        }
        removed
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDedupTracker {
    policy: DedupPolicy,
    categories: Mutex<HashMap<Category, CategoryLog>>,
}

impl InMemoryDedupTracker {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            categories: Mutex::new(HashMap::new()),
        }
    }
}

fn poisoned() -> DedupError {
    DedupError::Storage("dedup tracker lock poisoned".to_string())
}

#[async_trait]
impl DedupTracker for InMemoryDedupTracker {
    async fn admit(&self, category: &Category, identifier: &str, now: DateTime<Utc>) -> Result<bool, DedupError> {
        let mut categories = self.categories.lock().map_err(|_| poisoned())?;
        Ok(categories
            .entry(category.clone())
            .or_default()
            .admit(identifier, now, &self.policy))
    }

    async fn recent(&self, category: &Category, limit: usize) -> Result<Vec<String>, DedupError> {
        let categories = self.categories.lock().map_err(|_| poisoned())?;
        let limit = limit.min(self.policy.max_per_category);
        Ok(categories.get(category).map(|log| log.recent(limit)).unwrap_or_default())
    }

    async fn forget(&self, category: &Category, identifier: &str) -> Result<bool, DedupError> {
        let mut categories = self.categories.lock().map_err(|_| poisoned())?;
        Ok(categories
            .get_mut(category)
            .is_some_and(|log| log.forget(identifier)))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DedupError> {
        let cutoff = retention_cutoff(now, self.policy.retention);
        let mut categories = self.categories.lock().map_err(|_| poisoned())?;
        let removed = categories.values_mut().map(|log| log.purge_before(cutoff)).sum::<u64>();
        categories.retain(|_, log| !log.by_identifier.is_empty());
        Ok(removed)
    }

    async fn clear_category(&self, category: &Category) -> Result<u64, DedupError> {
        let mut categories = self.categories.lock().map_err(|_| poisoned())?;
        Ok(categories
            .remove(category)
            .map(|log| log.by_identifier.len() as u64)
            .unwrap_or(0))
    }
}
