//! Static action registry: one handler per `ActionKind`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use vidflow_core::ExternalError;
use vidflow_jobs::{ActionKind, Job};

/// What a successful action reports back (a post id, a delivery note).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    pub detail: Option<String>,
}

impl ActionOutput {
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }
}

/// Executes one kind of downstream action for a completed job.
///
/// Implementations perform exactly one side effect per call; retries and
/// idempotency are the dispatcher's job.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<ActionOutput, ExternalError>;
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ActionKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds in ledger-key order.
    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry").field("kinds", &self.kinds()).finish()
    }
}
