//! Durable record of every render job and its state.
//!
//! ## Design
//!
//! - Stores expose a handful of primitives (`insert`, `get`, `compare_and_set`, queries)
//! - Lifecycle operations (`create`, `submit`, `record_poll_result`, ...) are provided on
//!   top of them: read, apply the pure transition from `vidflow-jobs`, compare-and-set
//! - A lost compare-and-set surfaces as `StaleState`; callers reread before retrying
//! - `PublishingJobStore` emits one notification per committed state change
//!
//! ## Components
//!
//! - `InMemoryJobStore`: tests and single-process deployments
//! - `PostgresJobStore`: durable store (`render_jobs` table)

pub mod postgres;
pub mod publishing;
pub mod store;

pub use postgres::PostgresJobStore;
pub use publishing::PublishingJobStore;
pub use store::{InMemoryJobStore, JobCounts, JobStore, JobStoreError, JobTransition, apply_transition};
