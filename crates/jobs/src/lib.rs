//! `vidflow-jobs`: pure domain model of the render pipeline.
//!
//! - `job`: the render job aggregate and its state machine
//! - `policy`: retry/backoff and poll policies
//! - `action`: downstream actions and their idempotency records
//! - `dedup`: admission records of the deduplication tracker
//!
//! Everything here is deterministic: callers pass `now` in, nothing performs IO.

pub mod action;
pub mod dedup;
pub mod job;
pub mod policy;

pub use action::{ActionId, ActionKind, ActionOutcome, ActionRecord, Platform};
pub use dedup::{DedupRecord, retention_cutoff};
pub use job::{Job, JobState, NewJob, PollStatus, TransitionError};
pub use policy::{PollPolicy, RetryPolicy};
