//! Infrastructure layer: stores, workers, external clients, config.
//!
//! - `jobs`, `dedup`, `ledger`: the shared state, in-memory and Postgres
//! - `render`: submission and polling of renders
//! - `actions`: idempotent execution of downstream actions
//! - `scheduler`: content intake
//! - `pipeline`: the entry points collaborators call
//! - `event_bus`: Redis-backed broker (feature `redis`)

pub mod actions;
pub mod config;
pub mod db;
pub mod dedup;
pub mod event_bus;
pub mod external;
pub mod jobs;
pub mod ledger;
pub mod pipeline;
pub mod render;
pub mod scheduler;
pub mod workers;


pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{JobStatusView, Pipeline};
