//! `vidflow-core`: shared building blocks for the render pipeline.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, ExternalError};
pub use id::{EventId, JobId};
pub use value_object::{Category, Priority, ValueObject};
