//! Infrastructure-backed notification brokers.
//!
//! The broker contract and the in-process implementation live in
//! `vidflow-events`; this module adds a Redis pub/sub implementation.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBrokerError, RedisPubSubBroker};
