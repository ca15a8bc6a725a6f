//! Job-state notifications and the broker that fans them out.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{NotificationBroker, Subscription};
pub use event::{Channel, NotificationEvent, Routed};
pub use in_memory_bus::{InMemoryBroker, InMemoryBrokerError};
