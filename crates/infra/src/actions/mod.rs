//! Downstream actions: the handler registry, built-in handlers, and the
//! idempotent dispatcher.

pub mod dispatcher;
pub mod handlers;
pub mod registry;

pub use dispatcher::{ActionDispatcher, ActionResult, DispatchError, DispatchReport};
pub use handlers::{PublishAction, WebhookAction, http_registry};
pub use registry::{ActionHandler, ActionOutput, ActionRegistry};
