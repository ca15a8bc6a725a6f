//! Notification publishing/subscription abstraction (mechanics only).
//!
//! - **Channel routing**: a message goes to every subscriber of each channel it
//!   names (see [`Routed`](crate::event::Routed)).
//! - **At-least-once** per live subscriber; duplicates are possible.
//! - **No backlog**: a subscriber that is not connected when a message is
//!   published never sees it. Consumers re-derive state from the job store.
//! - **No cross-channel ordering.**

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::event::Channel;

/// Live subscription to one channel.
///
/// Yields a lazy, unbounded sequence of messages. Dropping it unsubscribes;
/// re-subscribing starts from "now" with no replay.
#[derive(Debug)]
pub struct Subscription<M> {
    channel: Channel,
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(channel: Channel, receiver: UnboundedReceiver<M>) -> Self {
        Self { channel, receiver }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Wait for the next message. `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Consume the subscription as a `Stream`.
    pub fn into_stream(self) -> UnboundedReceiverStream<M> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Channel-routed publish/subscribe broker.
///
/// `publish` is fire-and-forget: it never waits on subscribers. The trait
/// requires `Send + Sync` so one broker can be shared by every worker.
pub trait NotificationBroker<M>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self, channel: &Channel) -> Subscription<M>;
}

impl<M, B> NotificationBroker<M> for Arc<B>
where
    B: NotificationBroker<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self, channel: &Channel) -> Subscription<M> {
        (**self).subscribe(channel)
    }
}
