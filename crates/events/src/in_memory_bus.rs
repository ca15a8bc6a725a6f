//! In-memory broker for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::bus::{NotificationBroker, Subscription};
use crate::event::{Channel, Routed};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBrokerError {
    /// Publish failed due to internal lock poisoning.
    #[error("broker lock poisoned")]
    Poisoned,
}

/// In-memory channel-routed broker.
///
/// - No IO; publish never blocks on a subscriber
/// - Best-effort fan-out; dead subscribers are pruned on publish
#[derive(Debug)]
pub struct InMemoryBroker<M> {
    channels: Mutex<HashMap<Channel, Vec<UnboundedSender<M>>>>,
}

impl<M> InMemoryBroker<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers of `channel` as of the last publish or subscribe.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .lock()
            .map(|channels| {
                channels
                    .get(channel)
                    .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

impl<M> Default for InMemoryBroker<M> {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> NotificationBroker<M> for InMemoryBroker<M>
where
    M: Routed + Clone + Send + 'static,
{
    type Error = InMemoryBrokerError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut channels = self.channels.lock().map_err(|_| InMemoryBrokerError::Poisoned)?;

        for channel in message.channels() {
            if let Some(subs) = channels.get_mut(&channel) {
                // Drop any dead subscribers while publishing.
                subs.retain(|tx| tx.send(message.clone()).is_ok());
                if subs.is_empty() {
                    channels.remove(&channel);
                }
            }
        }

        Ok(())
    }

    fn subscribe(&self, channel: &Channel) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a subscription; it just never receives.
        match self.channels.lock() {
            Ok(mut channels) => channels.entry(channel.clone()).or_default().push(tx),
            Err(_) => tracing::warn!(%channel, "broker lock poisoned; subscription will stay silent"),
        }

        Subscription::new(channel.clone(), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        to: Vec<&'static str>,
        body: u32,
    }

    impl Routed for Msg {
        fn channels(&self) -> Vec<Channel> {
            self.to.iter().copied().map(Channel::from).collect()
        }
    }

    fn msg(to: &[&'static str], body: u32) -> Msg {
        Msg { to: to.to_vec(), body }
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber_of_a_channel() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe(&Channel::from("jobs"));
        let mut b = broker.subscribe(&Channel::from("jobs"));
        let mut other = broker.subscribe(&Channel::from("jobs.completed"));

        broker.publish(msg(&["jobs"], 1)).unwrap();

        assert_eq!(a.recv().await.unwrap().body, 1);
        assert_eq!(b.recv().await.unwrap().body, 1);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscribers_get_no_backlog() {
        let broker = InMemoryBroker::new();
        broker.publish(msg(&["jobs"], 1)).unwrap();

        let mut late = broker.subscribe(&Channel::from("jobs"));
        assert!(late.try_recv().is_err());

        broker.publish(msg(&["jobs"], 2)).unwrap();
        assert_eq!(late.recv().await.unwrap().body, 2);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let broker = InMemoryBroker::new();
        let channel = Channel::from("jobs");
        let sub = broker.subscribe(&channel);
        let _keep = broker.subscribe(&channel);
        drop(sub);

        broker.publish(msg(&["jobs"], 1)).unwrap();
        assert_eq!(broker.subscriber_count(&channel), 1);
    }

    #[tokio::test]
    async fn stream_yields_published_messages() {
        use tokio_stream::StreamExt;

        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&Channel::from("jobs.failed")).into_stream();
        broker.publish(msg(&["jobs", "jobs.failed"], 7)).unwrap();

        assert_eq!(stream.next().await.unwrap().body, 7);
    }
}
