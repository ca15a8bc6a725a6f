//! Redis pub/sub-backed notification broker (feature `redis`).
//!
//! Redis pub/sub is not durable: subscribers that are offline when an event is
//! published never see it. That matches the broker contract; consumers
//! reconcile against the job store.

use std::thread;

use redis::Commands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vidflow_events::{Channel, NotificationBroker, NotificationEvent, Routed, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum RedisBrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to start the redis publisher thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("redis publisher thread has stopped")]
    PublisherStopped,
}

/// One encoded event and the Redis channels it goes to.
struct Outgoing {
    channels: Vec<String>,
    payload: String,
}

/// Publishes JSON-encoded events to `<prefix><channel>` Redis channels.
///
/// `publish` only queues the event; a dedicated thread owns the publishing
/// connection, so async callers never wait on Redis I/O.
pub struct RedisPubSubBroker {
    client: redis::Client,
    prefix: String,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl RedisPubSubBroker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBrokerError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let (outbox, queued) = mpsc::unbounded_channel();
        let publisher = client.clone();
        thread::Builder::new()
            .name("redis-pub".to_string())
            .spawn(move || run_publisher(publisher, queued))?;

        Ok(Self {
            client,
            prefix: "vidflow:".to_string(),
            outbox,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn redis_channel(&self, channel: &Channel) -> String {
        format!("{}{}", self.prefix, channel.as_str())
    }
}

impl std::fmt::Debug for RedisPubSubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSubBroker").field("prefix", &self.prefix).finish()
    }
}

/// Drains the outbox until every broker handle is gone. Publish failures are
/// logged; pub/sub is best effort and consumers reconcile.
fn run_publisher(client: redis::Client, mut queued: mpsc::UnboundedReceiver<Outgoing>) {
    let mut conn = None;
    while let Some(Outgoing { channels, payload }) = queued.blocking_recv() {
        for channel in channels {
            // A stale connection gets one fresh retry.
            let published = publish_once(&client, &mut conn, &channel, &payload).or_else(|err| {
                debug!(channel = %channel, error = %err, "redis publish failed; reconnecting");
                publish_once(&client, &mut conn, &channel, &payload)
            });
            if let Err(err) = published {
                warn!(channel = %channel, error = %err, "redis publish failed; event dropped");
            }
        }
    }
    debug!("redis publisher stopped");
}

fn publish_once(
    client: &redis::Client,
    conn: &mut Option<redis::Connection>,
    channel: &str,
    payload: &str,
) -> redis::RedisResult<()> {
    let mut active = match conn.take() {
        Some(active) => active,
        None => client.get_connection()?,
    };
    let _: i64 = active.publish(channel, payload)?;
    *conn = Some(active);
    Ok(())
}

impl NotificationBroker<NotificationEvent> for RedisPubSubBroker {
    type Error = RedisBrokerError;

    fn publish(&self, message: NotificationEvent) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)?;
        let channels = message.channels().iter().map(|c| self.redis_channel(c)).collect();
        self.outbox
            .send(Outgoing { channels, payload })
            .map_err(|_| RedisBrokerError::PublisherStopped)
    }

    fn subscribe(&self, channel: &Channel) -> Subscription<NotificationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let redis_channel = self.redis_channel(channel);

        // Blocking reader thread; it exits once the subscription is dropped
        // and the next message cannot be forwarded.
        let spawned = thread::Builder::new()
            .name(format!("redis-sub-{}", channel.as_str()))
            .spawn(move || {
                let mut conn = match client.get_connection() {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(channel = %redis_channel, error = %err, "redis subscription failed to connect");
                        return;
                    }
                };
                let mut pubsub = conn.as_pubsub();
                if let Err(err) = pubsub.subscribe(&redis_channel) {
                    warn!(channel = %redis_channel, error = %err, "redis subscribe failed");
                    return;
                }

                loop {
                    let msg = match pubsub.get_message() {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(channel = %redis_channel, error = %err, "redis subscription closed");
                            return;
                        }
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    let event: NotificationEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(err) => {
                            debug!(channel = %redis_channel, error = %err, "skipping undecodable event");
                            continue;
                        }
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            });

        if let Err(err) = spawned {
            warn!(channel = %channel, error = %err, "failed to start redis subscription thread");
        }
        Subscription::new(channel.clone(), rx)
    }
}
