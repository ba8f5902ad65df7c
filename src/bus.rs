//! In-process publish/subscribe bus.
//!
//! Every topic gets its own broadcast channel. Subscribers each get an
//! independent cursor; a subscriber that falls behind loses the messages
//! it couldn't keep up with rather than stalling the publisher. This is a
//! deliberate trade-off, not a bug: components downstream of the bus are
//! expected to reconcile state at their own boundaries instead of relying
//! on exactly-once delivery.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

/// Handle to a single topic's message stream. Closes cleanly when dropped.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Value>,
}

impl Subscription {
    /// Waits for the next message published after this subscription was
    /// created. Returns `None` once the bus itself is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged, messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Default)]
struct Topics {
    senders: HashMap<String, broadcast::Sender<Value>>,
}

/// In-process pub/sub bus. Cheaply cloneable; all clones share the same
/// topic table.
#[derive(Clone, Default)]
pub struct Bus {
    topics: Arc<Mutex<Topics>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock();
        topics
            .senders
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publishes a payload to `topic`. A no-op (not an error) if nobody is
    /// currently subscribed.
    pub fn publish(&self, topic: &str, payload: Value) {
        let sender = self.sender_for(topic);
        let _ = sender.send(payload);
    }

    /// Subscribes to `topic`. Only messages published after this call are
    /// visible to the returned subscription.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let sender = self.sender_for(topic);
        Subscription {
            topic: topic.to_string(),
            rx: sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_only_sees_messages_after_subscribing() {
        let bus = Bus::new();
        bus.publish("topic.a", serde_json::json!({"before": true}));

        let mut sub = bus.subscribe("topic.a");
        bus.publish("topic.a", serde_json::json!({"after": true}));

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg["after"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_every_message() {
        let bus = Bus::new();
        let mut sub_a = bus.subscribe("topic.b");
        let mut sub_b = bus.subscribe("topic.b");

        bus.publish("topic.b", serde_json::json!(1));

        assert_eq!(sub_a.recv().await.unwrap(), serde_json::json!(1));
        assert_eq!(sub_b.recv().await.unwrap(), serde_json::json!(1));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = Bus::new();
        bus.publish("topic.c", serde_json::json!(null));
    }
}
