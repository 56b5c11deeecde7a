//! Realtime transport seam: named topics carrying `(event kind, payload)` frames.
//!
//! Delivery is best-effort. Publishers receive their own frames when subscribed to the
//! topic they publish on, and nothing is ordered across publishers.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::protocol::Topic;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    pub topic: Topic,
    pub kind: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Registers a listener on `topic`. Dropping the receiver releases it.
    async fn subscribe(&self, topic: &Topic) -> anyhow::Result<broadcast::Receiver<BroadcastFrame>>;

    async fn publish(
        &self,
        topic: &Topic,
        kind: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// In-process fan-out with one broadcast channel per topic.
pub struct LocalBroadcastHub {
    capacity: usize,
    topics: Mutex<HashMap<Topic, broadcast::Sender<BroadcastFrame>>>,
}

impl Default for LocalBroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live receivers on `topic`.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RealtimeTransport for LocalBroadcastHub {
    async fn subscribe(&self, topic: &Topic) -> anyhow::Result<broadcast::Receiver<BroadcastFrame>> {
        let mut topics = self.topics.lock().await;
        topics.retain(|_, sender| sender.receiver_count() > 0);
        let receiver = topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(%topic, "realtime: subscribed");
        Ok(receiver)
    }

    async fn publish(
        &self,
        topic: &Topic,
        kind: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let topics = self.topics.lock().await;
        let Some(sender) = topics.get(topic) else {
            trace!(%topic, kind, "realtime: publish with no listeners");
            return Ok(());
        };
        let frame = BroadcastFrame {
            topic: topic.clone(),
            kind: kind.to_string(),
            payload,
        };
        match sender.send(frame) {
            Ok(delivered) => trace!(%topic, kind, delivered, "realtime: published"),
            Err(_) => trace!(%topic, kind, "realtime: publish with no listeners"),
        }
        Ok(())
    }
}
