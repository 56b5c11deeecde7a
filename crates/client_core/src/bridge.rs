use std::sync::Arc;

use futures::StreamExt;
use realtime_transport::RealtimeTransport;
use shared::protocol::{RealtimeEvent, Topic};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::error::SyncError;

/// Typed view over a [`RealtimeTransport`]: decodes inbound frames into
/// [`RealtimeEvent`]s and encodes outbound ones.
#[derive(Clone)]
pub struct RealtimeBridge {
    transport: Arc<dyn RealtimeTransport>,
}

/// Live registration on a topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: Topic,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops delivery to the handler. Calling it again does nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(topic = %self.topic, "realtime: unsubscribed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl RealtimeBridge {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self { transport }
    }

    /// Delivers every decodable event on `topic` to `handler` until the returned
    /// handle is unsubscribed or dropped. Malformed frames are logged and skipped.
    pub async fn subscribe<F>(&self, topic: Topic, handler: F) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(RealtimeEvent) + Send + Sync + 'static,
    {
        let receiver = self
            .transport
            .subscribe(&topic)
            .await
            .map_err(|source| SyncError::SubscribeFailure {
                topic: topic.clone(),
                source,
            })?;

        let task_topic = topic.clone();
        let task = tokio::spawn(async move {
            let mut frames = BroadcastStream::new(receiver);
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) => match RealtimeEvent::from_parts(&frame.kind, frame.payload) {
                        Ok(event) => handler(event),
                        Err(err) => warn!(
                            topic = %task_topic,
                            kind = %frame.kind,
                            "realtime: dropping malformed frame: {err}"
                        ),
                    },
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => warn!(
                        topic = %task_topic,
                        skipped,
                        "realtime: subscriber lagged, frames lost"
                    ),
                }
            }
            debug!(topic = %task_topic, "realtime: topic closed");
        });

        debug!(%topic, "realtime: handler attached");
        Ok(SubscriptionHandle {
            topic,
            task: Some(task),
        })
    }

    pub async fn publish(&self, topic: &Topic, event: &RealtimeEvent) -> Result<(), SyncError> {
        let kind = event.kind();
        let (_, payload) = event.to_parts().map_err(|err| SyncError::PublishFailure {
            topic: topic.clone(),
            kind,
            source: anyhow::Error::new(err),
        })?;
        self.transport
            .publish(topic, kind.as_str(), payload)
            .await
            .map_err(|source| SyncError::PublishFailure {
                topic: topic.clone(),
                kind,
                source,
            })
    }
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
