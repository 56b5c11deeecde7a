//! Optimistic sends: a submitted message is shown at once, persisted in the
//! background, then announced on the channel topic. A failed persist withdraws
//! the entry and keeps the message around for retry.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{Message, RealtimeEvent, Topic},
};
use tracing::{debug, info, warn};

use crate::{
    bridge::RealtimeBridge,
    error::SyncError,
    store::MessageStore,
    types::{AttemptId, Completion, CompletionSender},
    DurableStore,
};

/// A send whose persist failed. Retrying reuses `message` unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedSend {
    pub attempt: AttemptId,
    pub message: Message,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Confirmed(MessageId),
    RolledBack(FailedSend),
}

pub struct OptimisticSendPipeline {
    user_id: UserId,
    durable: Arc<dyn DurableStore>,
    bridge: RealtimeBridge,
    completions: CompletionSender,
    draft: String,
    next_attempt: u64,
    in_flight: BTreeMap<AttemptId, Message>,
    failed: Vec<FailedSend>,
}

impl OptimisticSendPipeline {
    pub fn new(
        user_id: UserId,
        durable: Arc<dyn DurableStore>,
        bridge: RealtimeBridge,
        completions: CompletionSender,
    ) -> Self {
        Self {
            user_id,
            durable,
            bridge,
            completions,
            draft: String::new(),
            next_attempt: 1,
            in_flight: BTreeMap::new(),
            failed: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    pub fn failed_sends(&self) -> &[FailedSend] {
        &self.failed
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Sends the current draft to `channel_id`. The draft is cleared on acceptance;
    /// an empty draft is rejected and left as is.
    pub fn submit(
        &mut self,
        store: &mut MessageStore,
        channel_id: Option<&ChannelId>,
    ) -> Result<AttemptId, SyncError> {
        let draft = self.draft.clone();
        let attempt = self.send_text(store, channel_id, &draft)?;
        self.draft.clear();
        Ok(attempt)
    }

    /// Sends `text` without touching the draft.
    pub fn send_text(
        &mut self,
        store: &mut MessageStore,
        channel_id: Option<&ChannelId>,
        text: &str,
    ) -> Result<AttemptId, SyncError> {
        let channel_id = channel_id.ok_or(SyncError::NoActiveChannel)?;
        let content = text.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let message = Message::text(
            MessageId::generate(),
            channel_id.clone(),
            self.user_id.clone(),
            content,
            Utc::now(),
        );
        Ok(self.launch(store, message))
    }

    /// Re-sends a failed message under a new attempt. Only allowed while its
    /// channel is the selected one.
    pub fn retry(
        &mut self,
        store: &mut MessageStore,
        channel_id: Option<&ChannelId>,
        attempt: AttemptId,
    ) -> Result<AttemptId, SyncError> {
        let index = self.failed_index(attempt)?;
        let active = channel_id.ok_or(SyncError::NoActiveChannel)?;
        let expected = &self.failed[index].message.channel_id;
        if expected != active {
            return Err(SyncError::ChannelMismatch {
                expected: expected.clone(),
                actual: active.clone(),
            });
        }
        let failed = self.failed.remove(index);
        info!(
            previous_attempt = %attempt,
            message_id = %failed.message.id,
            "send: retrying failed message"
        );
        Ok(self.launch(store, failed.message))
    }

    pub fn dismiss(&mut self, attempt: AttemptId) -> Result<FailedSend, SyncError> {
        let index = self.failed_index(attempt)?;
        Ok(self.failed.remove(index))
    }

    /// Applies the persist result of `attempt`. Returns `None` for attempts this
    /// pipeline no longer tracks.
    pub fn on_persisted(
        &mut self,
        store: &mut MessageStore,
        attempt: AttemptId,
        result: Result<(), SyncError>,
    ) -> Option<SendOutcome> {
        let Some(message) = self.in_flight.remove(&attempt) else {
            debug!(%attempt, "send: persist result for unknown attempt");
            return None;
        };

        match result {
            Ok(()) => {
                store.confirm(attempt);
                let message_id = message.id.clone();
                debug!(%attempt, %message_id, "send: persisted");
                self.spawn_publish(attempt, message);
                Some(SendOutcome::Confirmed(message_id))
            }
            Err(err) => {
                store.rollback(attempt);
                warn!(
                    %attempt,
                    message_id = %message.id,
                    channel_id = %message.channel_id,
                    "send: persist failed, optimistic entry withdrawn: {err}"
                );
                let failed = FailedSend {
                    attempt,
                    message,
                    reason: err.to_string(),
                };
                self.failed.push(failed.clone());
                Some(SendOutcome::RolledBack(failed))
            }
        }
    }

    /// The message is durable either way; a failed announce is only reported.
    pub fn on_published(
        &self,
        attempt: AttemptId,
        result: Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        match &result {
            Ok(()) => debug!(%attempt, "send: announced"),
            Err(err) => warn!(%attempt, "send: announce failed: {err}"),
        }
        result
    }

    /// Puts in-flight messages of the store's channel back after a history reset.
    pub fn reapply_in_flight(&self, store: &mut MessageStore) {
        let Some(channel_id) = store.channel_id().cloned() else {
            return;
        };
        for (attempt, message) in &self.in_flight {
            if message.channel_id == channel_id {
                store.apply_optimistic(message.clone(), *attempt);
            }
        }
    }

    fn launch(&mut self, store: &mut MessageStore, message: Message) -> AttemptId {
        let attempt = AttemptId(self.next_attempt);
        self.next_attempt += 1;

        store.apply_optimistic(message.clone(), attempt);
        self.in_flight.insert(attempt, message.clone());
        info!(
            %attempt,
            message_id = %message.id,
            channel_id = %message.channel_id,
            "send: message submitted"
        );

        let durable = Arc::clone(&self.durable);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = durable
                .create(&message)
                .await
                .map_err(|source| SyncError::PersistFailure {
                    message_id: message.id.clone(),
                    source,
                });
            let _ = completions.send(Completion::Persisted { attempt, result });
        });
        attempt
    }

    fn spawn_publish(&self, attempt: AttemptId, message: Message) {
        let bridge = self.bridge.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let topic = Topic::for_channel(&message.channel_id);
            let result = bridge
                .publish(&topic, &RealtimeEvent::NewMessage(message))
                .await;
            let _ = completions.send(Completion::Published { attempt, result });
        });
    }

    fn failed_index(&self, attempt: AttemptId) -> Result<usize, SyncError> {
        self.failed
            .iter()
            .position(|failed| failed.attempt == attempt)
            .ok_or(SyncError::UnknownAttempt(attempt))
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
