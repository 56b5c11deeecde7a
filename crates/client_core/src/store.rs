//! Ordered, deduplicated message sequence for the selected channel.
//!
//! Entries are kept ascending by `created_at`; equal timestamps keep the order in
//! which they were applied. Ids are unique at all times, so every merge below is an
//! idempotent upsert. Entries flagged `is_deleted` keep their slot but are not part
//! of the visible sequence.

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ChannelId, MessageId},
    protocol::{Message, MessagePatch},
};
use tracing::{debug, trace, warn};

use crate::types::AttemptId;

#[derive(Debug, Default)]
pub struct MessageStore {
    channel_id: Option<ChannelId>,
    entries: Vec<Message>,
    /// Optimistic entries not yet confirmed, by the attempt that applied them.
    pending: HashMap<MessageId, AttemptId>,
    /// Ids deleted during this channel lifecycle; late creates must not resurrect them.
    tombstones: HashSet<MessageId>,
    revision: u64,
}

/// Borrowed view of the rendered sequence.
#[derive(Debug, Clone, Copy)]
pub struct Visible<'a> {
    entries: &'a [Message],
}

impl<'a> Visible<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &'a Message> + 'a {
        self.entries.iter().filter(|message| !message.is_deleted)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn ids(&self) -> Vec<&'a str> {
        self.iter().map(|message| message.id.as_str()).collect()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.channel_id.as_ref()
    }

    /// Bumped on every change to the stored entries.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn visible(&self) -> Visible<'_> {
        Visible {
            entries: &self.entries,
        }
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.position(message_id).map(|index| &self.entries[index])
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.position(message_id).is_some()
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.pending.contains_key(message_id)
    }

    /// Empties the store and binds it to `channel_id` (or to nothing).
    pub fn switch_to(&mut self, channel_id: Option<ChannelId>) -> Visible<'_> {
        self.channel_id = channel_id;
        self.entries.clear();
        self.pending.clear();
        self.tombstones.clear();
        self.bump();
        self.visible()
    }

    /// Replaces the whole content with `messages`.
    ///
    /// Messages of another channel and deleted messages are dropped, duplicates keep
    /// their first occurrence, and the result is stably sorted by `created_at`.
    pub fn reset(&mut self, messages: Vec<Message>) -> Visible<'_> {
        let mut seen = HashSet::with_capacity(messages.len());
        let mut entries = Vec::with_capacity(messages.len());
        for message in messages {
            if !self.accepts_channel(&message.id, Some(&message.channel_id)) || message.is_deleted {
                continue;
            }
            if !seen.insert(message.id.clone()) {
                debug!(message_id = %message.id, "store: duplicate id in reset input");
                continue;
            }
            entries.push(message);
        }
        entries.sort_by_key(|message| message.created_at);

        self.entries = entries;
        self.pending.clear();
        self.tombstones.clear();
        self.bump();
        self.visible()
    }

    /// Inserts at the ordered position; a known id is left untouched.
    pub fn apply_create(&mut self, message: Message) -> Visible<'_> {
        if !self.accepts(&message.id, Some(&message.channel_id)) {
            return self.visible();
        }
        if self.contains(&message.id) {
            trace!(message_id = %message.id, "store: duplicate create absorbed");
            self.mark_confirmed(&message.id);
            return self.visible();
        }
        if message.is_deleted {
            return self.visible();
        }
        self.insert_ordered(message);
        self.visible()
    }

    /// Applies a locally originated message that has not been persisted yet.
    pub fn apply_optimistic(&mut self, message: Message, attempt: AttemptId) -> Visible<'_> {
        if !self.accepts(&message.id, Some(&message.channel_id)) || self.contains(&message.id) {
            return self.visible();
        }
        self.pending.insert(message.id.clone(), attempt);
        self.insert_ordered(message);
        self.visible()
    }

    /// Marks the entry applied by `attempt` as durable. Returns whether it was pending.
    pub fn confirm(&mut self, attempt: AttemptId) -> bool {
        match self.pending_id(attempt) {
            Some(message_id) => {
                self.pending.remove(&message_id);
                true
            }
            None => false,
        }
    }

    /// Merges the fields carried by `patch` into the entry with the same id, in place.
    ///
    /// An update for an unknown id acts as a create when it carries a whole message
    /// that is not marked deleted; a partial one is dropped.
    pub fn apply_update(&mut self, patch: impl Into<MessagePatch>) -> Visible<'_> {
        let patch = patch.into();
        if !self.accepts(&patch.id, patch.channel_id.as_ref()) {
            return self.visible();
        }
        match self.position(&patch.id) {
            Some(index) => {
                self.mark_confirmed(&patch.id);
                if patch.apply_to(&mut self.entries[index]) {
                    self.bump();
                }
            }
            None if patch.hides() => {
                trace!(message_id = %patch.id, "store: update hides an unknown id");
            }
            None => match patch.to_message() {
                Some(message) => {
                    debug!(message_id = %message.id, "store: update for unknown id treated as create");
                    self.insert_ordered(message);
                }
                None => {
                    debug!(message_id = %patch.id, "store: partial update for unknown id dropped");
                }
            },
        }
        self.visible()
    }

    /// Removes the entry; unknown ids only leave a tombstone.
    pub fn apply_delete(&mut self, message_id: &MessageId) -> Visible<'_> {
        self.tombstones.insert(message_id.clone());
        self.pending.remove(message_id);
        if let Some(index) = self.position(message_id) {
            self.entries.remove(index);
            self.bump();
        }
        self.visible()
    }

    /// Withdraws the entry applied by `attempt` if it is still unconfirmed.
    ///
    /// Once the message was confirmed (by persistence or by arriving from the
    /// remote side) this is a no-op.
    pub fn rollback(&mut self, attempt: AttemptId) -> Visible<'_> {
        if let Some(message_id) = self.pending_id(attempt) {
            self.pending.remove(&message_id);
            if let Some(index) = self.position(&message_id) {
                self.entries.remove(index);
                self.bump();
            }
            debug!(%attempt, %message_id, "store: optimistic entry rolled back");
        }
        self.visible()
    }

    fn accepts(&self, message_id: &MessageId, channel_id: Option<&ChannelId>) -> bool {
        if !self.accepts_channel(message_id, channel_id) {
            return false;
        }
        if self.tombstones.contains(message_id) {
            trace!(%message_id, "store: ignoring message deleted earlier");
            return false;
        }
        true
    }

    /// A payload that names no channel is taken to belong to the bound one.
    fn accepts_channel(&self, message_id: &MessageId, channel_id: Option<&ChannelId>) -> bool {
        match (&self.channel_id, channel_id) {
            (Some(bound), Some(claimed)) if bound != claimed => {
                warn!(
                    store_channel = %bound,
                    message_channel = %claimed,
                    %message_id,
                    "store: rejecting message from another channel"
                );
                false
            }
            _ => true,
        }
    }

    fn insert_ordered(&mut self, message: Message) {
        let index = self
            .entries
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.entries.insert(index, message);
        self.bump();
    }

    fn mark_confirmed(&mut self, message_id: &MessageId) {
        if self.pending.remove(message_id).is_some() {
            trace!(%message_id, "store: optimistic entry confirmed by delivery");
        }
    }

    fn pending_id(&self, attempt: AttemptId) -> Option<MessageId> {
        self.pending
            .iter()
            .find(|(_, pending)| **pending == attempt)
            .map(|(message_id, _)| message_id.clone())
    }

    fn position(&self, message_id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|message| message.id == *message_id)
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
