use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ChannelId, MessageId, MessageType, UserId};

/// A chat message as the durable store and the realtime topic carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Message {
    pub fn text(
        id: MessageId,
        channel_id: ChannelId,
        user_id: UserId,
        content: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            channel_id,
            user_id,
            content: content.into(),
            message_type: MessageType::Text,
            reply_to: None,
            created_at: at,
            updated_at: at,
            is_deleted: false,
        }
    }
}

/// Payload of a `message_updated` event: the id plus whichever fields changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
}

impl MessagePatch {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            channel_id: None,
            user_id: None,
            content: None,
            message_type: None,
            reply_to: None,
            created_at: None,
            updated_at: None,
            is_deleted: None,
        }
    }

    pub fn hides(&self) -> bool {
        self.is_deleted == Some(true)
    }

    /// The complete message, when every field a `Message` requires is present.
    pub fn to_message(&self) -> Option<Message> {
        Some(Message {
            id: self.id.clone(),
            channel_id: self.channel_id.clone()?,
            user_id: self.user_id.clone()?,
            content: self.content.clone()?,
            message_type: self.message_type.clone().unwrap_or_default(),
            reply_to: self.reply_to.clone(),
            created_at: self.created_at?,
            updated_at: self.updated_at?,
            is_deleted: self.is_deleted.unwrap_or(false),
        })
    }

    /// Merges the present fields into `message`, leaving `id`, `channel_id` and
    /// `created_at` alone. Returns whether anything changed.
    pub fn apply_to(&self, message: &mut Message) -> bool {
        let before = message.clone();
        if let Some(user_id) = &self.user_id {
            message.user_id = user_id.clone();
        }
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(message_type) = &self.message_type {
            message.message_type = message_type.clone();
        }
        if let Some(reply_to) = &self.reply_to {
            message.reply_to = Some(reply_to.clone());
        }
        if let Some(updated_at) = self.updated_at {
            message.updated_at = updated_at;
        }
        if let Some(is_deleted) = self.is_deleted {
            message.is_deleted = is_deleted;
        }
        *message != before
    }
}

impl From<Message> for MessagePatch {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            channel_id: Some(message.channel_id),
            user_id: Some(message.user_id),
            content: Some(message.content),
            message_type: Some(message.message_type),
            reply_to: message.reply_to,
            created_at: Some(message.created_at),
            updated_at: Some(message.updated_at),
            is_deleted: Some(message.is_deleted),
        }
    }
}

/// Minimal payload of a `message_deleted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

/// Name of a broadcast topic on the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(pub String);

impl Topic {
    pub fn for_channel(channel_id: &ChannelId) -> Self {
        Self(format!("channel_{channel_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    MessageUpdated,
    MessageDeleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::MessageUpdated => "message_updated",
            EventKind::MessageDeleted => "message_deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_message" => Ok(EventKind::NewMessage),
            "message_updated" => Ok(EventKind::MessageUpdated),
            "message_deleted" => Ok(EventKind::MessageDeleted),
            other => Err(EventDecodeError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown realtime event kind '{0}'")]
    UnknownKind(String),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
#[error("failed to encode {kind} payload: {source}")]
pub struct EventEncodeError {
    pub kind: EventKind,
    #[source]
    pub source: serde_json::Error,
}

/// Events exchanged on a channel topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewMessage(Message),
    MessageUpdated(MessagePatch),
    MessageDeleted(MessageRef),
}

impl RealtimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RealtimeEvent::NewMessage(_) => EventKind::NewMessage,
            RealtimeEvent::MessageUpdated(_) => EventKind::MessageUpdated,
            RealtimeEvent::MessageDeleted(_) => EventKind::MessageDeleted,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            RealtimeEvent::NewMessage(message) => &message.id,
            RealtimeEvent::MessageUpdated(patch) => &patch.id,
            RealtimeEvent::MessageDeleted(target) => &target.id,
        }
    }

    /// Channel the payload claims to belong to, when it says.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            RealtimeEvent::NewMessage(message) => Some(&message.channel_id),
            RealtimeEvent::MessageUpdated(patch) => patch.channel_id.as_ref(),
            RealtimeEvent::MessageDeleted(target) => target.channel_id.as_ref(),
        }
    }

    /// Splits the event into the `(event kind, payload)` pair a transport publishes.
    pub fn to_parts(&self) -> Result<(EventKind, serde_json::Value), EventEncodeError> {
        let kind = self.kind();
        let payload = match self {
            RealtimeEvent::NewMessage(message) => serde_json::to_value(message),
            RealtimeEvent::MessageUpdated(patch) => serde_json::to_value(patch),
            RealtimeEvent::MessageDeleted(target) => serde_json::to_value(target),
        }
        .map_err(|source| EventEncodeError { kind, source })?;
        Ok((kind, payload))
    }

    pub fn from_parts(kind: &str, payload: serde_json::Value) -> Result<Self, EventDecodeError> {
        let kind = kind.parse::<EventKind>()?;
        let wrap = |source| EventDecodeError::Payload { kind, source };
        Ok(match kind {
            EventKind::NewMessage => {
                RealtimeEvent::NewMessage(serde_json::from_value(payload).map_err(wrap)?)
            }
            EventKind::MessageUpdated => {
                RealtimeEvent::MessageUpdated(serde_json::from_value(payload).map_err(wrap)?)
            }
            EventKind::MessageDeleted => {
                RealtimeEvent::MessageDeleted(serde_json::from_value(payload).map_err(wrap)?)
            }
        })
    }
}

/// `list` query against the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub include_deleted: bool,
    pub limit: u32,
}

impl MessageQuery {
    pub fn recent_visible(channel_id: ChannelId, limit: u32) -> Self {
        Self {
            channel_id,
            include_deleted: false,
            limit,
        }
    }
}
