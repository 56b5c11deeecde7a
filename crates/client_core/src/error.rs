use shared::{
    domain::{ChannelId, MessageId},
    protocol::{EventKind, Topic},
};
use thiserror::Error;

use crate::types::AttemptId;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to load history for channel {channel_id}: {source}")]
    LoadFailure {
        channel_id: ChannelId,
        source: anyhow::Error,
    },
    #[error("failed to persist message {message_id}: {source}")]
    PersistFailure {
        message_id: MessageId,
        source: anyhow::Error,
    },
    #[error("failed to publish {kind} on {topic}: {source}")]
    PublishFailure {
        topic: Topic,
        kind: EventKind,
        source: anyhow::Error,
    },
    #[error("failed to subscribe to {topic}: {source}")]
    SubscribeFailure { topic: Topic, source: anyhow::Error },
    #[error("no channel selected")]
    NoActiveChannel,
    #[error("message is empty")]
    EmptyMessage,
    #[error("unknown send attempt {0}")]
    UnknownAttempt(AttemptId),
    #[error("send attempt belongs to channel {expected}, but {actual} is selected")]
    ChannelMismatch {
        expected: ChannelId,
        actual: ChannelId,
    },
    #[error("chat session is closed")]
    SessionClosed,
}

impl SyncError {
    /// Failures the user can act on by retrying the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::LoadFailure { .. }
                | SyncError::PersistFailure { .. }
                | SyncError::PublishFailure { .. }
                | SyncError::SubscribeFailure { .. }
        )
    }
}
