use std::fmt;

use shared::{
    domain::ChannelId,
    protocol::{Message, RealtimeEvent},
};
use tokio::sync::mpsc;

use crate::error::SyncError;

/// Selection lifecycle token. Bumped on every channel switch; async results tagged
/// with an older epoch are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one optimistic send. A retry of the same message gets a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of asynchronous work, fed back into the session's event sequence.
#[derive(Debug)]
pub enum Completion {
    HistoryLoaded {
        epoch: Epoch,
        channel_id: ChannelId,
        result: Result<Vec<Message>, SyncError>,
    },
    Remote {
        epoch: Epoch,
        channel_id: ChannelId,
        event: RealtimeEvent,
    },
    Persisted {
        attempt: AttemptId,
        result: Result<(), SyncError>,
    },
    Published {
        attempt: AttemptId,
        result: Result<(), SyncError>,
    },
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}
