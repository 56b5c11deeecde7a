//! Message synchronization core for one chat viewer.
//!
//! A [`ChatSession`] keeps the visible message list of the selected channel
//! consistent with the durable store and the realtime topic of that channel,
//! and shows locally sent messages before they are confirmed.

pub mod bridge;
pub mod error;
pub mod history;
pub mod selection;
pub mod send;
pub mod session;
pub mod store;
pub mod types;

use async_trait::async_trait;
use shared::protocol::{Message, MessageQuery};
use storage::Storage;

pub use bridge::{RealtimeBridge, SubscriptionHandle};
pub use error::SyncError;
pub use history::HistoryLoader;
pub use selection::{ChannelSelectionController, SelectionState};
pub use send::{FailedSend, OptimisticSendPipeline, SendOutcome};
pub use session::{ChatSession, ClientEvent, SessionContext, SessionHandle, SessionSnapshot};
pub use store::MessageStore;
pub use types::{AttemptId, Epoch};

pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 100;
pub const MAX_HISTORY_PAGE_SIZE: u32 = storage::MAX_PAGE_SIZE;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub history_page_size: u32,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn normalized(self) -> Self {
        Self {
            history_page_size: self.history_page_size.clamp(1, MAX_HISTORY_PAGE_SIZE),
            event_capacity: self.event_capacity.max(1),
        }
    }
}

/// Durable message store as seen by the sync core.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Idempotent on `message.id`.
    async fn create(&self, message: &Message) -> anyhow::Result<()>;

    /// Non-deleted messages of a channel, ascending by `created_at`.
    async fn list(&self, query: &MessageQuery) -> anyhow::Result<Vec<Message>>;
}

#[async_trait]
impl DurableStore for Storage {
    async fn create(&self, message: &Message) -> anyhow::Result<()> {
        self.create_message(message).await.map(|_| ())
    }

    async fn list(&self, query: &MessageQuery) -> anyhow::Result<Vec<Message>> {
        self.list_channel_messages(query).await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
