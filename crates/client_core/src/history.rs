use std::sync::Arc;

use shared::{
    domain::ChannelId,
    protocol::{Message, MessageQuery},
};
use tracing::{debug, warn};

use crate::{error::SyncError, DurableStore};

/// Fetches the first page of a channel from the durable store.
///
/// Loading never touches shared state; the caller decides what to do with the
/// result, including dropping it when the selection has moved on.
#[derive(Clone)]
pub struct HistoryLoader {
    store: Arc<dyn DurableStore>,
    page_size: u32,
}

impl HistoryLoader {
    pub fn new(store: Arc<dyn DurableStore>, page_size: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub async fn load(&self, channel_id: &ChannelId) -> Result<Vec<Message>, SyncError> {
        let query = MessageQuery::recent_visible(channel_id.clone(), self.page_size);
        let mut messages =
            self.store
                .list(&query)
                .await
                .map_err(|source| SyncError::LoadFailure {
                    channel_id: channel_id.clone(),
                    source,
                })?;

        let fetched = messages.len();
        messages.retain(|message| !message.is_deleted && message.channel_id == *channel_id);
        if messages.len() != fetched {
            warn!(
                %channel_id,
                dropped = fetched - messages.len(),
                "history: store returned deleted or foreign messages"
            );
        }
        messages.sort_by_key(|message| message.created_at);
        messages.truncate(self.page_size as usize);

        debug!(%channel_id, count = messages.len(), "history: page loaded");
        Ok(messages)
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
