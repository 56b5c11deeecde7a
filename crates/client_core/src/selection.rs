//! Channel selection lifecycle: `Idle -> Loading(epoch) -> Subscribed(epoch)`.
//!
//! The controller owns the [`MessageStore`] and the single live subscription.
//! Every selection bumps the epoch; history loads and realtime deliveries are
//! tagged with the epoch they were issued under and dropped once it is stale.

use shared::{
    domain::ChannelId,
    protocol::{Message, RealtimeEvent, Topic},
};
use tracing::{debug, info, trace, warn};

use crate::{
    bridge::{RealtimeBridge, SubscriptionHandle},
    error::SyncError,
    history::HistoryLoader,
    store::MessageStore,
    types::{Completion, CompletionSender, Epoch},
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionState {
    #[default]
    Idle,
    Loading {
        channel_id: ChannelId,
        epoch: Epoch,
    },
    Subscribed {
        channel_id: ChannelId,
        epoch: Epoch,
    },
}

#[derive(Debug)]
pub enum HistoryOutcome {
    Applied { count: usize },
    Failed(SyncError),
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    Buffered,
    Stale,
    ForeignChannel,
}

pub struct ChannelSelectionController {
    loader: HistoryLoader,
    bridge: RealtimeBridge,
    completions: CompletionSender,
    store: MessageStore,
    epoch: Epoch,
    state: SelectionState,
    subscription: Option<SubscriptionHandle>,
    /// Remote events received while the current epoch is still loading.
    buffered: Vec<RealtimeEvent>,
}

impl ChannelSelectionController {
    pub fn new(loader: HistoryLoader, bridge: RealtimeBridge, completions: CompletionSender) -> Self {
        Self {
            loader,
            bridge,
            completions,
            store: MessageStore::new(),
            epoch: Epoch::default(),
            state: SelectionState::Idle,
            subscription: None,
            buffered: Vec::new(),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MessageStore {
        &mut self.store
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn active_channel(&self) -> Option<&ChannelId> {
        match &self.state {
            SelectionState::Idle => None,
            SelectionState::Loading { channel_id, .. }
            | SelectionState::Subscribed { channel_id, .. } => Some(channel_id),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, SelectionState::Loading { .. })
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(SubscriptionHandle::is_active)
    }

    /// Switches to `channel_id`: the previous subscription is released, the store is
    /// emptied, the new topic is subscribed and its history load started.
    ///
    /// The subscription is registered before the load is issued so that nothing
    /// published in between is missed; deliveries are buffered until the history
    /// is applied.
    pub async fn select(&mut self, channel_id: ChannelId) -> Result<Epoch, SyncError> {
        self.epoch = self.epoch.next();
        let epoch = self.epoch;
        self.release();
        self.store.switch_to(Some(channel_id.clone()));
        self.state = SelectionState::Loading {
            channel_id: channel_id.clone(),
            epoch,
        };

        let topic = Topic::for_channel(&channel_id);
        let completions = self.completions.clone();
        let handler_channel = channel_id.clone();
        let subscribed = self
            .bridge
            .subscribe(topic, move |event| {
                let _ = completions.send(Completion::Remote {
                    epoch,
                    channel_id: handler_channel.clone(),
                    event,
                });
            })
            .await;
        match subscribed {
            Ok(handle) => self.subscription = Some(handle),
            Err(err) => {
                warn!(%channel_id, %epoch, "selection: subscribe failed: {err}");
                self.clear();
                return Err(err);
            }
        }

        self.spawn_load(epoch, channel_id.clone());
        info!(%channel_id, %epoch, "selection: channel selected");
        Ok(epoch)
    }

    /// Runs the selection lifecycle again for the current channel.
    pub async fn reload(&mut self) -> Result<Epoch, SyncError> {
        let channel_id = self
            .active_channel()
            .cloned()
            .ok_or(SyncError::NoActiveChannel)?;
        self.select(channel_id).await
    }

    /// Back to `Idle`: pending work of the current epoch becomes stale.
    pub fn clear(&mut self) {
        self.epoch = self.epoch.next();
        self.release();
        self.store.switch_to(None);
        if self.state != SelectionState::Idle {
            info!(epoch = %self.epoch, "selection: cleared");
        }
        self.state = SelectionState::Idle;
    }

    pub fn on_history_loaded(
        &mut self,
        epoch: Epoch,
        channel_id: ChannelId,
        result: Result<Vec<Message>, SyncError>,
    ) -> HistoryOutcome {
        let current = matches!(
            &self.state,
            SelectionState::Loading { channel_id: active, epoch: loading }
                if *loading == epoch && *active == channel_id
        );
        if !current {
            debug!(%channel_id, %epoch, current = %self.epoch, "selection: discarding stale history");
            return HistoryOutcome::Stale;
        }

        self.state = SelectionState::Subscribed {
            channel_id: channel_id.clone(),
            epoch,
        };
        match result {
            Ok(messages) => {
                self.store.reset(messages);
                let buffered = std::mem::take(&mut self.buffered);
                let replayed = buffered.len();
                for event in buffered {
                    self.apply_event(event);
                }
                let count = self.store.visible().len();
                debug!(%channel_id, %epoch, count, replayed, "selection: history applied");
                HistoryOutcome::Applied { count }
            }
            // The store holds no remote data yet, only sends made during the load.
            Err(err) => {
                let dropped = std::mem::take(&mut self.buffered).len();
                warn!(%channel_id, %epoch, dropped, "selection: history load failed: {err}");
                HistoryOutcome::Failed(err)
            }
        }
    }

    pub fn on_remote(
        &mut self,
        epoch: Epoch,
        channel_id: ChannelId,
        event: RealtimeEvent,
    ) -> RemoteOutcome {
        if epoch != self.epoch || self.active_channel() != Some(&channel_id) {
            trace!(%channel_id, %epoch, kind = %event.kind(), "selection: discarding stale delivery");
            return RemoteOutcome::Stale;
        }
        if let Some(claimed) = event.channel_id() {
            if *claimed != channel_id {
                warn!(
                    %channel_id,
                    claimed = %claimed,
                    message_id = %event.message_id(),
                    "selection: event for another channel on this topic"
                );
                return RemoteOutcome::ForeignChannel;
            }
        }

        if self.is_loading() {
            trace!(%channel_id, %epoch, message_id = %event.message_id(), "selection: buffering event during load");
            self.buffered.push(event);
            return RemoteOutcome::Buffered;
        }
        self.apply_event(event);
        RemoteOutcome::Applied
    }

    fn apply_event(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::NewMessage(message) => {
                self.store.apply_create(message);
            }
            RealtimeEvent::MessageUpdated(patch) => {
                self.store.apply_update(patch);
            }
            RealtimeEvent::MessageDeleted(target) => {
                self.store.apply_delete(&target.id);
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.buffered.clear();
    }

    fn spawn_load(&self, epoch: Epoch, channel_id: ChannelId) {
        let loader = self.loader.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = loader.load(&channel_id).await;
            let _ = completions.send(Completion::HistoryLoaded {
                epoch,
                channel_id,
                result,
            });
        });
    }
}

#[cfg(test)]
#[path = "tests/selection_tests.rs"]
mod tests;
