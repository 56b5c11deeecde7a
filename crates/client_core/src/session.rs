//! Single task that owns the selection controller, its store and the send
//! pipeline. Commands from handles and completions of spawned I/O are handled
//! one at a time, so the store never sees concurrent mutation.

use std::sync::Arc;

use realtime_transport::RealtimeTransport;
use shared::{
    domain::{ChannelId, UserId},
    protocol::Message,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::{
    bridge::RealtimeBridge,
    error::SyncError,
    history::HistoryLoader,
    selection::{ChannelSelectionController, HistoryOutcome},
    send::{FailedSend, OptimisticSendPipeline, SendOutcome},
    types::{completion_channel, AttemptId, Completion, CompletionReceiver, Epoch},
    DurableStore, SyncConfig,
};

const COMMAND_CAPACITY: usize = 64;

/// Everything a session needs; there is no process-wide client.
#[derive(Clone)]
pub struct SessionContext {
    pub user_id: UserId,
    pub durable: Arc<dyn DurableStore>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub config: SyncConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SelectionChanged {
        channel_id: Option<ChannelId>,
        epoch: Epoch,
    },
    LoadingChanged {
        channel_id: ChannelId,
        loading: bool,
    },
    /// The visible sequence of the selected channel changed.
    MessagesChanged {
        channel_id: Option<ChannelId>,
        messages: Vec<Message>,
    },
    LoadFailed {
        channel_id: ChannelId,
        reason: String,
    },
    SendFailed(FailedSend),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub channel_id: Option<ChannelId>,
    pub epoch: Epoch,
    pub loading: bool,
    pub subscribed: bool,
    pub messages: Vec<Message>,
    pub draft: String,
    pub failed_sends: Vec<FailedSend>,
}

enum Command {
    SelectChannel {
        channel_id: ChannelId,
        reply: oneshot::Sender<Result<Epoch, SyncError>>,
    },
    ClearSelection {
        reply: oneshot::Sender<()>,
    },
    Reload {
        reply: oneshot::Sender<Result<Epoch, SyncError>>,
    },
    SetDraft {
        draft: String,
        reply: oneshot::Sender<()>,
    },
    Submit {
        reply: oneshot::Sender<Result<AttemptId, SyncError>>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<Result<AttemptId, SyncError>>,
    },
    RetrySend {
        attempt: AttemptId,
        reply: oneshot::Sender<Result<AttemptId, SyncError>>,
    },
    DismissFailedSend {
        attempt: AttemptId,
        reply: oneshot::Sender<Result<FailedSend, SyncError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front of a running [`ChatSession`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl SessionHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn select_channel(&self, channel_id: impl Into<ChannelId>) -> Result<Epoch, SyncError> {
        let channel_id = channel_id.into();
        self.request(|reply| Command::SelectChannel { channel_id, reply })
            .await?
    }

    pub async fn clear_selection(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::ClearSelection { reply }).await
    }

    pub async fn reload(&self) -> Result<Epoch, SyncError> {
        self.request(|reply| Command::Reload { reply }).await?
    }

    pub async fn set_draft(&self, draft: impl Into<String>) -> Result<(), SyncError> {
        let draft = draft.into();
        self.request(|reply| Command::SetDraft { draft, reply }).await
    }

    /// Sends the current draft.
    pub async fn submit(&self) -> Result<AttemptId, SyncError> {
        self.request(|reply| Command::Submit { reply }).await?
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<AttemptId, SyncError> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply })
            .await?
    }

    pub async fn retry_send(&self, attempt: AttemptId) -> Result<AttemptId, SyncError> {
        self.request(|reply| Command::RetrySend { attempt, reply })
            .await?
    }

    pub async fn dismiss_failed_send(&self, attempt: AttemptId) -> Result<FailedSend, SyncError> {
        self.request(|reply| Command::DismissFailedSend { attempt, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SyncError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stops the session task and releases its subscription.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        response.await.map_err(|_| SyncError::SessionClosed)
    }
}

pub struct ChatSession {
    user_id: UserId,
    selection: ChannelSelectionController,
    sends: OptimisticSendPipeline,
    events: broadcast::Sender<ClientEvent>,
    emitted_revision: u64,
}

impl ChatSession {
    /// Starts the session task on the current runtime.
    pub fn spawn(ctx: SessionContext) -> SessionHandle {
        let config = ctx.config.normalized();
        let (completions, completion_rx) = completion_channel();
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity);

        let bridge = RealtimeBridge::new(ctx.transport);
        let loader = HistoryLoader::new(Arc::clone(&ctx.durable), config.history_page_size);
        let selection = ChannelSelectionController::new(loader, bridge.clone(), completions.clone());
        let sends = OptimisticSendPipeline::new(ctx.user_id.clone(), ctx.durable, bridge, completions);

        let session = ChatSession {
            user_id: ctx.user_id,
            emitted_revision: selection.store().revision(),
            selection,
            sends,
            events: events.clone(),
        };
        tokio::spawn(session.run(command_rx, completion_rx));

        SessionHandle { commands, events }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut completions: CompletionReceiver) {
        info!(user_id = %self.user_id, "session: started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.selection.clear();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
            }
            self.emit_messages_if_changed();
        }
        self.selection.clear();
        info!(user_id = %self.user_id, "session: stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectChannel { channel_id, reply } => {
                let result = self.selection.select(channel_id).await;
                self.after_selection(&result);
                let _ = reply.send(result);
            }
            Command::Reload { reply } => {
                let result = self.selection.reload().await;
                self.after_selection(&result);
                let _ = reply.send(result);
            }
            Command::ClearSelection { reply } => {
                self.selection.clear();
                self.emit(ClientEvent::SelectionChanged {
                    channel_id: None,
                    epoch: self.selection.epoch(),
                });
                let _ = reply.send(());
            }
            Command::SetDraft { draft, reply } => {
                self.sends.set_draft(draft);
                let _ = reply.send(());
            }
            Command::Submit { reply } => {
                let channel_id = self.selection.active_channel().cloned();
                let result = self
                    .sends
                    .submit(self.selection.store_mut(), channel_id.as_ref());
                let _ = reply.send(result);
            }
            Command::SendText { text, reply } => {
                let channel_id = self.selection.active_channel().cloned();
                let result =
                    self.sends
                        .send_text(self.selection.store_mut(), channel_id.as_ref(), &text);
                let _ = reply.send(result);
            }
            Command::RetrySend { attempt, reply } => {
                let channel_id = self.selection.active_channel().cloned();
                let result = self
                    .sends
                    .retry(self.selection.store_mut(), channel_id.as_ref(), attempt);
                let _ = reply.send(result);
            }
            Command::DismissFailedSend { attempt, reply } => {
                let _ = reply.send(self.sends.dismiss(attempt));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::HistoryLoaded {
                epoch,
                channel_id,
                result,
            } => match self
                .selection
                .on_history_loaded(epoch, channel_id.clone(), result)
            {
                HistoryOutcome::Applied { .. } => {
                    self.sends.reapply_in_flight(self.selection.store_mut());
                    self.emit(ClientEvent::LoadingChanged {
                        channel_id,
                        loading: false,
                    });
                }
                HistoryOutcome::Failed(err) => {
                    self.sends.reapply_in_flight(self.selection.store_mut());
                    self.emit(ClientEvent::LoadingChanged {
                        channel_id: channel_id.clone(),
                        loading: false,
                    });
                    self.emit(ClientEvent::LoadFailed {
                        channel_id,
                        reason: err.to_string(),
                    });
                }
                HistoryOutcome::Stale => {}
            },
            Completion::Remote {
                epoch,
                channel_id,
                event,
            } => {
                let outcome = self.selection.on_remote(epoch, channel_id, event);
                debug!(?outcome, "session: remote event handled");
            }
            Completion::Persisted { attempt, result } => {
                if let Some(SendOutcome::RolledBack(failed)) =
                    self.sends
                        .on_persisted(self.selection.store_mut(), attempt, result)
                {
                    self.emit(ClientEvent::SendFailed(failed));
                }
            }
            Completion::Published { attempt, result } => {
                if let Err(err) = self.sends.on_published(attempt, result) {
                    self.emit(ClientEvent::Error(err.to_string()));
                }
            }
        }
    }

    fn after_selection(&mut self, result: &Result<Epoch, SyncError>) {
        let channel_id = self.selection.active_channel().cloned();
        self.emit(ClientEvent::SelectionChanged {
            channel_id: channel_id.clone(),
            epoch: self.selection.epoch(),
        });
        match (result, channel_id) {
            (Ok(_), Some(channel_id)) => self.emit(ClientEvent::LoadingChanged {
                channel_id,
                loading: true,
            }),
            (Err(err), _) => self.emit(ClientEvent::Error(err.to_string())),
            _ => {}
        }
    }

    fn emit_messages_if_changed(&mut self) {
        let store = self.selection.store();
        if store.revision() == self.emitted_revision {
            return;
        }
        self.emitted_revision = store.revision();
        let event = ClientEvent::MessagesChanged {
            channel_id: store.channel_id().cloned(),
            messages: store.visible().to_vec(),
        };
        self.emit(event);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            channel_id: self.selection.active_channel().cloned(),
            epoch: self.selection.epoch(),
            loading: self.selection.is_loading(),
            subscribed: self.selection.is_subscribed(),
            messages: self.selection.store().visible().to_vec(),
            draft: self.sends.draft().to_string(),
            failed_sends: self.sends.failed_sends().to_vec(),
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
