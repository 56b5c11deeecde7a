//! Fakes and helpers shared by the unit tests.

use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use realtime_transport::{BroadcastFrame, RealtimeTransport};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{Message, MessageQuery, Topic},
};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::{
    session::ClientEvent,
    types::{Completion, CompletionReceiver},
    DurableStore,
};

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
        .single()
        .expect("base time")
        + chrono::Duration::seconds(seconds)
}

pub fn msg(id: &str, channel: &str, seconds: i64) -> Message {
    Message::text(
        MessageId::from(id),
        ChannelId::from(channel),
        UserId::from("alice"),
        format!("body of {id}"),
        at(seconds),
    )
}

/// In-memory durable store with failure injection and per-channel list gates.
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<Message>>,
    list_gates: Mutex<HashMap<ChannelId, oneshot::Receiver<()>>>,
    fail_creates: AtomicBool,
    fail_lists: AtomicBool,
    create_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
            ..Self::default()
        }
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Holds the next `list` for `channel_id` until the returned sender fires or drops.
    pub async fn gate_list(&self, channel_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.list_gates
            .lock()
            .await
            .insert(ChannelId::from(channel_id), rx);
        tx
    }

    pub async fn stored(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn create(&self, message: &Message) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        let mut messages = self.messages.lock().await;
        if !messages.iter().any(|existing| existing.id == message.id) {
            messages.push(message.clone());
        }
        Ok(())
    }

    async fn list(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let gate = self.list_gates.lock().await.remove(&query.channel_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(anyhow!("list timed out"));
        }
        let mut listed: Vec<Message> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.channel_id == query.channel_id)
            .filter(|m| query.include_deleted || !m.is_deleted)
            .cloned()
            .collect();
        listed.sort_by_key(|m| m.created_at);
        listed.truncate(query.limit as usize);
        Ok(listed)
    }
}

/// Transport whose every call fails, as if the socket were gone.
pub struct DownTransport;

#[async_trait]
impl RealtimeTransport for DownTransport {
    async fn subscribe(&self, _topic: &Topic) -> Result<broadcast::Receiver<BroadcastFrame>> {
        Err(anyhow!("socket closed"))
    }

    async fn publish(&self, _topic: &Topic, _kind: &str, _payload: serde_json::Value) -> Result<()> {
        Err(anyhow!("socket closed"))
    }
}

pub async fn next_completion(rx: &mut CompletionReceiver) -> Completion {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("completion arrives in time")
        .expect("completion channel open")
}

/// Skips events until one matches `wanted`.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<ClientEvent>, wanted: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("event arrives in time")
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
