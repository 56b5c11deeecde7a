use async_trait::async_trait;
use realtime_transport::{BroadcastFrame, LocalBroadcastHub};
use shared::protocol::{RealtimeEvent, Topic};

use super::*;
use crate::test_support::{eventually, msg, next_event, MemoryStore};

struct Viewer {
    handle: SessionHandle,
    events: broadcast::Receiver<ClientEvent>,
    durable: Arc<MemoryStore>,
    hub: Arc<LocalBroadcastHub>,
}

fn viewer_with(durable: Arc<MemoryStore>, transport: Arc<dyn RealtimeTransport>, hub: Arc<LocalBroadcastHub>) -> Viewer {
    let handle = ChatSession::spawn(SessionContext {
        user_id: UserId::from("alice"),
        durable: durable.clone(),
        transport,
        config: SyncConfig::default(),
    });
    let events = handle.subscribe_events();
    Viewer {
        handle,
        events,
        durable,
        hub,
    }
}

fn viewer() -> Viewer {
    let durable = Arc::new(MemoryStore::with_messages(vec![
        msg("m1", "general", 0),
        msg("m2", "general", 60),
    ]));
    let hub = Arc::new(LocalBroadcastHub::default());
    viewer_with(durable, hub.clone(), hub)
}

fn general() -> ChannelId {
    ChannelId::from("general")
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

impl Viewer {
    async fn wait_loaded(&mut self) {
        next_event(&mut self.events, |event| {
            matches!(event, ClientEvent::LoadingChanged { loading: false, .. })
        })
        .await;
    }

    async fn wait_messages(&mut self, count: usize) -> Vec<Message> {
        match next_event(&mut self.events, |event| {
            matches!(event, ClientEvent::MessagesChanged { messages, .. } if messages.len() == count)
        })
        .await
        {
            ClientEvent::MessagesChanged { messages, .. } => messages,
            other => panic!("unexpected {other:?}"),
        }
    }
}

/// Delivers subscriptions but refuses to publish.
struct MuteTransport(LocalBroadcastHub);

#[async_trait]
impl RealtimeTransport for MuteTransport {
    async fn subscribe(&self, topic: &Topic) -> anyhow::Result<broadcast::Receiver<BroadcastFrame>> {
        self.0.subscribe(topic).await
    }

    async fn publish(&self, _topic: &Topic, _kind: &str, _payload: serde_json::Value) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("broadcast rejected"))
    }
}

#[tokio::test]
async fn selection_loads_history_and_follows_the_topic() {
    let mut v = viewer();
    let epoch = v.handle.select_channel("general").await.expect("select");

    match next_event(&mut v.events, |event| matches!(event, ClientEvent::SelectionChanged { .. })).await {
        ClientEvent::SelectionChanged { channel_id, epoch: announced } => {
            assert_eq!(channel_id, Some(general()));
            assert_eq!(announced, epoch);
        }
        other => panic!("unexpected {other:?}"),
    }
    let messages = v.wait_messages(2).await;
    assert_eq!(ids(&messages), vec!["m1", "m2"]);

    let other = RealtimeBridge::new(v.hub.clone());
    other
        .publish(
            &Topic::for_channel(&general()),
            &RealtimeEvent::NewMessage(msg("m3", "general", 120)),
        )
        .await
        .expect("publish");
    let messages = v.wait_messages(3).await;
    assert_eq!(ids(&messages), vec!["m1", "m2", "m3"]);

    let snapshot = v.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.channel_id, Some(general()));
    assert!(!snapshot.loading);
    assert!(snapshot.subscribed);
    assert_eq!(snapshot.messages.len(), 3);
}

#[tokio::test]
async fn submitted_draft_is_visible_and_persisted() {
    let mut v = viewer();
    v.handle.select_channel("general").await.expect("select");
    v.wait_loaded().await;

    v.handle.set_draft("hello").await.expect("draft");
    v.handle.submit().await.expect("submit");

    let messages = v.wait_messages(3).await;
    assert_eq!(messages[2].content, "hello");
    assert_eq!(v.handle.snapshot().await.expect("snapshot").draft, "");

    let durable = v.durable.clone();
    eventually(|| {
        let durable = durable.clone();
        async move { durable.stored().await.iter().any(|m| m.content == "hello") }
    })
    .await;
}

#[tokio::test]
async fn sending_requires_a_selected_channel() {
    let v = viewer();
    assert!(matches!(
        v.handle.send_text("nobody hears this").await,
        Err(SyncError::NoActiveChannel)
    ));
    assert!(matches!(
        v.handle.reload().await,
        Err(SyncError::NoActiveChannel)
    ));
}

#[tokio::test]
async fn failed_send_is_withdrawn_reported_and_retryable() {
    let mut v = viewer();
    v.handle.select_channel("general").await.expect("select");
    v.wait_loaded().await;

    v.durable.fail_creates(true);
    let attempt = v.handle.send_text("flaky").await.expect("send");

    let failed = match next_event(&mut v.events, |event| matches!(event, ClientEvent::SendFailed(_))).await {
        ClientEvent::SendFailed(failed) => failed,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(failed.attempt, attempt);
    let snapshot = v.handle.snapshot().await.expect("snapshot");
    assert_eq!(ids(&snapshot.messages), vec!["m1", "m2"]);
    assert_eq!(snapshot.failed_sends, vec![failed.clone()]);

    v.durable.fail_creates(false);
    let retried = v.handle.retry_send(attempt).await.expect("retry");
    assert_ne!(retried, attempt);

    let durable = v.durable.clone();
    let id = failed.message.id.clone();
    eventually(|| {
        let durable = durable.clone();
        let id = id.clone();
        async move { durable.stored().await.iter().any(|m| m.id == id) }
    })
    .await;
    let snapshot = v.handle.snapshot().await.expect("snapshot");
    assert!(snapshot.failed_sends.is_empty());
    assert!(snapshot.messages.iter().any(|m| m.id == failed.message.id));
}

#[tokio::test]
async fn dismissing_drops_the_failed_send() {
    let mut v = viewer();
    v.handle.select_channel("general").await.expect("select");
    v.wait_loaded().await;
    v.durable.fail_creates(true);

    let attempt = v.handle.send_text("gone").await.expect("send");
    next_event(&mut v.events, |event| matches!(event, ClientEvent::SendFailed(_))).await;

    let dismissed = v.handle.dismiss_failed_send(attempt).await.expect("dismiss");
    assert_eq!(dismissed.message.content, "gone");
    assert!(v
        .handle
        .snapshot()
        .await
        .expect("snapshot")
        .failed_sends
        .is_empty());
}

#[tokio::test]
async fn load_failure_is_reported_with_an_empty_list() {
    let mut v = viewer();
    v.durable.fail_lists(true);
    v.handle.select_channel("general").await.expect("select");

    match next_event(&mut v.events, |event| matches!(event, ClientEvent::LoadFailed { .. })).await {
        ClientEvent::LoadFailed { channel_id, reason } => {
            assert_eq!(channel_id, general());
            assert!(reason.contains("list timed out"));
        }
        other => panic!("unexpected {other:?}"),
    }
    let snapshot = v.handle.snapshot().await.expect("snapshot");
    assert!(snapshot.messages.is_empty());
    assert!(!snapshot.loading);

    v.durable.fail_lists(false);
    v.handle.reload().await.expect("reload");
    let messages = v.wait_messages(2).await;
    assert_eq!(ids(&messages), vec!["m1", "m2"]);
}

#[tokio::test]
async fn message_sent_while_loading_survives_the_history_reset() {
    let mut v = viewer();
    let release = v.durable.gate_list("general").await;
    v.handle.select_channel("general").await.expect("select");
    v.handle.send_text("early bird").await.expect("send");

    release.send(()).expect("gate open");
    v.wait_loaded().await;

    let snapshot = v.handle.snapshot().await.expect("snapshot");
    let contents: Vec<_> = snapshot.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["body of m1", "body of m2", "early bird"]);
}

#[tokio::test]
async fn message_sent_while_loading_survives_a_failed_load() {
    let mut v = viewer();
    let release = v.durable.gate_list("general").await;
    v.durable.fail_lists(true);
    v.handle.select_channel("general").await.expect("select");
    v.handle.send_text("early bird").await.expect("send");

    let durable = v.durable.clone();
    eventually(|| {
        let durable = durable.clone();
        async move { durable.stored().await.iter().any(|m| m.content == "early bird") }
    })
    .await;

    release.send(()).expect("gate open");
    next_event(&mut v.events, |event| matches!(event, ClientEvent::LoadFailed { .. })).await;

    let snapshot = v.handle.snapshot().await.expect("snapshot");
    let contents: Vec<_> = snapshot.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["early bird"]);
    assert!(snapshot.failed_sends.is_empty());
    assert!(!snapshot.loading);
}

#[tokio::test]
async fn publish_failure_keeps_the_message_and_reports_it() {
    let durable = Arc::new(MemoryStore::default());
    let hub = Arc::new(LocalBroadcastHub::default());
    let mut v = viewer_with(
        durable,
        Arc::new(MuteTransport(LocalBroadcastHub::default())),
        hub,
    );
    v.handle.select_channel("general").await.expect("select");
    v.wait_loaded().await;

    v.handle.send_text("quiet").await.expect("send");
    match next_event(&mut v.events, |event| matches!(event, ClientEvent::Error(_))).await {
        ClientEvent::Error(reason) => assert!(reason.contains("broadcast rejected")),
        other => panic!("unexpected {other:?}"),
    }
    let snapshot = v.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.messages.len(), 1);
    assert!(snapshot.failed_sends.is_empty());
}

#[tokio::test]
async fn clearing_the_selection_returns_to_idle() {
    let mut v = viewer();
    v.handle.select_channel("general").await.expect("select");
    v.wait_messages(2).await;

    v.handle.clear_selection().await.expect("clear");
    next_event(&mut v.events, |event| {
        matches!(event, ClientEvent::SelectionChanged { channel_id: None, .. })
    })
    .await;
    let snapshot = v.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.channel_id, None);
    assert!(!snapshot.subscribed);
    assert!(snapshot.messages.is_empty());

    let topic = Topic::for_channel(&general());
    let hub = v.hub.clone();
    eventually(|| {
        let hub = hub.clone();
        let topic = topic.clone();
        async move { hub.subscriber_count(&topic).await == 0 }
    })
    .await;
}

#[tokio::test]
async fn shutdown_closes_every_handle() {
    let v = viewer();
    let other = v.handle.clone();
    v.handle.select_channel("general").await.expect("select");

    v.handle.shutdown().await.expect("shutdown");
    assert!(matches!(
        other.snapshot().await,
        Err(SyncError::SessionClosed)
    ));
    assert!(other.is_closed());
}
