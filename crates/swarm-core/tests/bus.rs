//! Message bus delivery, replay and failure-reporting tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use swarm_core::{
    AgentId, BusConfig, MessageBus, MessageType, SubscriptionFilter, SwarmError, SwarmMessage,
};
use swarm_transport::{
    MemoryStreamStore, StorageError, StorageResult, StreamEntry, StreamKey, StreamOffset,
    StreamStore,
};

fn quick_config() -> BusConfig {
    BusConfig {
        poll_wait_ms: 20,
        publish_retry_backoff_ms: 1,
        ..BusConfig::default()
    }
}

fn bus_over(store: Arc<dyn StreamStore>) -> Arc<MessageBus> {
    Arc::new(MessageBus::new(store, quick_config()))
}

fn event(sender: &str, n: i64) -> SwarmMessage {
    SwarmMessage::new(sender, MessageType::Event, serde_json::json!({ "n": n }))
}

/// Store double whose appends fail for keys containing `fail_on`.
struct FlakyStore {
    inner: MemoryStreamStore,
    fail_on: &'static str,
    enabled: AtomicBool,
}

impl FlakyStore {
    fn new(fail_on: &'static str) -> Self {
        Self {
            inner: MemoryStreamStore::new(),
            fail_on,
            enabled: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl StreamStore for FlakyStore {
    async fn append(
        &self,
        key: &StreamKey,
        payload: serde_json::Value,
    ) -> StorageResult<StreamOffset> {
        if self.enabled.load(Ordering::SeqCst) && key.as_str().contains(self.fail_on) {
            return Err(StorageError::Backend("disk full".into()));
        }
        self.inner.append(key, payload).await
    }

    async fn read_after(
        &self,
        key: &StreamKey,
        after: Option<StreamOffset>,
        limit: usize,
    ) -> StorageResult<Vec<StreamEntry>> {
        self.inner.read_after(key, after, limit).await
    }

    async fn read_last(&self, key: &StreamKey, limit: usize) -> StorageResult<Vec<StreamEntry>> {
        self.inner.read_last(key, limit).await
    }

    async fn len(&self, key: &StreamKey) -> StorageResult<u64> {
        self.inner.len(key).await
    }

    async fn load_cursor(
        &self,
        consumer: &str,
        key: &StreamKey,
    ) -> StorageResult<Option<StreamOffset>> {
        self.inner.load_cursor(consumer, key).await
    }

    async fn commit_cursor(
        &self,
        consumer: &str,
        key: &StreamKey,
        offset: StreamOffset,
    ) -> StorageResult<()> {
        self.inner.commit_cursor(consumer, key, offset).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_subscriber_sees_own_inbox_and_broadcasts_only() {
    let bus = bus_over(Arc::new(MemoryStreamStore::new()));
    let bob = AgentId::from("bob");
    let mut sub = bus.subscribe(&bob, SubscriptionFilter::all()).await.unwrap();

    bus.publish(&event("alice", 1).to("bob")).await.unwrap();
    bus.publish(&event("alice", 2).to("carol")).await.unwrap();
    bus.publish(&event("alice", 3)).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let d = sub.next().await.unwrap();
        seen.push(d.message.content["n"].as_i64().unwrap());
        sub.ack(&d).await.unwrap();
    }
    seen.sort();
    assert_eq!(seen, vec![1, 3]);

    let nothing = tokio::time::timeout(Duration::from_millis(100), sub.next()).await;
    assert!(nothing.is_err(), "carol's message must not reach bob");
}

#[tokio::test]
async fn test_unacked_delivery_replays_after_resubscribe() {
    let bus = bus_over(Arc::new(MemoryStreamStore::new()));
    let bob = AgentId::from("bob");
    bus.publish(&event("alice", 7).to("bob")).await.unwrap();

    let mut first = bus.subscribe(&bob, SubscriptionFilter::all()).await.unwrap();
    let d = first.next().await.unwrap();
    assert_eq!(d.message.content["n"], 7);
    drop(first);

    let mut second = bus.subscribe(&bob, SubscriptionFilter::all()).await.unwrap();
    let replayed = second.next().await.unwrap();
    assert_eq!(replayed.message.id, d.message.id);
    second.ack(&replayed).await.unwrap();
    drop(second);

    let mut third = bus.subscribe(&bob, SubscriptionFilter::all()).await.unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(100), third.next()).await;
    assert!(nothing.is_err(), "acknowledged message must not replay");
}

#[tokio::test]
async fn test_stream_adapter_acks_previous_on_next_pull() {
    let bus = bus_over(Arc::new(MemoryStreamStore::new()));
    let bob = AgentId::from("bob");
    bus.publish(&event("alice", 1)).await.unwrap();
    bus.publish(&event("alice", 2)).await.unwrap();

    let sub = bus.subscribe(&bob, SubscriptionFilter::all()).await.unwrap();
    let mut stream = Box::pin(sub.into_stream());
    assert_eq!(stream.next().await.unwrap().unwrap().content["n"], 1);
    assert_eq!(stream.next().await.unwrap().unwrap().content["n"], 2);
    drop(stream);

    // The second message was in flight when the stream was dropped.
    let mut sub = bus.subscribe(&bob, SubscriptionFilter::all()).await.unwrap();
    let d = sub.next().await.unwrap();
    assert_eq!(d.message.content["n"], 2);
}

#[tokio::test]
async fn test_filtered_messages_are_skipped() {
    let bus = bus_over(Arc::new(MemoryStreamStore::new()));
    let bob = AgentId::from("bob");
    let mut sub = bus
        .subscribe(&bob, SubscriptionFilter::types([MessageType::Vote]))
        .await
        .unwrap();

    bus.publish(&event("alice", 1)).await.unwrap();
    bus.publish(&SwarmMessage::new("alice", MessageType::Vote, serde_json::json!({ "n": 2 })))
        .await
        .unwrap();

    let d = sub.next().await.unwrap();
    assert_eq!(d.message.message_type, MessageType::Vote);
    sub.ack(&d).await.unwrap();
    drop(sub);

    let mut again = bus
        .subscribe(&bob, SubscriptionFilter::types([MessageType::Vote]))
        .await
        .unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(100), again.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_publish_wakes_waiting_subscriber() {
    let bus = Arc::new(MessageBus::new(
        Arc::new(MemoryStreamStore::new()),
        BusConfig {
            poll_wait_ms: 60_000,
            ..BusConfig::default()
        },
    ));
    let bob = AgentId::from("bob");
    let mut sub = bus.subscribe(&bob, SubscriptionFilter::all()).await.unwrap();

    let waiter = tokio::spawn(async move { sub.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.publish(&event("alice", 9).to("bob")).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("subscriber not woken")
        .unwrap()
        .unwrap();
    assert_eq!(delivered.message.content["n"], 9);
}

#[tokio::test]
async fn test_partial_publish_names_failed_stream() {
    let store = Arc::new(FlakyStore::new(":inbox:"));
    let bus = bus_over(store.clone());
    let msg = event("alice", 1).to("bob").in_thread("t1");

    match bus.publish(&msg).await {
        Err(SwarmError::PartialPublish {
            message_id,
            written,
            failed,
        }) => {
            assert_eq!(message_id, msg.id);
            assert_eq!(written, vec!["swarm:global", "swarm:threads:t1"]);
            assert_eq!(failed, vec!["swarm:inbox:bob"]);
        }
        other => panic!("expected partial publish, got {other:?}"),
    }

    // Written copies stay readable.
    let history = bus.get_thread_history("t1", 10).await.unwrap();
    assert_eq!(history.len(), 1);

    store.enabled.store(false, Ordering::SeqCst);
    bus.publish(&msg).await.unwrap();
}

#[tokio::test]
async fn test_total_failure_is_transport_error() {
    let bus = bus_over(Arc::new(FlakyStore::new("swarm")));
    let err = bus.publish(&event("alice", 1)).await.unwrap_err();
    assert!(err.is_transport());
    assert!(matches!(err, SwarmError::Transport { .. }));
}

#[tokio::test]
async fn test_closed_bus_ends_stream() {
    let bus = bus_over(Arc::new(MemoryStreamStore::new()));
    let sub = bus
        .subscribe(&AgentId::from("bob"), SubscriptionFilter::all())
        .await
        .unwrap();
    let mut stream = Box::pin(sub.into_stream());

    bus.close().await.unwrap();
    assert!(stream.next().await.is_none());
    assert!(matches!(
        bus.subscribe(&AgentId::from("bob"), SubscriptionFilter::all()).await,
        Err(SwarmError::TransportClosed)
    ));
}

#[tokio::test]
async fn test_ids_with_spaces_and_separators_publish_and_deliver() {
    let bus = bus_over(Arc::new(MemoryStreamStore::new()));
    let team = AgentId::from("ops team");
    let mut sub = bus.subscribe(&team, SubscriptionFilter::all()).await.unwrap();

    bus.publish(&event("planner", 1).to("ops team").in_thread("design review"))
        .await
        .unwrap();
    bus.publish(&event("planner", 2).to("ops").in_thread("design:review"))
        .await
        .unwrap();

    let d = sub.next().await.unwrap();
    assert_eq!(d.message.content["n"], 1);
    assert_eq!(d.message.thread_id, "design review");
    sub.ack(&d).await.unwrap();

    let history = bus.get_thread_history("design review", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(bus.inbox(&team, 10).await.unwrap().len(), 1);
    assert_eq!(bus.inbox(&AgentId::from("ops"), 10).await.unwrap()[0].content["n"], 2);
}
