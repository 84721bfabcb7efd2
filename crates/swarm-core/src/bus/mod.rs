//! Message bus: durable, ordered publish/subscribe over a [`StreamStore`].
//!
//! Each message is appended to the global stream, to its thread stream and,
//! when addressed, to the receiver's inbox. Ordering holds per stream only.
//!
//! The three writes are not transactional. Every write is retried with a
//! linear backoff; a write that still fails makes the publish fail with
//! [`SwarmError::PartialPublish`] naming the streams that did and did not
//! receive the message. Copies already written stay in place, so delivery is
//! at-least-once and consumers dedupe by message id.

mod keys;
mod subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use swarm_transport::{StorageError, StreamKey, StreamOffset, StreamStore};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::config::BusConfig;
use crate::domain::{AgentId, SwarmError, SwarmMessage, SwarmResult};
use crate::metrics::METRICS;
use crate::obs;

pub use keys::StreamKeys;
pub use subscription::{Delivery, Subscription, SubscriptionFilter};

pub struct MessageBus {
    store: Arc<dyn StreamStore>,
    keys: StreamKeys,
    config: BusConfig,
    closed: AtomicBool,
    notify: Notify,
}

impl MessageBus {
    pub fn new(store: Arc<dyn StreamStore>, config: BusConfig) -> Self {
        Self {
            keys: StreamKeys::new(config.namespace.clone()),
            store,
            config,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn keys(&self) -> &StreamKeys {
        &self.keys
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> SwarmResult<()> {
        if self.is_closed() {
            return Err(SwarmError::TransportClosed);
        }
        Ok(())
    }

    /// Append `message` to its streams and return its global-stream offset.
    pub async fn publish(&self, message: &SwarmMessage) -> SwarmResult<StreamOffset> {
        self.ensure_open()?;
        let payload = message.to_payload()?;

        let mut targets = vec![self.keys.global()?, self.keys.thread(&message.thread_id)?];
        if let Some(receiver) = &message.receiver_agent_id {
            targets.push(self.keys.inbox(receiver)?);
        }

        let mut global_offset = None;
        let mut written = Vec::new();
        let mut failed = Vec::new();
        let mut last_error = None;

        for (i, key) in targets.iter().enumerate() {
            match self.append_with_retry(key, payload.clone()).await {
                Ok(offset) => {
                    if i == 0 {
                        global_offset = Some(offset);
                    }
                    written.push(key.to_string());
                }
                Err(StorageError::Closed) => return Err(SwarmError::TransportClosed),
                Err(e) => {
                    error!(
                        message_id = %message.id,
                        stream = %key,
                        error = %e,
                        "stream write failed after retries"
                    );
                    failed.push(key.to_string());
                    last_error = Some((key.to_string(), e));
                }
            }
        }

        // Wake subscribers even on partial failure: some copies are readable.
        if !written.is_empty() {
            self.notify.notify_waiters();
        }

        match (global_offset, last_error) {
            (Some(offset), None) => {
                METRICS.inc_messages_published();
                obs::emit_message_published(message.id.as_str(), message.message_type, written.len());
                Ok(offset)
            }
            (_, Some((stream, source))) if written.is_empty() => {
                METRICS.inc_publish_failures();
                Err(SwarmError::transport(stream, source))
            }
            _ => {
                METRICS.inc_publish_failures();
                Err(SwarmError::PartialPublish {
                    message_id: message.id.clone(),
                    written,
                    failed,
                })
            }
        }
    }

    async fn append_with_retry(
        &self,
        key: &StreamKey,
        payload: serde_json::Value,
    ) -> Result<StreamOffset, StorageError> {
        let attempts = self.config.publish_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.append(key, payload.clone()).await {
                Ok(offset) => return Ok(offset),
                Err(e @ (StorageError::Closed | StorageError::InvalidStreamKey { .. })) => {
                    return Err(e)
                }
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(stream = %key, attempt, error = %e, "stream write failed, retrying");
                    tokio::time::sleep(self.config.publish_retry_backoff() * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Subscribe `agent_id` to its inbox and to broadcast messages.
    ///
    /// The subscription resumes from the agent's last acknowledged cursor on
    /// each stream, replaying anything delivered but not acknowledged.
    pub async fn subscribe(
        self: &Arc<Self>,
        agent_id: &AgentId,
        filter: SubscriptionFilter,
    ) -> SwarmResult<Subscription> {
        self.ensure_open()?;
        Subscription::open(Arc::clone(self), agent_id.clone(), filter).await
    }

    /// The newest `limit` messages of a thread in chronological order.
    pub async fn get_thread_history(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> SwarmResult<Vec<SwarmMessage>> {
        self.ensure_open()?;
        let key = self.keys.thread(thread_id)?;
        let mut messages = self.read_messages(&key, limit).await?;
        // Stable: equal timestamps keep append order.
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    /// The newest `limit` messages addressed to `agent_id`, oldest first.
    pub async fn inbox(&self, agent_id: &AgentId, limit: usize) -> SwarmResult<Vec<SwarmMessage>> {
        self.ensure_open()?;
        let key = self.keys.inbox(agent_id)?;
        self.read_messages(&key, limit).await
    }

    async fn read_messages(&self, key: &StreamKey, limit: usize) -> SwarmResult<Vec<SwarmMessage>> {
        let entries = self
            .store
            .read_last(key, limit)
            .await
            .map_err(|e| SwarmError::transport(key.as_str(), e))?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            match SwarmMessage::from_payload(entry.payload) {
                Ok(m) => messages.push(m),
                Err(e) => warn!(stream = %key, offset = %entry.offset, error = %e, "skipping undecodable entry"),
            }
        }
        Ok(messages)
    }

    /// Release the transport. Every later call fails with `TransportClosed`.
    pub async fn close(&self) -> SwarmResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing message bus");
        self.notify.notify_waiters();
        self.store
            .close()
            .await
            .map_err(|e| SwarmError::transport("*", e))
    }

    pub(crate) fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    pub(crate) fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageType;
    use swarm_transport::MemoryStreamStore;

    fn bus() -> MessageBus {
        MessageBus::new(Arc::new(MemoryStreamStore::new()), BusConfig::default())
    }

    #[tokio::test]
    async fn publish_writes_global_thread_and_inbox() {
        let store = Arc::new(MemoryStreamStore::new());
        let bus = MessageBus::new(store.clone(), BusConfig::default());
        let msg = SwarmMessage::new("a", MessageType::Query, serde_json::json!({}))
            .to("b")
            .in_thread("t1");

        let offset = bus.publish(&msg).await.unwrap();
        assert_eq!(offset, StreamOffset(1));

        for key in ["swarm:global", "swarm:threads:t1", "swarm:inbox:b"] {
            let key = StreamKey::new(key).unwrap();
            assert_eq!(store.len(&key).await.unwrap(), 1, "{key}");
        }
    }

    #[tokio::test]
    async fn broadcast_skips_inbox() {
        let store = Arc::new(MemoryStreamStore::new());
        let bus = MessageBus::new(store.clone(), BusConfig::default());
        let msg = SwarmMessage::new("a", MessageType::Event, serde_json::json!({})).in_thread("t");
        bus.publish(&msg).await.unwrap();

        let inbox = StreamKey::new("swarm:inbox:a").unwrap();
        assert_eq!(store.len(&inbox).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn history_is_chronological_and_bounded() {
        let bus = bus();
        let base = chrono::Utc::now();
        // Published newest-first; history must come back oldest-first.
        for i in (0..5).rev() {
            let m = SwarmMessage::new("a", MessageType::Event, serde_json::json!({ "i": i }))
                .in_thread("t")
                .at(base + chrono::Duration::seconds(i));
            bus.publish(&m).await.unwrap();
        }

        let history = bus.get_thread_history("t", 3).await.unwrap();
        let order: Vec<i64> = history.iter().map(|m| m.content["i"].as_i64().unwrap()).collect();
        // The three most recently appended are i = 2, 1, 0.
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let bus = bus();
        bus.close().await.unwrap();
        bus.close().await.unwrap();

        let msg = SwarmMessage::new("a", MessageType::Event, serde_json::json!({}));
        assert!(matches!(bus.publish(&msg).await, Err(SwarmError::TransportClosed)));
        assert!(matches!(
            bus.get_thread_history("t", 1).await,
            Err(SwarmError::TransportClosed)
        ));
    }
}
