//! Cursor-based subscriptions.
//!
//! A subscription tails two streams: the agent's inbox and the global
//! stream, from which only broadcast messages are taken. Each stream has a
//! committed cursor per agent. The cursor only advances over a contiguous
//! prefix of entries that were either acknowledged or skipped, so anything
//! delivered but not acknowledged is replayed after a reconnect.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::Stream;
use swarm_transport::{StreamKey, StreamOffset};
use tracing::{debug, warn};

use super::MessageBus;
use crate::domain::{AgentId, MessageType, SwarmError, SwarmMessage, SwarmResult};

/// Client-side filter applied after delivery. Filtered-out messages are
/// acknowledged without being returned.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Accept only these types; empty accepts all.
    pub message_types: HashSet<MessageType>,
    pub thread_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn types(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            message_types: types.into_iter().collect(),
            thread_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn matches(&self, message: &SwarmMessage) -> bool {
        let type_ok =
            self.message_types.is_empty() || self.message_types.contains(&message.message_type);
        let thread_ok = self
            .thread_id
            .as_ref()
            .map_or(true, |t| t == &message.thread_id);
        type_ok && thread_ok
    }
}

/// A message handed to a subscriber, with the position needed to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: SwarmMessage,
    pub stream: StreamKey,
    pub offset: StreamOffset,
}

#[derive(Debug)]
struct Track {
    key: StreamKey,
    broadcast_only: bool,
    read_pos: Option<StreamOffset>,
    committed: Option<StreamOffset>,
    /// Read but not yet committed, in offset order; `true` once done.
    inflight: VecDeque<(StreamOffset, bool)>,
}

impl Track {
    fn new(key: StreamKey, broadcast_only: bool, committed: Option<StreamOffset>) -> Self {
        Self {
            key,
            broadcast_only,
            read_pos: committed,
            committed,
            inflight: VecDeque::new(),
        }
    }

    fn mark_done(&mut self, offset: StreamOffset) {
        if let Some(slot) = self.inflight.iter_mut().find(|(o, _)| *o == offset) {
            slot.1 = true;
        }
    }

    /// Pop the done prefix; returns the new commit point if it moved.
    fn advance(&mut self) -> Option<StreamOffset> {
        let mut moved = None;
        while let Some(&(offset, true)) = self.inflight.front() {
            self.inflight.pop_front();
            moved = Some(offset);
        }
        if moved.is_some() {
            self.committed = moved;
        }
        moved
    }
}

pub struct Subscription {
    bus: Arc<MessageBus>,
    agent_id: AgentId,
    filter: SubscriptionFilter,
    tracks: Vec<Track>,
    buffer: VecDeque<Delivery>,
}

impl Subscription {
    pub(super) async fn open(
        bus: Arc<MessageBus>,
        agent_id: AgentId,
        filter: SubscriptionFilter,
    ) -> SwarmResult<Self> {
        let inbox = bus.keys().inbox(&agent_id)?;
        let global = bus.keys().global()?;

        let mut tracks = Vec::with_capacity(2);
        for (key, broadcast_only) in [(inbox, false), (global, true)] {
            let committed = bus
                .store()
                .load_cursor(agent_id.as_str(), &key)
                .await
                .map_err(|e| SwarmError::transport(key.as_str(), e))?;
            debug!(agent_id = %agent_id, stream = %key, cursor = ?committed, "subscription resumed");
            tracks.push(Track::new(key, broadcast_only, committed));
        }

        Ok(Self {
            bus,
            agent_id,
            filter,
            tracks,
            buffer: VecDeque::new(),
        })
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Wait for the next matching message.
    ///
    /// Waits on the bus notification, bounded by `poll_wait`, when nothing
    /// is available. Fails with `TransportClosed` once the bus is closed.
    pub async fn next(&mut self) -> SwarmResult<Delivery> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Ok(delivery);
            }
            if self.bus.is_closed() {
                return Err(SwarmError::TransportClosed);
            }

            // Register interest before reading so a concurrent publish is not missed.
            let bus = Arc::clone(&self.bus);
            let notified = bus.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.fill().await?;
            if self.buffer.is_empty() {
                let _ = tokio::time::timeout(bus.config().poll_wait(), notified).await;
            }
        }
    }

    /// Acknowledge a delivery; the cursor moves once every earlier entry is done.
    pub async fn ack(&mut self, delivery: &Delivery) -> SwarmResult<()> {
        let Some(idx) = self.tracks.iter().position(|t| t.key == delivery.stream) else {
            return Ok(());
        };
        self.tracks[idx].mark_done(delivery.offset);
        self.commit(idx).await
    }

    /// Adapt into a `Stream`. Each delivery is acknowledged when the next
    /// one is pulled; the stream ends when the bus closes.
    pub fn into_stream(self) -> impl Stream<Item = SwarmResult<SwarmMessage>> {
        futures::stream::unfold((self, None::<Delivery>), |(mut sub, prev)| async move {
            if let Some(prev) = prev {
                if let Err(e) = sub.ack(&prev).await {
                    return match e {
                        SwarmError::TransportClosed => None,
                        e => Some((Err(e), (sub, None))),
                    };
                }
            }
            match sub.next().await {
                Ok(delivery) => {
                    let message = delivery.message.clone();
                    Some((Ok(message), (sub, Some(delivery))))
                }
                Err(SwarmError::TransportClosed) => None,
                Err(e) => Some((Err(e), (sub, None))),
            }
        })
    }

    async fn fill(&mut self) -> SwarmResult<()> {
        let batch = self.bus.config().read_batch;
        for idx in 0..self.tracks.len() {
            let (key, after) = {
                let t = &self.tracks[idx];
                (t.key.clone(), t.read_pos)
            };
            let entries = self
                .bus
                .store()
                .read_after(&key, after, batch)
                .await
                .map_err(|e| SwarmError::transport(key.as_str(), e))?;

            for entry in entries {
                let track = &mut self.tracks[idx];
                track.read_pos = Some(entry.offset);

                let deliverable = match SwarmMessage::from_payload(entry.payload) {
                    Ok(message) => {
                        let wanted = (!track.broadcast_only || message.is_broadcast())
                            && self.filter.matches(&message);
                        wanted.then_some(message)
                    }
                    Err(e) => {
                        warn!(stream = %key, offset = %entry.offset, error = %e, "skipping undecodable entry");
                        None
                    }
                };

                track.inflight.push_back((entry.offset, deliverable.is_none()));
                if let Some(message) = deliverable {
                    self.buffer.push_back(Delivery {
                        message,
                        stream: key.clone(),
                        offset: entry.offset,
                    });
                }
            }
            self.commit(idx).await?;
        }
        Ok(())
    }

    async fn commit(&mut self, idx: usize) -> SwarmResult<()> {
        let track = &mut self.tracks[idx];
        if let Some(offset) = track.advance() {
            self.bus
                .store()
                .commit_cursor(self.agent_id.as_str(), &track.key, offset)
                .await
                .map_err(|e| SwarmError::transport(track.key.as_str(), e))?;
        }
        Ok(())
    }
}
