//! Messages carried by the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SwarmResult;
use super::{AgentId, MessageId, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Query,
    Response,
    Proposal,
    Vote,
    Result,
    Event,
    Error,
}

/// An immutable bus message.
///
/// Serialised as a JSON envelope; the trace pair lets a consumer join the
/// producer's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmMessage {
    pub id: MessageId,
    pub sender_agent_id: AgentId,
    /// `None` broadcasts to every subscriber.
    pub receiver_agent_id: Option<AgentId>,
    pub message_type: MessageType,
    pub content: serde_json::Value,
    pub thread_id: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl SwarmMessage {
    /// Create a broadcast message that opens its own thread.
    pub fn new(
        sender: impl Into<AgentId>,
        message_type: MessageType,
        content: serde_json::Value,
    ) -> Self {
        let id = MessageId::generate();
        Self {
            thread_id: id.0.clone(),
            id,
            sender_agent_id: sender.into(),
            receiver_agent_id: None,
            message_type,
            content,
            timestamp: Utc::now(),
            priority: Priority::Normal,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn to(mut self, receiver: impl Into<AgentId>) -> Self {
        self.receiver_agent_id = Some(receiver.into());
        self
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_agent_id.is_none()
    }

    pub fn to_payload(&self) -> SwarmResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: serde_json::Value) -> SwarmResult<Self> {
        Ok(serde_json::from_value(payload)?)
    }
}
