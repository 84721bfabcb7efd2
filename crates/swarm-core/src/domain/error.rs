//! Error taxonomy for the swarm coordinator.

use swarm_transport::StorageError;

use super::debate::DebatePhase;
use super::task::TaskStatus;
use super::{AgentId, DebateId, MessageId, TaskId};

/// Errors produced by swarm services.
///
/// Expected outcomes (no agent available, normal lookups) are `Option`s,
/// not errors. Task timeouts and executor failures are terminal task
/// statuses, not errors.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    // -- admission ----------------------------------------------------------
    #[error("pending queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("agent already registered: {0}")]
    DuplicateAgent(AgentId),

    #[error("task id already known to the scheduler: {0}")]
    DuplicateTask(TaskId),

    // -- not found ----------------------------------------------------------
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("debate not found: {0}")]
    DebateNotFound(DebateId),

    // -- transport ----------------------------------------------------------
    #[error("transport error on stream {stream}: {source}")]
    Transport {
        stream: String,
        #[source]
        source: StorageError,
    },

    #[error("message {message_id} partially published: written to {written:?}, failed on {failed:?}")]
    PartialPublish {
        message_id: MessageId,
        written: Vec<String>,
        failed: Vec<String>,
    },

    #[error("message bus is closed")]
    TransportClosed,

    // -- consensus ----------------------------------------------------------
    #[error("insufficient participants: required {required}, available {available}")]
    InsufficientParticipants { required: usize, available: usize },

    // -- state machines -----------------------------------------------------
    #[error("invalid task transition for {task_id}: {from:?} -> {to:?}")]
    InvalidTaskTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid phase transition for debate {debate_id}: {from:?} -> {to:?}")]
    InvalidPhaseTransition {
        debate_id: DebateId,
        from: DebatePhase,
        to: DebatePhase,
    },

    // -- misc ---------------------------------------------------------------
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lifecycle hook failed for agent {agent_id}: {reason}")]
    Lifecycle { agent_id: AgentId, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SwarmError {
    /// Wrap a stream failure, mapping a closed store onto [`SwarmError::TransportClosed`].
    pub fn transport(stream: impl Into<String>, source: StorageError) -> Self {
        match source {
            StorageError::Closed => SwarmError::TransportClosed,
            source => SwarmError::Transport {
                stream: stream.into(),
                source,
            },
        }
    }

    /// Admission errors are rejected synchronously; callers retry or back off.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::DuplicateAgent(_) | Self::DuplicateTask(_)
        )
    }

    /// Whether this error came from the message transport.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::PartialPublish { .. } | Self::TransportClosed
        )
    }
}

/// Result type for swarm operations.
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;
