//! Tasks and their lifecycle.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{SwarmError, SwarmResult};
use super::{AgentId, Capability, Priority, TaskId};

/// Error recorded on tasks that exceed their timeout.
pub const TIMED_OUT_ERROR: &str = "Task timed out";
/// Error recorded on tasks cancelled because their agent left.
pub const AGENT_UNREGISTERED_ERROR: &str = "Agent unregistered";
/// Error recorded on tasks cancelled by scheduler shutdown.
pub const SCHEDULER_STOPPED_ERROR: &str = "Scheduler stopped";

/// Lifecycle state of a task.
///
/// ```text
/// Pending -> Assigned -> Processing -> Completed | Failed
///    \__________\____________\______-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is a legal move.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Assigned, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Cancelled)
                | (Assigned, Cancelled)
                | (Processing, Cancelled)
        )
    }
}

/// A unit of work submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub required_capabilities: BTreeSet<Capability>,
    pub priority: Priority,
    /// `None` uses the scheduler default.
    pub timeout_seconds: Option<u64>,
    /// Carried as metadata; the scheduler never re-runs a terminal task.
    pub retry_attempts: u32,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub processing_start: Option<DateTime<Utc>>,
    pub processing_end: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    /// Create a pending task with a generated id.
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: TaskId::generate(),
            task_type: task_type.into(),
            payload,
            required_capabilities: BTreeSet::new(),
            priority: Priority::Normal,
            timeout_seconds: None,
            retry_attempts: 0,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            created_at: Utc::now(),
            processing_start: None,
            processing_end: None,
            result: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.task_id = id.into();
        self
    }

    pub fn with_capabilities(mut self, caps: BTreeSet<Capability>) -> Self {
        self.required_capabilities = caps;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: TaskStatus) -> SwarmResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(SwarmError::InvalidTaskTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Write the terminal state. Fails if the task is already terminal.
    pub fn finish(
        &mut self,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> SwarmResult<()> {
        self.transition(status)?;
        self.result = result;
        self.error = error;
        self.processing_end = Some(now);
        Ok(())
    }

    /// Wall-clock processing time in seconds, once both ends are recorded.
    pub fn processing_secs(&self) -> Option<f64> {
        let start = self.processing_start?;
        let end = self.processing_end?;
        Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Outcome reported by an execution contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// `{status, result, error}` returned by `TaskExecutor::execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
