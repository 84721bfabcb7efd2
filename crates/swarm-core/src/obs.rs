//! Structured lifecycle events for tasks, agents, messages and debates.
//!
//! Every event carries an `event` field (`task.submitted`, `debate.phase`,
//! ...) so log pipelines can filter on it. Span helpers scope the logs of
//! one task execution or one debate.

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument};

use crate::domain::{AgentId, DebateId, DebatePhase, MessageType, Priority, TaskId, TaskStatus};

/// Span covering one task execution. Attach it to the execution future.
pub struct TaskSpan {
    span: tracing::Span,
}

impl TaskSpan {
    pub fn new(task_id: &TaskId, agent_id: &AgentId) -> Self {
        Self {
            span: tracing::info_span!("swarm.task", task_id = %task_id, agent_id = %agent_id),
        }
    }

    pub fn instrument<F: Future>(self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span)
    }
}

/// RAII guard entering a debate-scoped span. Only hold it across
/// synchronous code; use [`DebateSpan::span`] for async sections.
pub struct DebateSpan {
    _span: tracing::span::EnteredSpan,
}

impl DebateSpan {
    pub fn enter(debate_id: &DebateId) -> Self {
        Self {
            _span: Self::span(debate_id).entered(),
        }
    }

    pub fn span(debate_id: &DebateId) -> tracing::Span {
        tracing::info_span!("swarm.debate", debate_id = %debate_id)
    }
}

pub fn emit_task_submitted(task_id: &TaskId, priority: Priority, pending: usize) {
    info!(event = "task.submitted", task_id = %task_id, priority = ?priority, pending);
}

pub fn emit_task_dispatched(task_id: &TaskId, agent_id: &AgentId) {
    info!(event = "task.dispatched", task_id = %task_id, agent_id = %agent_id);
}

/// Emit event: task reached a terminal status.
pub fn emit_task_finished(task_id: &TaskId, status: TaskStatus, duration_ms: Option<u64>) {
    info!(
        event = "task.finished",
        task_id = %task_id,
        status = ?status,
        duration_ms = duration_ms.unwrap_or(0),
    );
}

pub fn emit_task_timed_out(task_id: &TaskId, agent_id: &AgentId, timeout_secs: u64) {
    warn!(
        event = "task.timed_out",
        task_id = %task_id,
        agent_id = %agent_id,
        timeout_secs,
    );
}

pub fn emit_agent_registered(agent_id: &AgentId, capabilities: usize) {
    info!(event = "agent.registered", agent_id = %agent_id, capabilities);
}

pub fn emit_agent_unregistered(agent_id: &AgentId) {
    info!(event = "agent.unregistered", agent_id = %agent_id);
}

pub fn emit_agent_suspended(agent_id: &AgentId, reason: &str) {
    warn!(event = "agent.suspended", agent_id = %agent_id, reason = %reason);
}

pub fn emit_message_published(message_id: &str, message_type: MessageType, streams: usize) {
    info!(
        event = "message.published",
        message_id = %message_id,
        message_type = ?message_type,
        streams,
    );
}

pub fn emit_debate_initiated(debate_id: &DebateId, participants: usize) {
    info!(event = "debate.initiated", debate_id = %debate_id, participants);
}

pub fn emit_debate_phase(debate_id: &DebateId, phase: DebatePhase, duration_ms: u64) {
    info!(
        event = "debate.phase",
        debate_id = %debate_id,
        phase = phase.as_str(),
        duration_ms,
    );
}

pub fn emit_debate_finalized(debate_id: &DebateId, consensus_reached: bool, expired: bool) {
    info!(
        event = "debate.finalized",
        debate_id = %debate_id,
        consensus_reached,
        expired,
    );
}

/// Emit event: a background loop iteration failed and will back off.
pub fn emit_loop_error(loop_name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "loop.error", loop_name = %loop_name, error = %error);
}
