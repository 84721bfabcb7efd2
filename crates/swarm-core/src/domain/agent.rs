//! Agent records owned by the directory.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, Capability};

/// Minimum health score for an agent to receive work.
pub const AVAILABILITY_HEALTH_FLOOR: f64 = 0.5;

/// Registration state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Registered,
    Suspended,
    Unregistered,
}

/// Status reported by an agent alongside a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusSnapshot {
    /// Fraction of recent requests that failed, expected in `[0, 1]`.
    pub error_rate: f64,
    /// Whether the agent considers itself ready for work.
    pub is_ready: bool,
}

/// A worker agent known to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub name: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<Capability>,
    pub max_concurrent_tasks: usize,
    pub current_task_count: usize,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Exponentially smoothed, always in `[0, 1]`.
    pub health_score: f64,
    /// Rolling average task duration in seconds.
    pub average_processing_time: f64,
    pub registration_status: RegistrationStatus,
    pub registered_at: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub suspension_reason: Option<String>,
    pub last_status: Option<AgentStatusSnapshot>,
}

impl Agent {
    /// Create an agent record ready for registration.
    pub fn new(
        agent_id: impl Into<AgentId>,
        name: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: BTreeSet<Capability>,
        max_concurrent_tasks: usize,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities,
            max_concurrent_tasks,
            current_task_count: 0,
            last_heartbeat: None,
            health_score: 1.0,
            average_processing_time: 0.0,
            registration_status: RegistrationStatus::Registered,
            registered_at: Utc::now(),
            tasks_completed: 0,
            tasks_failed: 0,
            suspension_reason: None,
            last_status: None,
        }
    }

    /// Registered, below its concurrency limit, and healthy.
    pub fn is_available(&self) -> bool {
        self.registration_status == RegistrationStatus::Registered
            && self.current_task_count < self.max_concurrent_tasks
            && self.health_score > AVAILABILITY_HEALTH_FLOOR
    }

    /// `current_task_count / max_concurrent_tasks`; a zero limit counts as fully loaded.
    pub fn load_factor(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.current_task_count as f64 / self.max_concurrent_tasks as f64
    }

    /// Whether the agent holds every capability in `required`.
    pub fn has_capabilities(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Observed failure ratio over finished tasks (0 with no history).
    pub fn observed_error_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        self.tasks_failed as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capabilities;

    fn agent(max: usize) -> Agent {
        Agent::new("a1", "Analyst", "research", capabilities(["analysis"]), max)
    }

    #[test]
    fn new_agent_starts_healthy_and_available() {
        let a = agent(2);
        assert_eq!(a.health_score, 1.0);
        assert!(a.is_available());
    }

    #[test]
    fn full_agent_is_unavailable() {
        let mut a = agent(1);
        a.current_task_count = 1;
        assert!(!a.is_available());
        assert_eq!(a.load_factor(), 1.0);
    }

    #[test]
    fn unhealthy_or_suspended_agent_is_unavailable() {
        let mut a = agent(2);
        a.health_score = 0.5;
        assert!(!a.is_available());

        let mut b = agent(2);
        b.registration_status = RegistrationStatus::Suspended;
        assert!(!b.is_available());
    }

    #[test]
    fn capability_subset_check() {
        let a = agent(1);
        assert!(a.has_capabilities(&capabilities(["analysis"])));
        assert!(a.has_capabilities(&capabilities(Vec::<String>::new())));
        assert!(!a.has_capabilities(&capabilities(["analysis", "generation"])));
    }

    #[test]
    fn observed_error_rate_uses_outcome_counters() {
        let mut a = agent(1);
        assert_eq!(a.observed_error_rate(), 0.0);
        a.tasks_completed = 3;
        a.tasks_failed = 1;
        assert!((a.observed_error_rate() - 0.25).abs() < 1e-9);
    }
}
