//! Domain model for the swarm coordinator.
//!
//! Identifiers, the task and agent records, bus messages, and the debate
//! types shared by the consensus engine.

pub mod agent;
pub mod debate;
pub mod error;
pub mod message;
pub mod task;

use serde::{Deserialize, Serialize};

pub use agent::{Agent, AgentStatusSnapshot, RegistrationStatus};
pub use debate::{
    AgentStatement, AgentVote, DebateOutcome, DebatePhase, DebateProposal, DebateRound,
    DebateStatus, PhaseTiming, VoteDecision,
};
pub use error::{SwarmError, SwarmResult};
pub use message::{MessageType, SwarmMessage};
pub use task::{ExecutionReport, ExecutionStatus, Task, TaskStatus};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier.
            pub fn generate() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a registered agent.
    AgentId
);
string_id!(
    /// Identifier of a task; generated on submission when left empty.
    TaskId
);
string_id!(
    /// Identifier of a debate (also the thread id its messages are published on).
    DebateId
);
string_id!(
    /// Identifier of a bus message; consumers dedupe on it.
    MessageId
);

/// A named skill tag used to match tasks to agents (e.g. "analysis").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Capability(name.into())
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Capability(s.to_string())
    }
}

/// Build a capability set from string literals.
pub fn capabilities<I, S>(names: I) -> std::collections::BTreeSet<Capability>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(|n| Capability(n.into())).collect()
}

/// Priority shared by tasks and messages. Ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_highest() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&AgentId::from("agent-7")).unwrap();
        assert_eq!(json, "\"agent-7\"");
    }
}
