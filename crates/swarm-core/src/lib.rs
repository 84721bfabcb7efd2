//! Swarm Core Library
//!
//! Coordination services for a swarm of autonomous agents: a persistent
//! message bus, an agent directory with health tracking, a priority task
//! scheduler and a debate-based consensus engine.

pub mod bus;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod directory;
pub mod domain;
pub mod metrics;
pub mod obs;
pub mod scheduler;
pub mod telemetry;

pub use bus::{Delivery, MessageBus, StreamKeys, Subscription, SubscriptionFilter};

pub use config::{BusConfig, ConsensusConfig, DirectoryConfig, SchedulerConfig, SwarmConfig};

pub use consensus::{ConsensusEngine, DebateParticipant, ParticipantProfile};

pub use coordinator::{SwarmCoordinator, SwarmStatus};

pub use directory::{AgentDirectory, AgentLifecycleObserver, AgentLoad, DirectoryStatus};

pub use domain::{
    capabilities, Agent, AgentId, AgentStatement, AgentStatusSnapshot, AgentVote, Capability,
    DebateId, DebateOutcome, DebatePhase, DebateProposal, DebateRound, DebateStatus,
    ExecutionReport, ExecutionStatus, MessageId, MessageType, Priority, RegistrationStatus,
    SwarmError, SwarmMessage, SwarmResult, Task, TaskId, TaskStatus, VoteDecision,
};

pub use metrics::{MetricsSnapshot, METRICS};

pub use scheduler::{
    FnExecutor, HookError, Lifecycle, SchedulerStatus, TaskExecutor, TaskScheduler,
};

pub use swarm_transport::{MemoryStreamStore, StreamStore, SurrealStreamStore};
