//! Runtime configuration for the swarm services.
//!
//! Defaults carry the reference values. [`SwarmConfig::from_env`] overlays
//! `SWARM_*` variables, e.g. `SWARM_SCHEDULER_MAX_PENDING=500`.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{SwarmError, SwarmResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Prefix of every stream key.
    pub namespace: String,
    /// Bounded wait before a subscriber re-polls its streams.
    pub poll_wait_ms: u64,
    /// Entries fetched per stream read.
    pub read_batch: usize,
    /// Attempts per stream write before a publish fails.
    pub publish_attempts: u32,
    /// Linear backoff step between write attempts.
    pub publish_retry_backoff_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            namespace: "swarm".to_string(),
            poll_wait_ms: 5000,
            read_batch: 64,
            publish_attempts: 3,
            publish_retry_backoff_ms: 50,
        }
    }
}

impl BusConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn publish_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Period of the health evaluation and stale sweep loop.
    pub health_check_interval_secs: u64,
    /// Heartbeat age after which a Registered agent is suspended.
    pub stale_grace_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            stale_grace_secs: 300,
        }
    }
}

impl DirectoryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_pending: usize,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub completed_history_limit: usize,
    /// Applied to tasks submitted without a timeout.
    pub default_timeout_secs: u64,
    /// Health multiplier applied to an agent whose task timed out.
    pub timeout_health_penalty: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pending: 1000,
            poll_interval_ms: 100,
            error_backoff_ms: 1000,
            completed_history_limit: 10_000,
            default_timeout_secs: 300,
            timeout_health_penalty: 0.9,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub consensus_threshold: f64,
    pub max_participants: usize,
    pub monitor_interval_secs: u64,
    pub debate_timeout_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.7,
            max_participants: 10,
            monitor_interval_secs: 30,
            debate_timeout_secs: 1800,
        }
    }
}

impl ConsensusConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Configuration for every swarm service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub bus: BusConfig,
    pub directory: DirectoryConfig,
    pub scheduler: SchedulerConfig,
    pub consensus: ConsensusConfig,
}

impl SwarmConfig {
    /// Defaults overlaid with `SWARM_*` environment variables, then validated.
    pub fn from_env() -> SwarmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SwarmConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> SwarmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut c = SwarmConfig::default();

        if let Some(ns) = lookup("SWARM_BUS_NAMESPACE") {
            c.bus.namespace = ns;
        }
        overlay(&lookup, "SWARM_BUS_POLL_WAIT_MS", &mut c.bus.poll_wait_ms)?;
        overlay(&lookup, "SWARM_BUS_READ_BATCH", &mut c.bus.read_batch)?;
        overlay(&lookup, "SWARM_BUS_PUBLISH_ATTEMPTS", &mut c.bus.publish_attempts)?;
        overlay(
            &lookup,
            "SWARM_BUS_PUBLISH_RETRY_BACKOFF_MS",
            &mut c.bus.publish_retry_backoff_ms,
        )?;

        overlay(
            &lookup,
            "SWARM_DIRECTORY_HEALTH_CHECK_INTERVAL_SECS",
            &mut c.directory.health_check_interval_secs,
        )?;
        overlay(
            &lookup,
            "SWARM_DIRECTORY_STALE_GRACE_SECS",
            &mut c.directory.stale_grace_secs,
        )?;

        overlay(&lookup, "SWARM_SCHEDULER_MAX_PENDING", &mut c.scheduler.max_pending)?;
        overlay(
            &lookup,
            "SWARM_SCHEDULER_POLL_INTERVAL_MS",
            &mut c.scheduler.poll_interval_ms,
        )?;
        overlay(
            &lookup,
            "SWARM_SCHEDULER_ERROR_BACKOFF_MS",
            &mut c.scheduler.error_backoff_ms,
        )?;
        overlay(
            &lookup,
            "SWARM_SCHEDULER_COMPLETED_HISTORY_LIMIT",
            &mut c.scheduler.completed_history_limit,
        )?;
        overlay(
            &lookup,
            "SWARM_SCHEDULER_DEFAULT_TIMEOUT_SECS",
            &mut c.scheduler.default_timeout_secs,
        )?;
        overlay(
            &lookup,
            "SWARM_SCHEDULER_TIMEOUT_HEALTH_PENALTY",
            &mut c.scheduler.timeout_health_penalty,
        )?;

        overlay(
            &lookup,
            "SWARM_CONSENSUS_THRESHOLD",
            &mut c.consensus.consensus_threshold,
        )?;
        overlay(
            &lookup,
            "SWARM_CONSENSUS_MAX_PARTICIPANTS",
            &mut c.consensus.max_participants,
        )?;
        overlay(
            &lookup,
            "SWARM_CONSENSUS_MONITOR_INTERVAL_SECS",
            &mut c.consensus.monitor_interval_secs,
        )?;
        overlay(
            &lookup,
            "SWARM_CONSENSUS_DEBATE_TIMEOUT_SECS",
            &mut c.consensus.debate_timeout_secs,
        )?;

        c.validate()?;
        Ok(c)
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> SwarmResult<()> {
        let invalid = |msg: &str| Err(SwarmError::InvalidConfig(msg.to_string()));

        if self.bus.namespace.is_empty() || self.bus.namespace.chars().any(char::is_whitespace) {
            return invalid("bus.namespace must be non-empty without whitespace");
        }
        if self.bus.poll_wait_ms == 0 {
            return invalid("bus.poll_wait_ms must be > 0");
        }
        if self.bus.read_batch == 0 {
            return invalid("bus.read_batch must be > 0");
        }
        if self.bus.publish_attempts == 0 {
            return invalid("bus.publish_attempts must be > 0");
        }
        if self.directory.health_check_interval_secs == 0 {
            return invalid("directory.health_check_interval_secs must be > 0");
        }
        if self.scheduler.max_pending == 0 {
            return invalid("scheduler.max_pending must be > 0");
        }
        if self.scheduler.poll_interval_ms == 0 || self.scheduler.error_backoff_ms == 0 {
            return invalid("scheduler intervals must be > 0");
        }
        if self.scheduler.completed_history_limit == 0 {
            return invalid("scheduler.completed_history_limit must be > 0");
        }
        if !(0.0..=1.0).contains(&self.scheduler.timeout_health_penalty) {
            return invalid("scheduler.timeout_health_penalty must be within [0, 1]");
        }
        let t = self.consensus.consensus_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return invalid("consensus.consensus_threshold must be within (0, 1]");
        }
        if self.consensus.max_participants == 0 {
            return invalid("consensus.max_participants must be > 0");
        }
        if self.consensus.monitor_interval_secs == 0 || self.consensus.debate_timeout_secs == 0 {
            return invalid("consensus intervals must be > 0");
        }
        Ok(())
    }
}

fn overlay<F, T>(lookup: &F, key: &str, target: &mut T) -> SwarmResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| SwarmError::InvalidConfig(format!("{key}: cannot parse {raw:?}")))?;
    }
    Ok(())
}
