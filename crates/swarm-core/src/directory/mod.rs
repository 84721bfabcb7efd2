//! Agent directory: registration, capability lookup, health and load.
//!
//! The directory is the only writer of an agent's health and load fields.
//! All mutation happens under one write lock, which also makes
//! [`AgentDirectory::claim_best_agent`] an atomic find-and-increment.

pub mod scoring;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::DirectoryConfig;
use crate::domain::{
    Agent, AgentId, AgentStatusSnapshot, Capability, RegistrationStatus, SwarmError, SwarmResult,
};
use crate::obs;

/// Heartbeats older than this many health-check intervals mark an agent not ready.
const READINESS_INTERVALS: i64 = 3;

/// Notified after an agent is removed from the directory.
#[async_trait]
pub trait AgentLifecycleObserver: Send + Sync {
    async fn agent_unregistered(&self, agent_id: &AgentId);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryStatus {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub suspended_agents: usize,
    /// Registered agents per capability.
    pub capability_distribution: BTreeMap<Capability, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub current: usize,
    pub max: usize,
}

pub struct AgentDirectory {
    agents: RwLock<BTreeMap<AgentId, Agent>>,
    observers: Mutex<Vec<Weak<dyn AgentLifecycleObserver>>>,
    config: DirectoryConfig,
}

impl AgentDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            observers: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Weak<dyn AgentLifecycleObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    // -- registration ---------------------------------------------------------

    /// Register a new agent with full health and no load.
    pub async fn register(&self, agent: Agent) -> SwarmResult<()> {
        self.register_at(agent, Utc::now()).await
    }

    pub async fn register_at(&self, mut agent: Agent, now: DateTime<Utc>) -> SwarmResult<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.agent_id) {
            return Err(SwarmError::DuplicateAgent(agent.agent_id));
        }

        agent.health_score = 1.0;
        agent.current_task_count = 0;
        agent.registration_status = RegistrationStatus::Registered;
        agent.registered_at = now;
        agent.suspension_reason = None;

        obs::emit_agent_registered(&agent.agent_id, agent.capabilities.len());
        agents.insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    /// Remove an agent and notify observers, which cancel its in-flight tasks.
    pub async fn unregister(&self, agent_id: &AgentId) -> SwarmResult<Agent> {
        let mut removed = {
            let mut agents = self.agents.write().await;
            agents
                .remove(agent_id)
                .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?
        };
        removed.registration_status = RegistrationStatus::Unregistered;
        obs::emit_agent_unregistered(agent_id);

        let observers: Vec<_> = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.agent_unregistered(agent_id).await;
        }
        Ok(removed)
    }

    pub async fn heartbeat(
        &self,
        agent_id: &AgentId,
        status: Option<AgentStatusSnapshot>,
    ) -> SwarmResult<()> {
        self.heartbeat_at(agent_id, status, Utc::now()).await
    }

    /// Record a heartbeat. A suspended agent is reinstated.
    pub async fn heartbeat_at(
        &self,
        agent_id: &AgentId,
        status: Option<AgentStatusSnapshot>,
        now: DateTime<Utc>,
    ) -> SwarmResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;

        agent.last_heartbeat = Some(now);
        if status.is_some() {
            agent.last_status = status;
        }
        if agent.registration_status == RegistrationStatus::Suspended {
            info!(agent_id = %agent_id, "heartbeat reinstated suspended agent");
            agent.registration_status = RegistrationStatus::Registered;
            agent.suspension_reason = None;
        }
        Ok(())
    }

    pub async fn suspend(&self, agent_id: &AgentId, reason: impl Into<String>) -> SwarmResult<()> {
        let reason = reason.into();
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
        obs::emit_agent_suspended(agent_id, &reason);
        agent.registration_status = RegistrationStatus::Suspended;
        agent.suspension_reason = Some(reason);
        Ok(())
    }

    pub async fn resume(&self, agent_id: &AgentId) -> SwarmResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
        agent.registration_status = RegistrationStatus::Registered;
        agent.suspension_reason = None;
        Ok(())
    }

    // -- lookup ---------------------------------------------------------------

    pub async fn get(&self, agent_id: &AgentId) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    /// Registered agents holding `capability`, in id order.
    pub async fn agents_with_capability(&self, capability: &Capability) -> Vec<AgentId> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| {
                a.registration_status == RegistrationStatus::Registered
                    && a.capabilities.contains(capability)
            })
            .map(|a| a.agent_id.clone())
            .collect()
    }

    /// Best available agent for `required`, without reserving it.
    pub async fn find_best_agent(
        &self,
        required: &BTreeSet<Capability>,
        exclude: &HashSet<AgentId>,
    ) -> Option<Agent> {
        let agents = self.agents.read().await;
        scoring::best_candidate(agents.values(), required, exclude).cloned()
    }

    /// Select the best agent and take one of its task slots atomically.
    pub async fn claim_best_agent(
        &self,
        required: &BTreeSet<Capability>,
        exclude: &HashSet<AgentId>,
    ) -> Option<Agent> {
        let mut agents = self.agents.write().await;
        let id = scoring::best_candidate(agents.values(), required, exclude)?
            .agent_id
            .clone();
        let agent = agents.get_mut(&id)?;
        agent.current_task_count += 1;
        Some(agent.clone())
    }

    // -- feedback -------------------------------------------------------------

    /// Return a slot after a finished task and fold its outcome into the stats.
    pub async fn release_agent(
        &self,
        agent_id: &AgentId,
        processing_secs: f64,
        success: bool,
    ) -> SwarmResult<f64> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;

        agent.current_task_count = agent.current_task_count.saturating_sub(1);
        agent.average_processing_time =
            scoring::smooth(agent.average_processing_time, processing_secs.max(0.0));
        if success {
            agent.tasks_completed += 1;
        } else {
            agent.tasks_failed += 1;
        }

        let is_ready = agent.last_status.map_or(true, |s| s.is_ready);
        agent.health_score =
            scoring::next_health(agent.health_score, agent.observed_error_rate(), is_ready);
        Ok(agent.health_score)
    }

    /// Return a slot without recording an outcome (cancelled tasks).
    pub async fn release_slot(&self, agent_id: &AgentId) -> SwarmResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
        agent.current_task_count = agent.current_task_count.saturating_sub(1);
        Ok(())
    }

    /// Return a slot for a timed-out task and multiply health by `penalty`.
    pub async fn record_timeout(&self, agent_id: &AgentId, penalty: f64) -> SwarmResult<f64> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
        agent.current_task_count = agent.current_task_count.saturating_sub(1);
        agent.tasks_failed += 1;
        agent.health_score = (agent.health_score * penalty).clamp(0.0, 1.0);
        Ok(agent.health_score)
    }

    /// Multiply an agent's health by `factor`.
    pub async fn penalize(&self, agent_id: &AgentId, factor: f64) -> SwarmResult<f64> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
        agent.health_score = (agent.health_score * factor).clamp(0.0, 1.0);
        Ok(agent.health_score)
    }

    /// Smooth health toward `max(0.1, 1 − error_rate)` (halved when not ready).
    ///
    /// An error rate outside `[0, 1]` degrades health by ×0.9 instead.
    pub async fn update_health(
        &self,
        agent_id: &AgentId,
        error_rate: f64,
        is_ready: bool,
    ) -> SwarmResult<f64> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
        if scoring::target_health(error_rate, is_ready).is_none() {
            warn!(agent_id = %agent_id, error_rate, "invalid error rate, degrading health");
        }
        agent.health_score = scoring::next_health(agent.health_score, error_rate, is_ready);
        Ok(agent.health_score)
    }

    // -- periodic maintenance ---------------------------------------------------

    fn readiness_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.config.health_check_interval_secs as i64 * READINESS_INTERVALS,
        )
    }

    /// Re-evaluate the health of every Registered agent.
    ///
    /// The error rate comes from the last heartbeat snapshot, falling back to
    /// observed task outcomes. Agents whose heartbeat (or registration, if
    /// they never sent one) is older than three check intervals are not ready.
    #[instrument(skip(self))]
    pub async fn evaluate_health_at(&self, now: DateTime<Utc>) {
        let horizon = self.readiness_horizon();
        let mut agents = self.agents.write().await;
        for agent in agents.values_mut() {
            if agent.registration_status != RegistrationStatus::Registered {
                continue;
            }
            let seen = agent.last_heartbeat.unwrap_or(agent.registered_at);
            let fresh = now - seen <= horizon;
            let (error_rate, reported_ready) = match agent.last_status {
                Some(s) => (s.error_rate, s.is_ready),
                None => (agent.observed_error_rate(), true),
            };

            if scoring::target_health(error_rate, true).is_none() {
                warn!(agent_id = %agent.agent_id, error_rate, "health evaluation failed, degrading");
            }
            agent.health_score =
                scoring::next_health(agent.health_score, error_rate, fresh && reported_ready);
            debug!(agent_id = %agent.agent_id, health = agent.health_score, fresh, "health evaluated");
        }
    }

    /// Suspend Registered agents silent for longer than the grace period.
    pub async fn sweep_stale_at(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let grace = chrono::Duration::seconds(self.config.stale_grace_secs as i64);
        let mut suspended = Vec::new();
        let mut agents = self.agents.write().await;
        for agent in agents.values_mut() {
            if agent.registration_status != RegistrationStatus::Registered {
                continue;
            }
            let seen = agent.last_heartbeat.unwrap_or(agent.registered_at);
            let silent = now - seen;
            if silent > grace {
                let reason = format!("no heartbeat for {}s", silent.num_seconds());
                obs::emit_agent_suspended(&agent.agent_id, &reason);
                agent.registration_status = RegistrationStatus::Suspended;
                agent.suspension_reason = Some(reason);
                suspended.push(agent.agent_id.clone());
            }
        }
        suspended
    }

    /// Spawn the periodic health evaluation and stale sweep.
    pub fn spawn_health_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(directory.config.health_check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                let now = Utc::now();
                directory.evaluate_health_at(now).await;
                let suspended = directory.sweep_stale_at(now).await;
                if !suspended.is_empty() {
                    info!(count = suspended.len(), "stale agents suspended");
                }
            }
            debug!("directory health loop stopped");
        })
    }

    // -- introspection ----------------------------------------------------------

    pub async fn status(&self) -> DirectoryStatus {
        let agents = self.agents.read().await;
        let mut capability_distribution = BTreeMap::new();
        let mut healthy_agents = 0;
        let mut suspended_agents = 0;

        for agent in agents.values() {
            match agent.registration_status {
                RegistrationStatus::Registered => {
                    if agent.health_score > crate::domain::agent::AVAILABILITY_HEALTH_FLOOR {
                        healthy_agents += 1;
                    }
                    for cap in &agent.capabilities {
                        *capability_distribution.entry(cap.clone()).or_insert(0) += 1;
                    }
                }
                RegistrationStatus::Suspended => suspended_agents += 1,
                RegistrationStatus::Unregistered => {}
            }
        }

        DirectoryStatus {
            total_agents: agents.len(),
            healthy_agents,
            suspended_agents,
            capability_distribution,
        }
    }

    pub async fn per_agent_load(&self) -> BTreeMap<AgentId, AgentLoad> {
        self.agents
            .read()
            .await
            .values()
            .map(|a| {
                (
                    a.agent_id.clone(),
                    AgentLoad {
                        current: a.current_task_count,
                        max: a.max_concurrent_tasks,
                    },
                )
            })
            .collect()
    }
}
