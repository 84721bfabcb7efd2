//! Wires the bus, directory, scheduler and consensus engine into one swarm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use swarm_transport::StreamStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::config::SwarmConfig;
use crate::consensus::ConsensusEngine;
use crate::directory::{AgentDirectory, DirectoryStatus};
use crate::domain::{Agent, AgentId, SwarmResult, Task, TaskId};
use crate::metrics::{MetricsSnapshot, METRICS};
use crate::scheduler::{SchedulerStatus, TaskExecutor, TaskScheduler};

/// Combined snapshot of every service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub scheduler: SchedulerStatus,
    pub directory: DirectoryStatus,
    pub active_debates: usize,
    pub metrics: MetricsSnapshot,
}

pub struct SwarmCoordinator {
    config: SwarmConfig,
    bus: Arc<MessageBus>,
    directory: Arc<AgentDirectory>,
    scheduler: Arc<TaskScheduler>,
    consensus: Arc<ConsensusEngine>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl SwarmCoordinator {
    /// Build every service over `store`. Nothing runs until [`start`](Self::start).
    pub fn new(config: SwarmConfig, store: Arc<dyn StreamStore>) -> SwarmResult<Self> {
        config.validate()?;

        let bus = Arc::new(MessageBus::new(store, config.bus.clone()));
        let directory = Arc::new(AgentDirectory::new(config.directory.clone()));
        let scheduler = TaskScheduler::new(Arc::clone(&directory), config.scheduler.clone());
        let consensus = Arc::new(ConsensusEngine::new(
            Arc::clone(&directory),
            Arc::clone(&bus),
            config.consensus.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            bus,
            directory,
            scheduler,
            consensus,
            shutdown,
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    /// Spawn the health loop, the dispatch loop and the debate monitor.
    pub async fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("coordinator already shut down; start ignored");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut loops = self.loops.lock().await;
        loops.push(
            self.directory
                .spawn_health_loop(self.shutdown.subscribe()),
        );
        loops.push(
            self.consensus
                .spawn_monitor_loop(self.shutdown.subscribe()),
        );
        self.scheduler.start().await;
        info!(namespace = %self.config.bus.namespace, "swarm coordinator started");
    }

    /// Register `agent` and attach its execution contract.
    ///
    /// The registration is rolled back when the executor's setup fails.
    pub async fn register_agent(
        &self,
        agent: Agent,
        executor: Arc<dyn TaskExecutor>,
    ) -> SwarmResult<()> {
        let agent_id = agent.agent_id.clone();
        self.directory.register(agent).await?;
        if let Err(e) = self.scheduler.attach_executor(&agent_id, executor).await {
            if let Err(rollback) = self.directory.unregister(&agent_id).await {
                warn!(agent_id = %agent_id, error = %rollback, "registration rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove an agent; its in-flight tasks are cancelled.
    pub async fn unregister_agent(&self, agent_id: &AgentId) -> SwarmResult<Agent> {
        self.directory.unregister(agent_id).await
    }

    pub async fn submit_task(&self, task: Task) -> SwarmResult<TaskId> {
        self.scheduler.submit(task).await
    }

    pub async fn status(&self) -> SwarmStatus {
        SwarmStatus {
            scheduler: self.scheduler.status().await,
            directory: self.directory.status().await,
            active_debates: self.consensus.active_debates().await.len(),
            metrics: METRICS.snapshot(),
        }
    }

    /// Stop every loop, cancel outstanding work and close the bus. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let loops: Vec<_> = self.loops.lock().await.drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }

        self.scheduler.stop().await;
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "message bus close failed");
        }
        METRICS.flush();
        info!("swarm coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{capabilities, ExecutionReport, SwarmError};
    use crate::scheduler::{FnExecutor, HookError, Lifecycle};
    use async_trait::async_trait;
    use swarm_transport::MemoryStreamStore;

    struct BrokenSetup;

    #[async_trait]
    impl Lifecycle for BrokenSetup {
        async fn setup(&self) -> Result<(), HookError> {
            Err("model not loaded".into())
        }

        async fn teardown(&self) -> Result<(), HookError> {
            Ok(())
        }
    }

    #[async_trait]
    impl TaskExecutor for BrokenSetup {
        async fn execute(&self, _task_id: &TaskId, _payload: &serde_json::Value) -> ExecutionReport {
            ExecutionReport::failure("unreachable")
        }

        fn lifecycle(&self) -> Option<&dyn Lifecycle> {
            Some(self)
        }
    }

    fn coordinator() -> SwarmCoordinator {
        SwarmCoordinator::new(SwarmConfig::default(), Arc::new(MemoryStreamStore::new())).unwrap()
    }

    #[tokio::test]
    async fn failed_setup_rolls_back_registration() {
        let c = coordinator();
        let err = c
            .register_agent(
                Agent::new("a", "a", "worker", capabilities(["x"]), 1),
                Arc::new(BrokenSetup),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::Lifecycle { .. }));
        assert!(!c.directory().contains(&AgentId::from("a")).await);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = SwarmConfig::default();
        config.consensus.consensus_threshold = 1.5;
        let result = SwarmCoordinator::new(config, Arc::new(MemoryStreamStore::new()));
        assert!(matches!(result, Err(SwarmError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_the_bus() {
        let c = coordinator();
        c.register_agent(
            Agent::new("a", "a", "worker", capabilities(["x"]), 1),
            Arc::new(FnExecutor::new(|_id: TaskId, v: serde_json::Value| async move {
                ExecutionReport::success(v)
            })),
        )
        .await
        .unwrap();
        c.start().await;
        c.shutdown().await;
        c.shutdown().await;
        assert!(c.bus().is_closed());
        assert!(!c.scheduler().is_running());
    }
}
