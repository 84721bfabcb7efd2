//! Task scheduler: admission, priority queueing, dispatch and lifecycle.
//!
//! All task state lives behind one mutex. When both are needed the
//! scheduler lock is taken before the directory lock, never the reverse;
//! the directory notifies the scheduler of unregistrations only after
//! releasing its own lock.
//!
//! Timeouts are cooperative: a timed-out task is marked Failed and its
//! agent slot returned, but the execution future is left to finish on its
//! own and its late report is dropped.

mod executor;
mod queue;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::directory::{AgentDirectory, AgentLifecycleObserver, AgentLoad};
use crate::domain::task::{AGENT_UNREGISTERED_ERROR, SCHEDULER_STOPPED_ERROR, TIMED_OUT_ERROR};
use crate::domain::{
    AgentId, ExecutionReport, SwarmError, SwarmResult, Task, TaskId, TaskStatus,
};
use crate::metrics::METRICS;
use crate::obs::{self, TaskSpan};

pub use executor::{FnExecutor, HookError, Lifecycle, TaskExecutor};
pub use queue::PendingQueue;

/// Prefix of the error recorded when an executor panics.
pub const EXECUTOR_PANICKED_ERROR: &str = "Executor panicked";

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Error recorded on tasks cancelled through [`TaskScheduler::cancel`].
pub const CANCELLED_BY_REQUEST_ERROR: &str = "Cancelled by request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub per_agent_load: BTreeMap<AgentId, AgentLoad>,
}

struct ActiveTask {
    task: Task,
    agent_id: AgentId,
    started: Instant,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

struct SchedulerState {
    pending: PendingQueue,
    active: HashMap<TaskId, ActiveTask>,
    completed: HashMap<TaskId, Task>,
    completed_order: VecDeque<TaskId>,
    history_limit: usize,
}

impl SchedulerState {
    fn knows(&self, task_id: &TaskId) -> bool {
        self.pending.get(task_id).is_some()
            || self.active.contains_key(task_id)
            || self.completed.contains_key(task_id)
    }

    /// Move a terminal task into history, evicting the oldest beyond the limit.
    fn record_completed(&mut self, task: Task) {
        let duration_ms = task.processing_secs().map(|s| (s * 1000.0) as u64);
        obs::emit_task_finished(&task.task_id, task.status, duration_ms);
        match task.status {
            TaskStatus::Completed => METRICS.inc_tasks_completed(),
            TaskStatus::Failed => METRICS.inc_tasks_failed(),
            TaskStatus::Cancelled => METRICS.inc_tasks_cancelled(),
            _ => {}
        }

        self.completed_order.push_back(task.task_id.clone());
        self.completed.insert(task.task_id.clone(), task);
        while self.completed_order.len() > self.history_limit {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}

/// Write a terminal status, stepping a dispatched-but-unstarted task through
/// Processing first when it is completing or failing.
fn finish_task(
    task: &mut Task,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
) {
    if task.status == TaskStatus::Assigned && status != TaskStatus::Cancelled {
        if let Err(e) = task.transition(TaskStatus::Processing) {
            warn!(task_id = %task.task_id, error = %e, "could not mark task processing");
        }
    }
    if let Err(e) = task.finish(status, result, error, Utc::now()) {
        warn!(task_id = %task.task_id, error = %e, "terminal state not written");
    }
}

pub struct TaskScheduler {
    directory: Arc<AgentDirectory>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    executors: RwLock<HashMap<AgentId, Arc<dyn TaskExecutor>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Create a scheduler and subscribe it to agent unregistrations.
    pub fn new(directory: Arc<AgentDirectory>, config: SchedulerConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let scheduler = Arc::new(Self {
            state: Mutex::new(SchedulerState {
                pending: PendingQueue::new(config.max_pending),
                active: HashMap::new(),
                completed: HashMap::new(),
                completed_order: VecDeque::new(),
                history_limit: config.completed_history_limit,
            }),
            directory: Arc::clone(&directory),
            config,
            executors: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown,
            loop_handle: Mutex::new(None),
        });

        let observer: Arc<dyn AgentLifecycleObserver> = scheduler.clone();
        directory.add_observer(Arc::downgrade(&observer));
        scheduler
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    // -- executors ------------------------------------------------------------

    /// Attach the execution contract for a registered agent, running its setup hook.
    pub async fn attach_executor(
        &self,
        agent_id: &AgentId,
        executor: Arc<dyn TaskExecutor>,
    ) -> SwarmResult<()> {
        if !self.directory.contains(agent_id).await {
            return Err(SwarmError::AgentNotFound(agent_id.clone()));
        }
        if let Some(lifecycle) = executor.lifecycle() {
            lifecycle.setup().await.map_err(|e| SwarmError::Lifecycle {
                agent_id: agent_id.clone(),
                reason: e.to_string(),
            })?;
        }

        let previous = self
            .executors
            .write()
            .await
            .insert(agent_id.clone(), executor);
        if let Some(previous) = previous {
            teardown(agent_id, previous).await;
        }
        Ok(())
    }

    /// Detach and tear down an agent's executor. Returns whether one was attached.
    pub async fn detach_executor(&self, agent_id: &AgentId) -> bool {
        let removed = self.executors.write().await.remove(agent_id);
        match removed {
            Some(executor) => {
                teardown(agent_id, executor).await;
                true
            }
            None => false,
        }
    }

    async fn agents_without_executor(&self) -> HashSet<AgentId> {
        let agents = self.directory.list().await;
        let executors = self.executors.read().await;
        agents
            .into_iter()
            .map(|a| a.agent_id)
            .filter(|id| !executors.contains_key(id))
            .collect()
    }

    // -- admission ------------------------------------------------------------

    /// Queue a task; fails with `QueueFull` at capacity and `DuplicateTask`
    /// when the id is pending, active or still in history.
    pub async fn submit(&self, mut task: Task) -> SwarmResult<TaskId> {
        if task.task_id.0.is_empty() {
            task.task_id = TaskId::generate();
        }
        if task.status != TaskStatus::Pending {
            return Err(SwarmError::InvalidTaskTransition {
                task_id: task.task_id,
                from: task.status,
                to: TaskStatus::Pending,
            });
        }

        let task_id = task.task_id.clone();
        let priority = task.priority;
        let pending = {
            let mut state = self.state.lock().await;
            if state.knows(&task_id) {
                return Err(SwarmError::DuplicateTask(task_id));
            }
            let capacity = state.pending.capacity();
            state
                .pending
                .push(task)
                .map_err(|_| SwarmError::QueueFull { capacity })?;
            state.pending.len()
        };

        METRICS.inc_tasks_submitted();
        obs::emit_task_submitted(&task_id, priority, pending);
        Ok(task_id)
    }

    /// Look up a task in the pending queue, the active set, then history.
    pub async fn get_status(&self, task_id: &TaskId) -> Option<Task> {
        let state = self.state.lock().await;
        state
            .pending
            .get(task_id)
            .cloned()
            .or_else(|| state.active.get(task_id).map(|a| a.task.clone()))
            .or_else(|| state.completed.get(task_id).cloned())
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (pending, active, completed) = {
            let state = self.state.lock().await;
            (state.pending.len(), state.active.len(), state.completed.len())
        };
        SchedulerStatus {
            pending,
            active,
            completed,
            per_agent_load: self.directory.per_agent_load().await,
        }
    }

    // -- dispatch -------------------------------------------------------------

    /// Dispatch from the head of the queue until no agent matches the head.
    ///
    /// The head is never skipped in favour of a later task.
    pub async fn dispatch_pass(self: &Arc<Self>) -> SwarmResult<usize> {
        let exclude = self.agents_without_executor().await;
        let mut dispatched = 0;
        let mut state = self.state.lock().await;

        loop {
            let Some(required) = state
                .pending
                .peek()
                .map(|t| t.required_capabilities.clone())
            else {
                break;
            };
            let Some(agent) = self.directory.claim_best_agent(&required, &exclude).await else {
                break;
            };
            let executor = self.executors.read().await.get(&agent.agent_id).cloned();
            let Some(executor) = executor else {
                // Detached since the exclusion set was built.
                if let Err(e) = self.directory.release_slot(&agent.agent_id).await {
                    debug!(agent_id = %agent.agent_id, error = %e, "slot release skipped");
                }
                break;
            };
            let Some(mut task) = state.pending.pop() else {
                break;
            };

            if let Err(e) = task.transition(TaskStatus::Assigned) {
                state.pending.push_front(task);
                if let Err(release) = self.directory.release_slot(&agent.agent_id).await {
                    debug!(agent_id = %agent.agent_id, error = %release, "slot release skipped");
                }
                return Err(e);
            }
            task.assigned_agent_id = Some(agent.agent_id.clone());
            task.processing_start = Some(Utc::now());

            let timeout = Duration::from_secs(
                task.timeout_seconds
                    .unwrap_or(self.config.default_timeout_secs),
            );
            let handle = self.spawn_execution(
                executor,
                task.task_id.clone(),
                agent.agent_id.clone(),
                task.payload.clone(),
            );

            METRICS.inc_tasks_dispatched();
            obs::emit_task_dispatched(&task.task_id, &agent.agent_id);
            state.active.insert(
                task.task_id.clone(),
                ActiveTask {
                    task,
                    agent_id: agent.agent_id,
                    started: Instant::now(),
                    timeout,
                    handle: Some(handle),
                },
            );
            dispatched += 1;
        }

        Ok(dispatched)
    }

    fn spawn_execution(
        self: &Arc<Self>,
        executor: Arc<dyn TaskExecutor>,
        task_id: TaskId,
        agent_id: AgentId,
        payload: serde_json::Value,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let span = TaskSpan::new(&task_id, &agent_id);
        tokio::spawn(span.instrument(async move {
            scheduler.mark_processing(&task_id).await;
            let report = AssertUnwindSafe(executor.execute(&task_id, &payload))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let reason = panic_message(panic.as_ref());
                    warn!(
                        task_id = %task_id,
                        agent_id = %agent_id,
                        reason = %reason,
                        "executor panicked"
                    );
                    ExecutionReport::failure(format!("{EXECUTOR_PANICKED_ERROR}: {reason}"))
                });
            scheduler.complete(&task_id, &agent_id, report).await;
        }))
    }

    async fn mark_processing(&self, task_id: &TaskId) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.get_mut(task_id) {
            if active.task.status == TaskStatus::Assigned {
                if let Err(e) = active.task.transition(TaskStatus::Processing) {
                    warn!(task_id = %task_id, error = %e, "could not mark task processing");
                }
            }
        }
    }

    async fn complete(&self, task_id: &TaskId, agent_id: &AgentId, report: ExecutionReport) {
        let success = report.is_success();
        let elapsed = {
            let mut state = self.state.lock().await;
            let Some(mut active) = state.active.remove(task_id) else {
                debug!(task_id = %task_id, "late completion ignored");
                return;
            };
            let status = if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            finish_task(&mut active.task, status, report.result, report.error);
            let elapsed = active.started.elapsed();
            state.record_completed(active.task);
            elapsed
        };

        if let Err(e) = self
            .directory
            .release_agent(agent_id, elapsed.as_secs_f64(), success)
            .await
        {
            debug!(agent_id = %agent_id, error = %e, "agent gone before task finished");
        }
    }

    /// Fail every active task that has run longer than its timeout.
    pub async fn sweep_timeouts(&self) -> usize {
        let expired: Vec<AgentId> = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let ids: Vec<TaskId> = state
                .active
                .iter()
                .filter(|(_, a)| now.duration_since(a.started) > a.timeout)
                .map(|(id, _)| id.clone())
                .collect();

            let mut agents = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(mut active) = state.active.remove(&id) else {
                    continue;
                };
                obs::emit_task_timed_out(&id, &active.agent_id, active.timeout.as_secs());
                METRICS.inc_tasks_timed_out();
                finish_task(
                    &mut active.task,
                    TaskStatus::Failed,
                    None,
                    Some(TIMED_OUT_ERROR.to_string()),
                );
                agents.push(active.agent_id);
                state.record_completed(active.task);
            }
            agents
        };

        for agent_id in &expired {
            if let Err(e) = self
                .directory
                .record_timeout(agent_id, self.config.timeout_health_penalty)
                .await
            {
                debug!(agent_id = %agent_id, error = %e, "timeout penalty skipped");
            }
        }
        expired.len()
    }

    /// One loop iteration: timeout sweep, then a dispatch pass.
    pub async fn tick(self: &Arc<Self>) -> SwarmResult<usize> {
        self.sweep_timeouts().await;
        self.dispatch_pass().await
    }

    // -- cancellation -----------------------------------------------------------

    /// Cancel a pending or active task.
    pub async fn cancel(&self, task_id: &TaskId) -> SwarmResult<Task> {
        let (task, release) = {
            let mut state = self.state.lock().await;
            if let Some(mut task) = state.pending.remove(task_id) {
                finish_task(
                    &mut task,
                    TaskStatus::Cancelled,
                    None,
                    Some(CANCELLED_BY_REQUEST_ERROR.to_string()),
                );
                state.record_completed(task.clone());
                (task, None)
            } else if let Some(mut active) = state.active.remove(task_id) {
                if let Some(handle) = active.handle.take() {
                    handle.abort();
                }
                finish_task(
                    &mut active.task,
                    TaskStatus::Cancelled,
                    None,
                    Some(CANCELLED_BY_REQUEST_ERROR.to_string()),
                );
                state.record_completed(active.task.clone());
                (active.task, Some(active.agent_id))
            } else if let Some(done) = state.completed.get(task_id) {
                return Err(SwarmError::InvalidTaskTransition {
                    task_id: task_id.clone(),
                    from: done.status,
                    to: TaskStatus::Cancelled,
                });
            } else {
                return Err(SwarmError::TaskNotFound(task_id.clone()));
            }
        };

        if let Some(agent_id) = release {
            if let Err(e) = self.directory.release_slot(&agent_id).await {
                debug!(agent_id = %agent_id, error = %e, "slot release skipped");
            }
        }
        Ok(task)
    }

    /// Cancel every active task owned by `agent_id`. Returns how many.
    pub async fn cancel_agent_tasks(&self, agent_id: &AgentId, reason: &str) -> usize {
        let mut state = self.state.lock().await;
        let ids: Vec<TaskId> = state
            .active
            .iter()
            .filter(|(_, a)| &a.agent_id == agent_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(mut active) = state.active.remove(id) {
                if let Some(handle) = active.handle.take() {
                    handle.abort();
                }
                finish_task(
                    &mut active.task,
                    TaskStatus::Cancelled,
                    None,
                    Some(reason.to_string()),
                );
                state.record_completed(active.task);
            }
        }
        ids.len()
    }

    // -- lifecycle --------------------------------------------------------------

    /// Spawn the dispatch loop. No-op if already started or stopped.
    pub async fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let delay = match scheduler.tick().await {
                    Ok(_) => scheduler.config.poll_interval(),
                    Err(e) => {
                        obs::emit_loop_error("scheduler", &e);
                        scheduler.config.error_backoff()
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("scheduler loop stopped");
        });
        *self.loop_handle.lock().await = Some(handle);
        info!("scheduler started");
    }

    /// Stop the loop and cancel every active and pending task. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let loop_handle = self.loop_handle.lock().await.take();
        if let Some(handle) = loop_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }

        let (handles, releases) = {
            let mut state = self.state.lock().await;
            let active: Vec<ActiveTask> = state.active.drain().map(|(_, a)| a).collect();
            let mut handles = Vec::with_capacity(active.len());
            let mut releases = Vec::with_capacity(active.len());

            for mut a in active {
                if let Some(handle) = a.handle.take() {
                    handle.abort();
                    handles.push(handle);
                }
                finish_task(
                    &mut a.task,
                    TaskStatus::Cancelled,
                    None,
                    Some(SCHEDULER_STOPPED_ERROR.to_string()),
                );
                releases.push(a.agent_id);
                state.record_completed(a.task);
            }

            let pending: Vec<Task> = state.pending.drain().collect();
            for mut task in pending {
                finish_task(
                    &mut task,
                    TaskStatus::Cancelled,
                    None,
                    Some(SCHEDULER_STOPPED_ERROR.to_string()),
                );
                state.record_completed(task);
            }
            (handles, releases)
        };

        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "execution panicked during shutdown");
                }
            }
        }
        for agent_id in releases {
            if let Err(e) = self.directory.release_slot(&agent_id).await {
                debug!(agent_id = %agent_id, error = %e, "slot release skipped");
            }
        }

        let executors: Vec<_> = self.executors.write().await.drain().collect();
        for (agent_id, executor) in executors {
            teardown(&agent_id, executor).await;
        }
        info!("scheduler stopped");
    }
}

async fn teardown(agent_id: &AgentId, executor: Arc<dyn TaskExecutor>) {
    if let Some(lifecycle) = executor.lifecycle() {
        if let Err(e) = lifecycle.teardown().await {
            warn!(agent_id = %agent_id, error = %e, "executor teardown failed");
        }
    }
}

#[async_trait]
impl AgentLifecycleObserver for TaskScheduler {
    async fn agent_unregistered(&self, agent_id: &AgentId) {
        let cancelled = self
            .cancel_agent_tasks(agent_id, AGENT_UNREGISTERED_ERROR)
            .await;
        self.detach_executor(agent_id).await;
        if cancelled > 0 {
            info!(agent_id = %agent_id, cancelled, "cancelled tasks of unregistered agent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use crate::domain::{capabilities, Agent, Priority};

    fn scheduler(max_pending: usize) -> Arc<TaskScheduler> {
        let directory = Arc::new(AgentDirectory::new(DirectoryConfig::default()));
        let config = SchedulerConfig {
            max_pending,
            ..SchedulerConfig::default()
        };
        TaskScheduler::new(directory, config)
    }

    fn echo() -> Arc<dyn TaskExecutor> {
        Arc::new(FnExecutor::new(|_id: TaskId, payload: serde_json::Value| async move {
            ExecutionReport::success(payload)
        }))
    }

    #[tokio::test]
    async fn submit_rejects_when_full() {
        let s = scheduler(1);
        s.submit(Task::new("a", serde_json::Value::Null)).await.unwrap();
        let err = s
            .submit(Task::new("b", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::QueueFull { capacity: 1 }));
    }

    #[tokio::test]
    async fn empty_id_is_generated() {
        let s = scheduler(4);
        let id = s
            .submit(Task::new("a", serde_json::Value::Null).with_id(""))
            .await
            .unwrap();
        assert!(!id.0.is_empty());
        assert_eq!(s.get_status(&id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn agents_without_executor_receive_nothing() {
        let s = scheduler(4);
        s.directory()
            .register(Agent::new("a", "a", "w", capabilities(["x"]), 1))
            .await
            .unwrap();
        s.submit(Task::new("t", serde_json::Value::Null)).await.unwrap();

        assert_eq!(s.dispatch_pass().await.unwrap(), 0);
        s.attach_executor(&AgentId::from("a"), echo()).await.unwrap();
        assert_eq!(s.dispatch_pass().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_pending_task_moves_it_to_history() {
        let s = scheduler(4);
        let id = s
            .submit(Task::new("t", serde_json::Value::Null).with_priority(Priority::High))
            .await
            .unwrap();
        let cancelled = s.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(s.status().await.completed, 1);
        assert!(matches!(
            s.cancel(&id).await,
            Err(SwarmError::InvalidTaskTransition { .. })
        ));
        assert!(matches!(
            s.cancel(&TaskId::from("nope")).await,
            Err(SwarmError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn attach_requires_registered_agent() {
        let s = scheduler(4);
        let err = s
            .attach_executor(&AgentId::from("ghost"), echo())
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let directory = Arc::new(AgentDirectory::new(DirectoryConfig::default()));
        let config = SchedulerConfig {
            completed_history_limit: 2,
            ..SchedulerConfig::default()
        };
        let s = TaskScheduler::new(directory, config);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = s.submit(Task::new("t", serde_json::Value::Null)).await.unwrap();
            s.cancel(&id).await.unwrap();
            ids.push(id);
        }
        assert_eq!(s.status().await.completed, 2);
        assert!(s.get_status(&ids[0]).await.is_none());
        assert!(s.get_status(&ids[2]).await.is_some());
    }
}
