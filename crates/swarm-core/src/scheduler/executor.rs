//! Execution contract implemented by agents.
//!
//! The scheduler calls [`TaskExecutor::execute`] at most once per dispatch.
//! Executors that need setup or teardown opt in by returning a
//! [`Lifecycle`] from [`TaskExecutor::lifecycle`].

use std::future::Future;

use async_trait::async_trait;

use crate::domain::{ExecutionReport, TaskId};

/// Error returned by lifecycle hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Optional setup/teardown capability of an executor.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Runs when the executor is attached; failure rejects the attach.
    async fn setup(&self) -> Result<(), HookError>;

    /// Runs when the executor is detached or the scheduler stops.
    async fn teardown(&self) -> Result<(), HookError>;
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Perform the task. Must not block indefinitely; the scheduler's
    /// timeout sweep is the only backstop.
    async fn execute(&self, task_id: &TaskId, payload: &serde_json::Value) -> ExecutionReport;

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        None
    }
}

/// Adapts an async closure `(TaskId, payload) -> ExecutionReport` into an executor.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskId, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = ExecutionReport> + Send,
{
    async fn execute(&self, task_id: &TaskId, payload: &serde_json::Value) -> ExecutionReport {
        (self.f)(task_id.clone(), payload.clone()).await
    }
}
