//! Process-wide atomic counters for swarm observability.
//!
//! Counters are bumped at the call site and never read back for decisions.
//! [`Metrics::flush`] emits the current values as one `info!` event; the
//! coordinator calls it on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub debates_initiated: u64,
    pub debates_finalized: u64,
}

pub struct Metrics {
    tasks_submitted: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    tasks_cancelled: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    debates_initiated: AtomicU64,
    debates_finalized: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_timed_out: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            debates_initiated: AtomicU64::new(0),
            debates_finalized: AtomicU64::new(0),
        }
    }

    counter!(inc_tasks_submitted, tasks_submitted);
    counter!(inc_tasks_dispatched, tasks_dispatched);
    counter!(inc_tasks_completed, tasks_completed);
    counter!(inc_tasks_failed, tasks_failed);
    counter!(inc_tasks_timed_out, tasks_timed_out);
    counter!(inc_tasks_cancelled, tasks_cancelled);
    counter!(inc_messages_published, messages_published);
    counter!(inc_publish_failures, publish_failures);
    counter!(inc_debates_initiated, debates_initiated);
    counter!(inc_debates_finalized, debates_finalized);

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            tasks_submitted: load(&self.tasks_submitted),
            tasks_dispatched: load(&self.tasks_dispatched),
            tasks_completed: load(&self.tasks_completed),
            tasks_failed: load(&self.tasks_failed),
            tasks_timed_out: load(&self.tasks_timed_out),
            tasks_cancelled: load(&self.tasks_cancelled),
            messages_published: load(&self.messages_published),
            publish_failures: load(&self.publish_failures),
            debates_initiated: load(&self.debates_initiated),
            debates_finalized: load(&self.debates_finalized),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            tasks_submitted = s.tasks_submitted,
            tasks_dispatched = s.tasks_dispatched,
            tasks_completed = s.tasks_completed,
            tasks_failed = s.tasks_failed,
            tasks_timed_out = s.tasks_timed_out,
            tasks_cancelled = s.tasks_cancelled,
            messages_published = s.messages_published,
            publish_failures = s.publish_failures,
            debates_initiated = s.debates_initiated,
            debates_finalized = s.debates_finalized,
        );
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for c in [
            &self.tasks_submitted,
            &self.tasks_dispatched,
            &self.tasks_completed,
            &self.tasks_failed,
            &self.tasks_timed_out,
            &self.tasks_cancelled,
            &self.messages_published,
            &self.publish_failures,
            &self.debates_initiated,
            &self.debates_finalized,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
