//! Bounded pending queue ordered by descending priority.

use std::collections::VecDeque;

use crate::domain::{Task, TaskId};

#[derive(Debug)]
pub struct PendingQueue {
    tasks: VecDeque<Task>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: VecDeque::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert behind every task of equal or higher priority.
    ///
    /// Returns the task back when the queue is full.
    pub fn push(&mut self, task: Task) -> Result<usize, Task> {
        if self.tasks.len() >= self.capacity {
            return Err(task);
        }
        let pos = self
            .tasks
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(pos, task);
        Ok(pos)
    }

    /// Put a task back at the head, ignoring capacity.
    pub fn push_front(&mut self, task: Task) {
        self.tasks.push_front(task);
    }

    pub fn peek(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    pub fn remove(&mut self, task_id: &TaskId) -> Option<Task> {
        let idx = self.tasks.iter().position(|t| &t.task_id == task_id)?;
        self.tasks.remove(idx)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;

    fn task(id: &str, p: Priority) -> Task {
        Task::new("t", serde_json::Value::Null)
            .with_id(id)
            .with_priority(p)
    }

    fn order(q: &PendingQueue) -> Vec<String> {
        q.tasks.iter().map(|t| t.task_id.0.clone()).collect()
    }

    #[test]
    fn higher_priority_jumps_ahead_stably() {
        let mut q = PendingQueue::new(10);
        q.push(task("n1", Priority::Normal)).unwrap();
        q.push(task("n2", Priority::Normal)).unwrap();
        q.push(task("low", Priority::Low)).unwrap();
        assert_eq!(q.push(task("crit", Priority::Critical)).unwrap(), 0);
        q.push(task("n3", Priority::Normal)).unwrap();
        q.push(task("h1", Priority::High)).unwrap();

        assert_eq!(order(&q), vec!["crit", "h1", "n1", "n2", "n3", "low"]);
    }

    #[test]
    fn full_queue_returns_the_task() {
        let mut q = PendingQueue::new(1);
        q.push(task("a", Priority::Normal)).unwrap();
        let rejected = q.push(task("b", Priority::Critical)).unwrap_err();
        assert_eq!(rejected.task_id.as_str(), "b");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_by_id() {
        let mut q = PendingQueue::new(4);
        q.push(task("a", Priority::Normal)).unwrap();
        q.push(task("b", Priority::Normal)).unwrap();
        assert!(q.remove(&TaskId::from("a")).is_some());
        assert!(q.remove(&TaskId::from("a")).is_none());
        assert_eq!(q.peek().map(|t| t.task_id.as_str()), Some("b"));
    }
}
