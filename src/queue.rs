// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Priority task queue and per-task state machine.
//!
//! The queue owns canonical task state. Ordering is a min-heap on
//! `(priority, created_at)` so lower priority numbers and older tasks pop
//! first. Status changes go through the transition methods, which reject
//! anything the [`TaskStatus`] state machine does not allow and fire the
//! registered callbacks exactly once per transition.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::QueueError;
use crate::types::{Task, TaskStatus};

/// Callback invoked on every status transition: `(task_id, from, to)`.
pub type StatusCallback = Arc<dyn Fn(&str, TaskStatus, TaskStatus) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i32,
    created_at: u64,
    id: String,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<QueueKey>>,
    tasks: HashMap<String, Task>,
    assignees: HashMap<String, String>,
}

/// Thread-safe priority queue of tasks.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    callbacks: RwLock<Vec<StatusCallback>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a status-change callback.
    pub fn on_status_change(&self, callback: StatusCallback) {
        self.callbacks.write().unwrap().push(callback);
    }

    /// Add a new task. The task enters in `Pending` state.
    pub fn enqueue(&self, mut task: Task) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.tasks.contains_key(&task.id) {
            return Err(QueueError::Duplicate(task.id));
        }
        task.status = TaskStatus::Pending;
        inner.heap.push(Reverse(QueueKey {
            priority: task.priority,
            created_at: task.created_at,
            id: task.id.clone(),
        }));
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Highest-priority pending task, if any, without removing it.
    pub fn peek(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        Self::drop_stale(&mut inner);
        let id = inner.heap.peek().map(|Reverse(k)| k.id.clone())?;
        inner.tasks.get(&id).cloned()
    }

    /// Remove and return the highest-priority pending task.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        Self::drop_stale(&mut inner);
        let id = inner.heap.pop().map(|Reverse(k)| k.id)?;
        inner.tasks.get(&id).cloned()
    }

    /// Discard heap entries whose task is gone or no longer pending.
    fn drop_stale(inner: &mut Inner) {
        loop {
            let stale = match inner.heap.peek() {
                Some(Reverse(key)) => !matches!(
                    inner.tasks.get(&key.id),
                    Some(task) if task.status == TaskStatus::Pending
                ),
                None => break,
            };
            if !stale {
                break;
            }
            inner.heap.pop();
        }
    }

    /// Look up a task by id.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(id).cloned()
    }

    /// Number of tasks still pending dispatch.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Total number of tasks ever enqueued and still tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assign a pending task to a worker.
    pub fn assign(&self, id: &str, worker_id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Assigned, Some(worker_id))
    }

    /// Mark an assigned task as running.
    pub fn start(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Running, None)
    }

    /// Mark a running task as complete.
    pub fn complete(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Complete, None)
    }

    /// Mark a running task as failed.
    pub fn fail(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Failed, None)
    }

    /// Mark a running task as blocked.
    pub fn block(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Blocked, None)
    }

    /// Mark a running task as partially complete.
    pub fn mark_partial(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, TaskStatus::Partial, None)
    }

    /// Apply the handoff-reported terminal status to a running task.
    pub fn finish(&self, id: &str, status: TaskStatus) -> Result<(), QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: "running".to_string(),
                to: status.as_str().to_string(),
            });
        }
        self.transition(id, status, None)
    }

    /// Worker currently assigned to a task.
    pub fn assignee(&self, id: &str) -> Option<String> {
        self.inner.lock().unwrap().assignees.get(id).cloned()
    }

    fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        worker_id: Option<&str>,
    ) -> Result<(), QueueError> {
        let from = {
            let mut inner = self.inner.lock().unwrap();
            let task = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            let from = task.status;
            if !from.can_transition_to(to) {
                return Err(QueueError::InvalidTransition {
                    id: id.to_string(),
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }
            task.status = to;
            if let Some(worker) = worker_id {
                inner.assignees.insert(id.to_string(), worker.to_string());
            }
            from
        };

        // Callbacks run outside the queue lock so they may re-enter.
        let callbacks = self.callbacks.read().unwrap().clone();
        for callback in callbacks {
            callback(id, from, to);
        }
        Ok(())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
