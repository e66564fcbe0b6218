//! Concurrency Queue - bounded admission with FIFO overflow
//!
//! The queue only decides. Callers hold it behind a mutex and apply the
//! matching registry transition under the same guard, so admission, release
//! and promotion are atomic relative to each other.

use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use webpilot_foundation::{Error, QueueConfig, Result};

/// Pending task awaiting a free slot
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task: Task,
    pub enqueued_at: DateTime<Utc>,
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the task now holds it
    Start,
    /// Appended to the queue at this 1-based position
    Queued { position: usize },
}

/// Queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub queue_limit: usize,
}

impl QueueStats {
    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.running)
    }
}

/// Bounded concurrency queue
#[derive(Debug)]
pub struct ConcurrencyQueue {
    max_concurrent: usize,
    queue_limit: usize,

    /// Tasks holding a slot
    running: HashSet<TaskId>,

    /// FIFO of tasks waiting for a slot
    pending: VecDeque<QueueEntry>,
}

impl ConcurrencyQueue {
    pub fn new(max_concurrent: usize, queue_limit: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            queue_limit,
            running: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_concurrent, config.queue_limit)
    }

    /// Admit a task, queue it, or reject it without touching any state
    pub fn admit(&mut self, task: &Task) -> Result<Admission> {
        if self.running.len() < self.max_concurrent {
            self.running.insert(task.task_id.clone());
            return Ok(Admission::Start);
        }

        if self.pending.len() < self.queue_limit {
            self.pending.push_back(QueueEntry {
                task: task.clone(),
                enqueued_at: Utc::now(),
            });
            return Ok(Admission::Queued {
                position: self.pending.len(),
            });
        }

        Err(Error::QueueFull {
            running: self.running.len(),
            queued: self.pending.len(),
            limit: self.queue_limit,
        })
    }

    /// Free the slot held by `task_id` and promote the oldest queued entry
    ///
    /// Returns the promoted entry, which now holds the slot.
    pub fn release(&mut self, task_id: &TaskId) -> Option<QueueEntry> {
        if !self.running.remove(task_id) {
            return None;
        }
        self.promote()
    }

    fn promote(&mut self) -> Option<QueueEntry> {
        if self.running.len() >= self.max_concurrent {
            return None;
        }
        let entry = self.pending.pop_front()?;
        self.running.insert(entry.task.task_id.clone());
        Some(entry)
    }

    /// Remove a task that has not started yet
    pub fn cancel_queued(&mut self, task_id: &TaskId) -> Option<QueueEntry> {
        let index = self
            .pending
            .iter()
            .position(|e| &e.task.task_id == task_id)?;
        self.pending.remove(index)
    }

    /// Remove every queued entry (oldest first)
    pub fn drain_queued(&mut self) -> Vec<QueueEntry> {
        self.pending.drain(..).collect()
    }

    /// 1-based queue position
    pub fn position(&self, task_id: &TaskId) -> Option<usize> {
        self.pending
            .iter()
            .position(|e| &e.task.task_id == task_id)
            .map(|i| i + 1)
    }

    pub fn holds_slot(&self, task_id: &TaskId) -> bool {
        self.running.contains(task_id)
    }

    pub fn is_queued(&self, task_id: &TaskId) -> bool {
        self.position(task_id).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            running: self.running.len(),
            queued: self.pending.len(),
            max_concurrent: self.max_concurrent,
            queue_limit: self.queue_limit,
        }
    }

    /// Queued task ids in promotion order
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.pending.iter().map(|e| e.task.task_id.clone()).collect()
    }
}
