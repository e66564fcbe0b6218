//! Task Log System - per-task progress event buffers
//!
//! Provides:
//! - Append-only event buffer per task (arrival order, line numbers)
//! - Real-time subscription via broadcast
//! - Tail / error queries for status endpoints
//! - Bounded retention

use crate::parser::{EventKind, ProgressEvent};
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Maximum log entries per task
const DEFAULT_MAX_ENTRIES: usize = 10000;

/// Broadcast channel capacity
const BROADCAST_CAPACITY: usize = 1000;

/// Maximum buffers kept before finished ones are evicted
const DEFAULT_MAX_BUFFERS: usize = 200;

/// Log buffer for a single task
#[derive(Debug)]
pub struct TaskLogBuffer {
    pub task_id: TaskId,

    entries: VecDeque<ProgressEvent>,

    max_entries: usize,

    /// Lines pushed so far (including evicted ones)
    line_count: usize,

    tx: broadcast::Sender<ProgressEvent>,

    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TaskLogBuffer {
    pub fn new(task_id: TaskId) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            task_id,
            entries: VecDeque::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
            line_count: 0,
            tx,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    /// Add an event, assigning its line number
    pub fn push(&mut self, mut event: ProgressEvent) {
        self.line_count += 1;
        event.line_number = self.line_count;

        // Send to real-time subscribers
        let _ = self.tx.send(event.clone());

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Mark as ended
    pub fn mark_ended(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Subscribe to real-time events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProgressEvent> {
        self.entries.iter()
    }

    /// Get last N entries
    pub fn tail(&self, n: usize) -> Vec<&ProgressEvent> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    /// Get only errors
    pub fn errors(&self) -> Vec<&ProgressEvent> {
        self.entries.iter().filter(|e| e.kind.is_error()).collect()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn duration_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn summary(&self) -> LogSummary {
        LogSummary {
            task_id: self.task_id.clone(),
            total_lines: self.line_count,
            error_count: self.errors().len(),
            warning_count: self.count_of(EventKind::Warning),
            is_active: self.is_active(),
            duration_secs: self.duration_secs(),
        }
    }
}

/// Short description of a task log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSummary {
    pub task_id: TaskId,
    pub total_lines: usize,
    pub error_count: usize,
    pub warning_count: usize,
    pub is_active: bool,
    pub duration_secs: f64,
}

/// Task log manager - manages logs for all tasks
pub struct TaskLogManager {
    buffers: Arc<RwLock<HashMap<TaskId, TaskLogBuffer>>>,
    max_entries: usize,
    max_buffers: usize,
}

impl TaskLogManager {
    pub fn new() -> Self {
        Self {
            buffers: Arc::new(RwLock::new(HashMap::new())),
            max_entries: DEFAULT_MAX_ENTRIES,
            max_buffers: DEFAULT_MAX_BUFFERS,
        }
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_max_buffers(mut self, max: usize) -> Self {
        self.max_buffers = max.max(1);
        self
    }

    /// Create the buffer for a task (kept if it already exists, e.g. on restart)
    pub async fn create_buffer(&self, task_id: &TaskId) -> broadcast::Receiver<ProgressEvent> {
        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.get_mut(task_id) {
            buffer.ended_at = None;
            return buffer.subscribe();
        }

        let buffer = TaskLogBuffer::new(task_id.clone()).with_max_entries(self.max_entries);
        let receiver = buffer.subscribe();
        buffers.insert(task_id.clone(), buffer);

        if buffers.len() > self.max_buffers {
            Self::evict_finished(&mut buffers, self.max_buffers);
        }

        debug!("Created log buffer for task {}", task_id);
        receiver
    }

    fn evict_finished(buffers: &mut HashMap<TaskId, TaskLogBuffer>, max_buffers: usize) {
        // Remove oldest finished buffers
        let mut finished: Vec<(TaskId, DateTime<Utc>)> = buffers
            .iter()
            .filter_map(|(id, buf)| buf.ended_at.map(|t| (id.clone(), t)))
            .collect();
        finished.sort_by_key(|(_, t)| *t);

        let to_remove = buffers.len().saturating_sub(max_buffers / 2).min(finished.len());
        for (id, _) in finished.into_iter().take(to_remove) {
            buffers.remove(&id);
            debug!("Evicted log buffer for task {}", id);
        }
    }

    /// Append events in arrival order
    pub async fn append(&self, task_id: &TaskId, events: Vec<ProgressEvent>) {
        if events.is_empty() {
            return;
        }
        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.get_mut(task_id) {
            for event in events {
                buffer.push(event);
            }
        }
    }

    pub async fn push(&self, task_id: &TaskId, event: ProgressEvent) {
        self.append(task_id, vec![event]).await;
    }

    pub async fn mark_ended(&self, task_id: &TaskId) {
        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.get_mut(task_id) {
            buffer.mark_ended();
        }
    }

    pub async fn subscribe(&self, task_id: &TaskId) -> Option<broadcast::Receiver<ProgressEvent>> {
        let buffers = self.buffers.read().await;
        buffers.get(task_id).map(|b| b.subscribe())
    }

    /// Get tail of logs (`None` = everything kept)
    pub async fn tail(&self, task_id: &TaskId, n: Option<usize>) -> Option<Vec<ProgressEvent>> {
        let buffers = self.buffers.read().await;
        buffers.get(task_id).map(|b| {
            let n = n.unwrap_or(usize::MAX);
            b.tail(n).into_iter().cloned().collect()
        })
    }

    pub async fn errors(&self, task_id: &TaskId) -> Vec<ProgressEvent> {
        let buffers = self.buffers.read().await;
        buffers
            .get(task_id)
            .map(|b| b.errors().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn summary(&self, task_id: &TaskId) -> Option<LogSummary> {
        let buffers = self.buffers.read().await;
        buffers.get(task_id).map(|b| b.summary())
    }

    /// Drop a task's buffer
    pub async fn remove(&self, task_id: &TaskId) {
        self.buffers.write().await.remove(task_id);
    }
}

impl Default for TaskLogManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, raw: &str) -> ProgressEvent {
        ProgressEvent::new(kind, TaskId::from("task-1"), "session-1", raw)
    }

    #[test]
    fn test_log_buffer() {
        let mut buffer = TaskLogBuffer::new(TaskId::from("task-1"));
        buffer.push(event(EventKind::Step, "📍 Step 1"));
        buffer.push(event(EventKind::Error, "❌ failed"));
        buffer.push(event(EventKind::Info, "line"));

        assert_eq!(buffer.line_count(), 3);
        assert_eq!(buffer.errors().len(), 1);
        assert_eq!(buffer.tail(2).len(), 2);
        assert_eq!(buffer.tail(2)[0].line_number, 2);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut buffer = TaskLogBuffer::new(TaskId::from("task-1")).with_max_entries(2);
        for i in 0..5 {
            buffer.push(event(EventKind::Info, &format!("line {}", i)));
        }
        assert_eq!(buffer.line_count(), 5);
        let kept: Vec<usize> = buffer.entries().map(|e| e.line_number).collect();
        assert_eq!(kept, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_log_manager() {
        let manager = TaskLogManager::new();
        let id = TaskId::from("task-1");

        let _rx = manager.create_buffer(&id).await;
        manager
            .append(
                &id,
                vec![event(EventKind::Step, "📍 Step 1"), event(EventKind::Error, "ERROR x")],
            )
            .await;
        manager.mark_ended(&id).await;

        let summary = manager.summary(&id).await.unwrap();
        assert_eq!(summary.total_lines, 2);
        assert_eq!(summary.error_count, 1);
        assert!(!summary.is_active);
        assert_eq!(manager.tail(&id, None).await.unwrap().len(), 2);
        assert!(manager.tail(&TaskId::from("other"), None).await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe() {
        let manager = TaskLogManager::new();
        let id = TaskId::from("task-1");
        let mut rx = manager.create_buffer(&id).await;

        manager.push(&id, event(EventKind::Goal, "🎯 Next goal: search")).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::Goal);
        assert_eq!(received.line_number, 1);
    }

    #[tokio::test]
    async fn test_restart_keeps_buffer() {
        let manager = TaskLogManager::new();
        let id = TaskId::from("task-1");
        manager.create_buffer(&id).await;
        manager.push(&id, event(EventKind::Info, "first execution")).await;
        manager.create_buffer(&id).await;
        manager.push(&id, event(EventKind::Info, "second execution")).await;
        assert_eq!(manager.tail(&id, None).await.unwrap().len(), 2);
    }
}
