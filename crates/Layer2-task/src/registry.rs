//! Task Registry - canonical task state
//!
//! Holds every task in an active map. Terminal tasks stay there for a grace
//! window (late status queries), then move to a bounded history.

use crate::artifact::ArtifactRecord;
use crate::parser::TokenUsageRecord;
use crate::state::TaskStatus;
use crate::task::{ExecutionId, ResolvedOptions, Task, TaskFailure, TaskId, TaskRecord, TaskResult};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webpilot_foundation::{Error, RegistryConfig, Result};

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<TaskId, TaskRecord>,
    /// Most recent first
    history: VecDeque<TaskRecord>,
}

/// Task registry
#[derive(Debug)]
pub struct TaskRegistry {
    state: RwLock<RegistryState>,
    config: RegistryConfig,
}

impl TaskRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            config,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Create the record for an admitted task
    ///
    /// Fails if a non-terminal task with the same id exists. A terminal one
    /// is moved to history first.
    pub fn register(
        &self,
        task: &Task,
        options: ResolvedOptions,
        status: TaskStatus,
    ) -> Result<TaskRecord> {
        let mut state = self.state.write();
        if let Some(existing) = state.active.get(&task.task_id) {
            if !existing.is_terminal() {
                return Err(Error::InvalidInput(format!(
                    "Task {} is already {}",
                    task.task_id, existing.status
                )));
            }
        }
        if let Some(previous) = state.active.remove(&task.task_id) {
            Self::push_history(&mut state, previous, self.config.history_limit);
        }

        let record = TaskRecord::new(task, options, status);
        state.active.insert(task.task_id.clone(), record.clone());
        debug!(task_id = %task.task_id, status = %status, "Registered task");
        Ok(record)
    }

    /// Check whether a non-terminal task with this id exists
    pub fn is_live(&self, task_id: &TaskId) -> bool {
        self.state
            .read()
            .active
            .get(task_id)
            .map_or(false, |r| !r.is_terminal())
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn transition<F>(&self, task_id: &TaskId, next: TaskStatus, apply: F) -> Result<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut state = self.state.write();
        let record = state
            .active
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;

        if !record.status.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "Task {} cannot go from {} to {}",
                task_id, record.status, next
            )));
        }

        record.status = next;
        apply(record);
        record.recompute_progress();
        Ok(record.clone())
    }

    /// Queued -> started (promotion)
    pub fn mark_started(&self, task_id: &TaskId) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Started, |_| {})
    }

    /// Started -> running, first execution or restart
    pub fn mark_running(&self, task_id: &TaskId, execution_id: ExecutionId) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Running, |record| {
            record.execution_id = Some(execution_id);
            record.executions.push(execution_id);
            record.started_at.get_or_insert_with(Utc::now);
        })
    }

    /// Running -> paused
    ///
    /// `consumed` is the run time of an execution that will not continue.
    pub fn mark_paused(&self, task_id: &TaskId, consumed: Duration) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Paused, |record| {
            record.active_time = record.active_time.saturating_add(consumed);
        })
    }

    /// Paused -> running (suspended process continued)
    pub fn mark_resumed(&self, task_id: &TaskId) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Running, |_| {})
    }

    /// Paused -> started, before a new execution is spawned
    ///
    /// Steps reported so far become the offset of the next execution.
    pub fn mark_restarting(&self, task_id: &TaskId) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Started, |record| {
            record.step_offset = record.current_step;
        })
    }

    /// Record a step reported by an execution. Returns the task-level step.
    ///
    /// Updates from a superseded execution are ignored.
    pub fn update_step(&self, task_id: &TaskId, execution_id: ExecutionId, step: u32) -> Option<u32> {
        let mut state = self.state.write();
        let record = state.active.get_mut(task_id)?;
        if record.is_terminal() || record.execution_id != Some(execution_id) {
            return None;
        }
        let reported = record.step_offset.saturating_add(step);
        if reported > record.current_step {
            record.current_step = reported;
            record.recompute_progress();
        }
        Some(record.current_step)
    }

    /// Add one execution's usage to the task total
    ///
    /// A stopped task still collects what its last execution reports while
    /// shutting down; the stop failure carries the same totals.
    pub fn record_usage(&self, task_id: &TaskId, usage: &TokenUsageRecord) {
        let mut state = self.state.write();
        let Some(record) = state.active.get_mut(task_id) else {
            return;
        };
        if !Self::accepts_late_data(record) {
            return;
        }
        match record.token_usage.as_mut() {
            Some(total) if total.execution_id != usage.execution_id => total.absorb(usage),
            _ => record.token_usage = Some(usage.clone()),
        }
        let total = record.token_usage.clone();
        if let Some(failure) = record.error.as_mut() {
            failure.token_usage = total;
        }
    }

    /// Attach artifacts captured by an execution
    pub fn add_output_files(&self, task_id: &TaskId, files: &[ArtifactRecord]) {
        let mut state = self.state.write();
        let Some(record) = state.active.get_mut(task_id) else {
            return;
        };
        if !Self::accepts_late_data(record) {
            return;
        }
        for file in files {
            if !record.output_files.iter().any(|f| f.id == file.id) {
                record.output_files.push(file.clone());
            }
        }
        let files = record.output_files.clone();
        if let Some(failure) = record.error.as_mut() {
            failure.output_files = files;
        }
    }

    /// Completed and failed records are frozen; stopped ones finish
    /// collecting their last execution
    fn accepts_late_data(record: &TaskRecord) -> bool {
        !record.is_terminal() || record.status == TaskStatus::Stopped
    }

    // ========================================================================
    // Finalization (terminal states are immutable once set)
    // ========================================================================

    fn finalize<F>(&self, task_id: &TaskId, next: TaskStatus, apply: F) -> Option<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        match self.transition(task_id, next, |record| {
            record.completed_at = Some(Utc::now());
            record.queue_position = None;
            apply(record);
        }) {
            Ok(record) => {
                info!(task_id = %task_id, status = %next, "Task finished");
                Some(record)
            }
            Err(e) => {
                debug!(task_id = %task_id, "Finalization skipped: {}", e);
                None
            }
        }
    }

    /// Mark completed. `None` if the task was already terminal.
    pub fn complete(&self, task_id: &TaskId, mut result: TaskResult) -> Option<TaskRecord> {
        self.finalize(task_id, TaskStatus::Completed, |record| {
            if result.token_usage.is_none() {
                result.token_usage = record.token_usage.clone();
            }
            record.current_step = record.current_step.max(result.steps_executed);
            record.output_files = result.output_files.clone();
            record.result = Some(result);
        })
    }

    /// Mark failed. `None` if the task was already terminal.
    pub fn fail(&self, task_id: &TaskId, mut failure: TaskFailure) -> Option<TaskRecord> {
        self.finalize(task_id, TaskStatus::Failed, |record| {
            if failure.token_usage.is_none() {
                failure.token_usage = record.token_usage.clone();
            }
            if failure.output_files.is_empty() {
                failure.output_files = record.output_files.clone();
            }
            warn!(task_id = %record.task_id, kind = %failure.kind, "Task failed: {}", failure.message);
            record.error = Some(failure);
        })
    }

    /// Mark stopped by the caller. `None` if the task was already terminal.
    pub fn stop(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.finalize(task_id, TaskStatus::Stopped, |record| {
            let failure = TaskFailure::from_error(&Error::UserStopped)
                .with_usage(record.token_usage.clone())
                .with_files(record.output_files.clone());
            record.error = Some(failure);
        })
    }

    // ========================================================================
    // Archival
    // ========================================================================

    /// Grace window before a terminal task moves to history
    pub fn grace_for(&self, status: TaskStatus) -> Duration {
        match status {
            TaskStatus::Failed => self.config.failure_grace(),
            _ => self.config.success_grace(),
        }
    }

    /// Move a terminal task to history after its grace window
    pub fn schedule_archive(self: &Arc<Self>, task_id: TaskId, status: TaskStatus) {
        let grace = self.grace_for(status);
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.archive(&task_id);
        });
    }

    /// Move a terminal task to history now. Returns false if it is not terminal.
    pub fn archive(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.write();
        match state.active.get(task_id) {
            Some(record) if record.is_terminal() => {}
            _ => return false,
        }
        if let Some(record) = state.active.remove(task_id) {
            Self::push_history(&mut state, record, self.config.history_limit);
            debug!(task_id = %task_id, "Archived task");
            return true;
        }
        false
    }

    fn push_history(state: &mut RegistryState, record: TaskRecord, limit: usize) {
        state.history.push_front(record);
        state.history.truncate(limit);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Active set first, then history
    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        let state = self.state.read();
        state
            .active
            .get(task_id)
            .or_else(|| state.history.iter().find(|r| &r.task_id == task_id))
            .cloned()
    }

    /// Non-terminal tasks, oldest first
    pub fn list_active(&self) -> Vec<TaskRecord> {
        let state = self.state.read();
        let mut records: Vec<TaskRecord> = state
            .active
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Terminal tasks, most recent first (including those still in grace)
    pub fn history(&self, limit: usize) -> Vec<TaskRecord> {
        let state = self.state.read();
        let mut recent: Vec<TaskRecord> = state
            .active
            .values()
            .filter(|r| r.is_terminal())
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        recent
            .into_iter()
            .chain(state.history.iter().cloned())
            .take(limit)
            .collect()
    }
}
