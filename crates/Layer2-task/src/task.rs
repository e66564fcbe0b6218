//! Task definition and types

use crate::artifact::ArtifactRecord;
use crate::parser::TokenUsageRecord;
use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;
use webpilot_foundation::{Error, ErrorKind, WebpilotConfig};

/// Caller-supplied task identifier, stable across restarts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one spawned worker process
///
/// Regenerated on every spawn, including restarts after a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Options
// ============================================================================

/// Per-task options. Unset fields fall back to the worker config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// LLM provider for this task (e.g. "azure", "openai", "google")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl TaskOptions {
    /// Fill unset fields from the config
    pub fn resolve(&self, config: &WebpilotConfig) -> ResolvedOptions {
        ResolvedOptions {
            max_steps: self
                .max_steps
                .filter(|s| *s > 0)
                .unwrap_or(config.worker.default_max_steps),
            timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.worker.default_timeout()),
            provider: self
                .provider
                .clone()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| config.providers.default_provider.clone()),
        }
    }
}

/// Options after defaults were applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedOptions {
    pub max_steps: u32,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub provider: String,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// Task
// ============================================================================

/// A task as submitted by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,

    /// Browser session the worker attaches to
    pub session_id: String,

    /// Natural-language instruction
    pub instruction: String,

    #[serde(default)]
    pub options: TaskOptions,
}

impl Task {
    pub fn new(
        task_id: impl Into<TaskId>,
        session_id: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            instruction: instruction.into(),
            options: TaskOptions::default(),
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.options.max_steps = Some(max_steps);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.options.provider = Some(provider.into());
        self
    }

    /// Reject tasks that could never run
    pub fn validate(&self) -> webpilot_foundation::Result<()> {
        if self.task_id.as_str().trim().is_empty() {
            return Err(Error::InvalidInput("taskId must not be empty".to_string()));
        }
        if self.session_id.trim().is_empty() {
            return Err(Error::InvalidInput("sessionId must not be empty".to_string()));
        }
        if self.instruction.trim().is_empty() {
            return Err(Error::InvalidInput("instruction must not be empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of a completed task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,

    /// The worker's final answer, if any
    pub final_result: Option<String>,

    pub steps_executed: u32,

    /// False when the result was synthesized from success markers
    pub structured: bool,

    pub token_usage: Option<TokenUsageRecord>,

    pub output_files: Vec<ArtifactRecord>,

    /// Non-fatal problems (malformed result line, failed uploads)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// Structured result object as printed by the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// Why a task failed (or was stopped)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,

    pub token_usage: Option<TokenUsageRecord>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<ArtifactRecord>,
}

impl TaskFailure {
    pub fn from_error(error: &Error) -> Self {
        let (exit_code, stderr_tail) = match error {
            Error::ProcessExit { code, stderr_tail } => (*code, Some(stderr_tail.clone())),
            _ => (None, None),
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            exit_code,
            stderr_tail,
            token_usage: None,
            output_files: Vec::new(),
        }
    }

    pub fn with_usage(mut self, usage: Option<TokenUsageRecord>) -> Self {
        self.token_usage = usage;
        self
    }

    pub fn with_files(mut self, files: Vec<ArtifactRecord>) -> Self {
        self.output_files = files;
        self
    }

    /// Append the error the worker put in its own result
    pub fn with_reported_error(mut self, reported: Option<String>) -> Self {
        if let Some(reported) = reported.filter(|r| !r.trim().is_empty()) {
            self.message = format!("{} (worker reported: {})", self.message, reported.trim());
        }
        self
    }
}

// ============================================================================
// Task Record
// ============================================================================

/// Canonical state of a task, as served by status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub session_id: String,
    pub instruction: String,
    pub options: ResolvedOptions,

    pub status: TaskStatus,

    /// 0-100, derived from the step count
    pub progress: u8,

    /// Steps across every execution of this task
    pub current_step: u32,

    /// Steps accumulated by earlier executions
    #[serde(skip)]
    pub(crate) step_offset: u32,

    /// Run time of executions discarded by a pause
    #[serde(skip)]
    pub(crate) active_time: Duration,

    /// Latest execution
    pub execution_id: Option<ExecutionId>,

    /// Every execution spawned for this task, oldest first
    pub executions: Vec<ExecutionId>,

    /// 1-based position while queued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<TaskResult>,
    pub error: Option<TaskFailure>,

    /// Usage summed across executions
    pub token_usage: Option<TokenUsageRecord>,

    pub output_files: Vec<ArtifactRecord>,
}

impl TaskRecord {
    pub fn new(task: &Task, options: ResolvedOptions, status: TaskStatus) -> Self {
        Self {
            task_id: task.task_id.clone(),
            session_id: task.session_id.clone(),
            instruction: task.instruction.clone(),
            options,
            status,
            progress: 0,
            current_step: 0,
            step_offset: 0,
            active_time: Duration::ZERO,
            execution_id: None,
            executions: Vec::new(),
            queue_position: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            token_usage: None,
            output_files: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Timeout budget left for the next execution
    pub fn remaining_timeout(&self) -> Duration {
        self.options.timeout.saturating_sub(self.active_time)
    }

    /// Step count reported by the current execution
    pub fn execution_step(&self) -> u32 {
        self.current_step.saturating_sub(self.step_offset)
    }

    /// Wall-clock time since the first execution started
    pub fn duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).to_std().unwrap_or_default())
    }

    /// Error kind of a failed or stopped task
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub(crate) fn recompute_progress(&mut self) {
        self.progress = match self.status {
            TaskStatus::Completed => 100,
            s if s.is_terminal() => self.progress,
            _ => {
                let max = self.options.max_steps.max(1) as u64;
                (100 * self.current_step as u64 / max).min(99) as u8
            }
        };
    }
}
