//! Progress events produced from worker output

use crate::task::{ExecutionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classified type of an output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Step,
    Action,
    Goal,
    Success,
    Warning,
    Navigation,
    Info,
    Error,
    TokenUsage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Step => "step",
            EventKind::Action => "action",
            EventKind::Goal => "goal",
            EventKind::Success => "success",
            EventKind::Warning => "warning",
            EventKind::Navigation => "navigation",
            EventKind::Info => "info",
            EventKind::Error => "error",
            EventKind::TokenUsage => "token_usage",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EventKind::Error)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Emitted by the orchestrator itself (start, exit, pause, ...)
    System,
}

/// One classified line of worker output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: TaskId,
    pub session_id: String,
    pub execution_id: Option<ExecutionId>,
    pub timestamp: DateTime<Utc>,
    pub stream: StreamKind,

    /// Structured fields extracted from the line
    pub payload: serde_json::Value,

    /// Line as printed by the worker, ANSI codes stripped
    pub raw: String,

    /// Position in the task log (assigned by the log buffer)
    pub line_number: usize,
}

impl ProgressEvent {
    pub fn new(
        kind: EventKind,
        task_id: TaskId,
        session_id: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            task_id,
            session_id: session_id.into(),
            execution_id: None,
            timestamp: Utc::now(),
            stream: StreamKind::Stdout,
            payload: serde_json::Value::Null,
            raw: raw.into(),
            line_number: 0,
        }
    }

    /// Orchestrator lifecycle message
    pub fn system(
        kind: EventKind,
        task_id: TaskId,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(kind, task_id, session_id, message).with_stream(StreamKind::System)
    }

    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_stream(mut self, stream: StreamKind) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Line tagged with task and session, for shared log sinks
    pub fn annotated(&self) -> String {
        format!(
            "[{}][{}] {}: {}",
            self.task_id, self.session_id, self.kind, self.raw
        )
    }

    /// Format with timestamp and line number
    pub fn format_line(&self) -> String {
        format!(
            "[{}] [{}] L{}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.kind,
            self.line_number,
            self.raw
        )
    }
}
