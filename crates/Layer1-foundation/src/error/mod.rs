//! Error types for Webpilot
//!
//! All orchestrator errors are funnelled through one enum. Every variant maps
//! to a machine-checkable [`ErrorKind`] so terminal task states can carry both a
//! human-readable message and a stable kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Webpilot error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Admission
    // ========================================================================
    #[error("Queue full: {running} running, {queued}/{limit} queued")]
    QueueFull {
        running: usize,
        queued: usize,
        limit: usize,
    },

    // ========================================================================
    // Collaborators
    // ========================================================================
    #[error("Browser session error: {session_id} - {message}")]
    SessionCreation { session_id: String, message: String },

    #[error("Upload failed: {file} - {message}")]
    Upload { file: String, message: String },

    // ========================================================================
    // Worker process
    // ========================================================================
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker exited with code {code:?}: {stderr_tail}")]
    ProcessExit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Malformed worker result: {0}")]
    ResultParse(String),

    #[error("Worker reported failure: {0}")]
    AgentFailed(String),

    #[error("Stopped by user")]
    UserStopped,

    // ========================================================================
    // General
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ========================================================================
    // External error conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable, serializable classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QueueFull,
    SessionCreation,
    Spawn,
    ProcessExit,
    Timeout,
    ResultParse,
    AgentFailed,
    Upload,
    UserStopped,
    Config,
    NotFound,
    InvalidInput,
    InvalidState,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::SessionCreation => "session_creation",
            ErrorKind::Spawn => "spawn",
            ErrorKind::ProcessExit => "process_exit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResultParse => "result_parse",
            ErrorKind::AgentFailed => "agent_failed",
            ErrorKind::Upload => "upload",
            ErrorKind::UserStopped => "user_stopped",
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Machine-checkable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::SessionCreation { .. } => ErrorKind::SessionCreation,
            Error::Upload { .. } => ErrorKind::Upload,
            Error::Spawn(_) => ErrorKind::Spawn,
            Error::ProcessExit { .. } => ErrorKind::ProcessExit,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ResultParse(_) => ErrorKind::ResultParse,
            Error::AgentFailed(_) => ErrorKind::AgentFailed,
            Error::UserStopped => ErrorKind::UserStopped,
            Error::Config(_) => ErrorKind::Config,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether resubmitting the same task could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueueFull { .. }
                | Error::Timeout(_)
                | Error::SessionCreation { .. }
                | Error::Upload { .. }
        )
    }

    /// Session error helper
    pub fn session(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SessionCreation {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// Upload error helper
    pub fn upload(file: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Upload {
            file: file.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::QueueFull {
            running: 5,
            queued: 20,
            limit: 20,
        };
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("20/20"));

        let err = Error::ProcessExit {
            code: Some(2),
            stderr_tail: "boom".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ProcessExit);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::UserStopped).unwrap();
        assert_eq!(json, "\"user_stopped\"");
        assert_eq!(ErrorKind::ResultParse.to_string(), "result_parse");
    }
}
