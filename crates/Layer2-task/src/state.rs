//! Task state machine

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task
///
/// ```text
/// queued ─► started ─► running ◄─► paused
///    │         │          │          │
///    └─────────┴──────────┴──────────┴─► completed | failed | stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a free slot
    Queued,

    /// Holds a slot, worker not spawned yet
    Started,

    /// Worker process is alive
    Running,

    /// Suspended, or terminated awaiting a restart
    Paused,

    /// Worker finished successfully
    Completed,

    /// Worker failed, crashed or timed out
    Failed,

    /// Stopped by the caller
    Stopped,
}

impl TaskStatus {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    /// Check if the task holds a concurrency slot
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            TaskStatus::Started | TaskStatus::Running | TaskStatus::Paused
        )
    }

    /// Check if a transition is allowed
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (Queued, Started) => true,
            (Started, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) | (Paused, Started) => true,
            (Running, Completed) => true,
            (_, Failed) | (_, Stopped) => true,
            _ => false,
        }
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Started => "started",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }

    /// Get a symbol for the state (for CLI output)
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "◎",
            TaskStatus::Started => "◯",
            TaskStatus::Running => "⟳",
            TaskStatus::Paused => "⏸",
            TaskStatus::Completed => "✓",
            TaskStatus::Failed => "✗",
            TaskStatus::Stopped => "⊘",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Stopped] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Running));
            assert!(!terminal.can_transition_to(TaskStatus::Stopped));
        }
    }

    #[test]
    fn test_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Started));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Stopped));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Started));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_serialization() {
        assert_eq!(serde_json::to_string(&TaskStatus::Paused).unwrap(), "\"paused\"");
        assert!(TaskStatus::Paused.holds_slot());
        assert!(!TaskStatus::Queued.holds_slot());
    }
}
