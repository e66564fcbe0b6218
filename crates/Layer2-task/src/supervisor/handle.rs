//! Live worker process handle

use super::signal;
use crate::task::{ExecutionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{mpsc, watch};
use webpilot_foundation::PauseMode;

/// How pause/resume is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseStrategy {
    /// Suspend the process and continue it later
    Suspend,
    /// Terminate on pause, spawn a fresh execution on resume
    Restart,
}

impl PauseStrategy {
    pub fn resolve(mode: PauseMode) -> Self {
        match mode {
            PauseMode::Suspend if signal::supports_suspend() => PauseStrategy::Suspend,
            PauseMode::Auto if signal::supports_suspend() => PauseStrategy::Suspend,
            _ => PauseStrategy::Restart,
        }
    }
}

/// Messages from the supervisor to the monitor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Process was suspended; freeze the timeout clock
    Suspended,
    /// Process was continued; restart the timeout clock
    Resumed,
    /// Terminate for a later restart
    Restart,
    /// Terminate on the caller's request
    Stop,
}

/// Ties one OS process to its task and execution
#[derive(Debug)]
pub struct AgentProcessHandle {
    pub task_id: TaskId,
    pub session_id: String,
    pub execution_id: ExecutionId,
    pub pid: Option<u32>,
    pub max_steps: u32,
    pub started_at: DateTime<Utc>,
    pub strategy: PauseStrategy,

    current_step: AtomicU32,
    paused: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
    exited: watch::Sender<bool>,
}

impl AgentProcessHandle {
    pub(crate) fn new(
        task_id: TaskId,
        session_id: String,
        execution_id: ExecutionId,
        pid: Option<u32>,
        max_steps: u32,
        strategy: PauseStrategy,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            task_id,
            session_id,
            execution_id,
            pid,
            max_steps,
            started_at: Utc::now(),
            strategy,
            current_step: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            control,
            exited: watch::channel(false).0,
        }
    }

    /// Step count of this execution
    pub fn current_step(&self) -> u32 {
        self.current_step.load(Ordering::SeqCst)
    }

    pub(crate) fn set_step(&self, step: u32) {
        self.current_step.fetch_max(step, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Returns false once the monitor loop is gone
    pub(crate) fn send(&self, control: Control) -> bool {
        self.control.send(control).is_ok()
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.send_replace(true);
    }

    /// True once the process is gone and its output delivered
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    pub async fn wait_exited(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_resolution() {
        assert_eq!(PauseStrategy::resolve(PauseMode::Restart), PauseStrategy::Restart);
        if signal::supports_suspend() {
            assert_eq!(PauseStrategy::resolve(PauseMode::Auto), PauseStrategy::Suspend);
            assert_eq!(PauseStrategy::resolve(PauseMode::Suspend), PauseStrategy::Suspend);
        } else {
            assert_eq!(PauseStrategy::resolve(PauseMode::Auto), PauseStrategy::Restart);
        }
    }

    #[test]
    fn test_step_never_decreases() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = AgentProcessHandle::new(
            TaskId::from("t1"),
            "s1".to_string(),
            ExecutionId::new(),
            None,
            10,
            PauseStrategy::Restart,
            tx,
        );
        handle.set_step(3);
        handle.set_step(1);
        assert_eq!(handle.current_step(), 3);
    }

    #[tokio::test]
    async fn test_wait_exited() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = std::sync::Arc::new(AgentProcessHandle::new(
            TaskId::from("t1"),
            "s1".to_string(),
            ExecutionId::new(),
            None,
            10,
            PauseStrategy::Restart,
            tx,
        ));
        assert!(!handle.has_exited());

        let waiter = {
            let handle = std::sync::Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_exited().await })
        };
        handle.mark_exited();
        waiter.await.unwrap();
        assert!(handle.has_exited());
    }
}
