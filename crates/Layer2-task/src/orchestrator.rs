//! Task Orchestrator - admission, execution and finalization of tasks
//!
//! Wires the concurrency queue, task registry, worker supervisor, artifact
//! tracker, log buffers and usage tracker behind one facade.
//!
//! ## Flow
//!
//! - `submit` admits (or queues) under the queue lock, then spawns the worker
//! - supervisor events are consumed by one loop, in arrival order
//! - each process exit goes through exactly one finalization path, which also
//!   frees the slot and promotes the next queued task
//!
//! ## Usage
//!
//! ```ignore
//! let orchestrator = TaskOrchestrator::new(config, sessions, store)?;
//!
//! let receipt = orchestrator
//!     .submit(Task::new("task-1", "session-1", "Open example.com and read the title"))
//!     .await?;
//!
//! let record = orchestrator
//!     .wait_for_terminal(&receipt.task_id, Duration::from_secs(600))
//!     .await?;
//! ```

use crate::artifact::{ArtifactRecord, ArtifactTracker};
use crate::log::{LogSummary, TaskLogManager};
use crate::parser::{EventKind, Extraction, OutputParser, ProgressEvent, WorkerResult};
use crate::queue::{Admission, ConcurrencyQueue, QueueStats};
use crate::registry::TaskRegistry;
use crate::state::TaskStatus;
use crate::supervisor::{ExitReason, PauseStrategy, SpawnRequest, SupervisorEvent, WorkerSupervisor};
use crate::task::{ExecutionId, Task, TaskFailure, TaskId, TaskRecord, TaskResult};
use crate::usage::{
    CostAnalysis, ExportFormat, TrendPeriod, UsageBucket, UsageEntry, UsageTotals, UsageTracker,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webpilot_foundation::{
    BrowserSessionProvider, Error, FileStore, Result, SessionOptions, WebpilotConfig,
};

/// Poll interval of `wait_for_terminal`
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Longest malformed result text quoted in a warning
const MAX_QUOTED_RESULT: usize = 200;

/// Answer to `submit`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub running_count: usize,
    pub queued_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

/// How a paused task was resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The suspended process was continued
    Continued,
    /// A new execution was spawned
    Restarted { execution_id: ExecutionId },
}

/// Task orchestrator
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: WebpilotConfig,
    queue: Mutex<ConcurrencyQueue>,
    registry: Arc<TaskRegistry>,
    supervisor: WorkerSupervisor,
    artifacts: Arc<ArtifactTracker>,
    logs: TaskLogManager,
    usage: UsageTracker,
    sessions: Arc<dyn BrowserSessionProvider>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskOrchestrator {
    /// Build the orchestrator and start its event loop. Needs a tokio runtime.
    pub fn new(
        config: WebpilotConfig,
        sessions: Arc<dyn BrowserSessionProvider>,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        config.validate()?;

        let (supervisor, events) = WorkerSupervisor::new(&config);
        let worker_dirs: Vec<PathBuf> = config
            .worker
            .working_dir
            .iter()
            .cloned()
            .chain(std::env::current_dir().ok())
            .collect();
        let artifacts = Arc::new(
            ArtifactTracker::new(config.artifacts.clone(), store).with_worker_dirs(worker_dirs),
        );
        let sweeper = artifacts.start_sweeper();

        let inner = Arc::new(Inner {
            queue: Mutex::new(ConcurrencyQueue::from_config(&config.queue)),
            registry: Arc::new(TaskRegistry::new(config.registry.clone())),
            supervisor,
            artifacts,
            logs: TaskLogManager::new().with_max_entries(config.registry.max_log_entries),
            usage: UsageTracker::new(),
            sessions,
            background: Mutex::new(Vec::new()),
            config,
        });

        let event_loop = tokio::spawn(Inner::event_loop(Arc::downgrade(&inner), events));
        inner.background.lock().extend([sweeper, event_loop]);

        info!(
            max_concurrent = inner.config.queue.max_concurrent,
            queue_limit = inner.config.queue.queue_limit,
            pause_strategy = ?inner.supervisor.strategy(),
            "Task orchestrator started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &WebpilotConfig {
        &self.inner.config
    }

    pub fn pause_strategy(&self) -> PauseStrategy {
        self.inner.supervisor.strategy()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Admit a task. Admission, session and spawn errors are returned here.
    pub async fn submit(&self, task: Task) -> Result<SubmitReceipt> {
        task.validate()?;
        let inner = &self.inner;
        let options = task.options.resolve(&inner.config);
        let task_id = task.task_id.clone();

        let admission = {
            let mut queue = inner.queue.lock();
            if inner.registry.is_live(&task_id) {
                return Err(Error::InvalidInput(format!(
                    "Task {} is already active",
                    task_id
                )));
            }
            let admission = queue.admit(&task)?;
            let status = match admission {
                Admission::Start => TaskStatus::Started,
                Admission::Queued { .. } => TaskStatus::Queued,
            };
            // cannot collide: liveness was checked under the same guard
            inner.registry.register(&task, options, status)?;
            admission
        };

        inner.logs.create_buffer(&task_id).await;

        match admission {
            Admission::Queued { position } => {
                info!(task_id = %task_id, position, "Task queued");
                inner
                    .note(
                        &task_id,
                        &task.session_id,
                        EventKind::Info,
                        format!("Queued at position {}", position),
                        None,
                    )
                    .await;
                Ok(self.receipt(&task_id, TaskStatus::Queued, None))
            }
            Admission::Start => match inner.launch(&task_id).await {
                Ok(execution_id) => {
                    let status = inner
                        .registry
                        .get(&task_id)
                        .map_or(TaskStatus::Running, |r| r.status);
                    Ok(self.receipt(&task_id, status, execution_id))
                }
                Err(e) => {
                    inner.fail_launch(&task_id, &e).await;
                    Err(e)
                }
            },
        }
    }

    fn receipt(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        execution_id: Option<ExecutionId>,
    ) -> SubmitReceipt {
        let queue = self.inner.queue.lock();
        SubmitReceipt {
            task_id: task_id.clone(),
            status,
            running_count: queue.running_count(),
            queued_count: queue.queued_count(),
            queue_position: queue.position(task_id),
            execution_id,
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Stop a task. Returns false if it was already terminal.
    pub async fn stop(&self, task_id: &TaskId) -> Result<bool> {
        enum Action {
            Dequeued,
            Signal,
            Release,
        }

        let inner = &self.inner;
        let (action, record) = {
            let mut queue = inner.queue.lock();
            let record = inner
                .registry
                .get(task_id)
                .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;
            if record.is_terminal() {
                return Ok(false);
            }

            let action = if queue.cancel_queued(task_id).is_some() {
                Action::Dequeued
            } else if inner.supervisor.handle(task_id).is_some() {
                Action::Signal
            } else {
                Action::Release
            };
            let Some(record) = inner.registry.stop(task_id) else {
                return Ok(false);
            };
            (action, record)
        };

        info!(task_id = %task_id, "Task stopped by user");
        inner
            .note(task_id, &record.session_id, EventKind::Warning, "Stopped by user", record.execution_id)
            .await;
        inner.registry.schedule_archive(task_id.clone(), TaskStatus::Stopped);

        match action {
            Action::Signal => {
                // the slot frees when the process is gone
                if !inner.supervisor.stop(task_id) {
                    debug!(task_id = %task_id, "Process already exiting");
                }
            }
            Action::Release => {
                inner.logs.mark_ended(task_id).await;
                inner.release_slot(task_id);
            }
            Action::Dequeued => {
                inner.logs.mark_ended(task_id).await;
            }
        }
        Ok(true)
    }

    /// Pause a running task
    pub async fn pause(&self, task_id: &TaskId) -> Result<PauseStrategy> {
        let inner = &self.inner;
        let record = inner
            .registry
            .get(task_id)
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;
        if record.status != TaskStatus::Running {
            return Err(Error::InvalidState(format!(
                "Task {} is {}, only running tasks can be paused",
                task_id, record.status
            )));
        }

        let run_time = inner
            .supervisor
            .handle(task_id)
            .and_then(|handle| handle.elapsed().to_std().ok())
            .unwrap_or_default();
        let strategy = inner.supervisor.pause(task_id)?;
        // a suspended worker keeps its own frozen deadline
        let consumed = match strategy {
            PauseStrategy::Restart => run_time,
            PauseStrategy::Suspend => Duration::ZERO,
        };
        inner.registry.mark_paused(task_id, consumed)?;
        info!(task_id = %task_id, strategy = ?strategy, "Task paused");
        inner
            .note(
                task_id,
                &record.session_id,
                EventKind::Info,
                format!("Paused at step {}", record.current_step),
                record.execution_id,
            )
            .await;
        Ok(strategy)
    }

    /// Resume a paused task
    ///
    /// A suspended process is continued. Otherwise a new execution is spawned
    /// on the same (re-verified) browser session, keeping the task id and the
    /// step count reached so far.
    pub async fn resume(&self, task_id: &TaskId) -> Result<ResumeOutcome> {
        let inner = &self.inner;
        let record = inner
            .registry
            .get(task_id)
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;
        if record.status != TaskStatus::Paused {
            return Err(Error::InvalidState(format!(
                "Task {} is {}, only paused tasks can be resumed",
                task_id, record.status
            )));
        }

        if let Some(handle) = inner.supervisor.handle(task_id) {
            if handle.strategy == PauseStrategy::Suspend && handle.is_paused() {
                inner.supervisor.resume(task_id)?;
                inner.registry.mark_resumed(task_id)?;
                info!(task_id = %task_id, "Task resumed");
                inner
                    .note(task_id, &record.session_id, EventKind::Info, "Resumed", record.execution_id)
                    .await;
                return Ok(ResumeOutcome::Continued);
            }

            // previous execution is still shutting down
            let wait = inner.config.worker.kill_grace()
                + inner.config.worker.reader_drain()
                + Duration::from_secs(5);
            if tokio::time::timeout(wait, handle.wait_exited()).await.is_err() {
                return Err(Error::InvalidState(format!(
                    "Task {} is still shutting down its previous execution",
                    task_id
                )));
            }
        }

        {
            let _queue = inner.queue.lock();
            inner.registry.mark_restarting(task_id)?;
        }
        inner
            .note(
                task_id,
                &record.session_id,
                EventKind::Info,
                format!(
                    "Restarting from step {} with {} ms of the timeout left",
                    record.current_step,
                    record.remaining_timeout().as_millis()
                ),
                record.execution_id,
            )
            .await;

        match inner.launch(task_id).await {
            Ok(Some(execution_id)) => {
                info!(task_id = %task_id, execution_id = %execution_id, "Task restarted");
                Ok(ResumeOutcome::Restarted { execution_id })
            }
            Ok(None) => Err(Error::InvalidState(format!(
                "Task {} was stopped before it restarted",
                task_id
            ))),
            Err(e) => {
                inner.fail_launch(task_id, &e).await;
                Err(e)
            }
        }
    }

    /// Stop every task and clear the queue, then wait for processes to exit
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let inner = &self.inner;
        let queued: Vec<TaskId> = {
            let mut queue = inner.queue.lock();
            queue
                .drain_queued()
                .into_iter()
                .map(|entry| entry.task.task_id)
                .collect()
        };
        for task_id in &queued {
            if inner.registry.stop(task_id).is_some() {
                inner.logs.mark_ended(task_id).await;
            }
        }

        let mut stopped = queued.len();
        for record in inner.registry.list_active() {
            if let Ok(true) = self.stop(&record.task_id).await {
                stopped += 1;
            }
        }

        let strays = inner.supervisor.stop_all();
        debug!(signalled = strays, "Stop sent to every live worker");

        let deadline = tokio::time::Instant::now() + timeout;
        while inner.supervisor.running_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(WAIT_POLL).await;
        }
        if inner.supervisor.running_count() > 0 {
            warn!(
                remaining = inner.supervisor.running_count(),
                "Workers still running after shutdown timeout"
            );
        }
        info!(stopped, "Task orchestrator shut down");
        stopped
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Active set first, then history. Queued tasks carry their position.
    pub fn get_status(&self, task_id: &TaskId) -> Option<TaskRecord> {
        let mut record = self.inner.registry.get(task_id)?;
        if record.status == TaskStatus::Queued {
            record.queue_position = self.inner.queue.lock().position(task_id);
        }
        Some(record)
    }

    /// Queued, running and paused tasks, oldest first
    pub fn list_active(&self) -> Vec<TaskRecord> {
        let records = self.inner.registry.list_active();
        let queue = self.inner.queue.lock();
        records
            .into_iter()
            .map(|mut record| {
                record.queue_position = queue.position(&record.task_id);
                record
            })
            .collect()
    }

    /// Finished tasks, most recent first
    pub fn get_history(&self, limit: usize) -> Vec<TaskRecord> {
        self.inner.registry.history(limit)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.lock().stats()
    }

    /// Poll until the task is terminal
    pub async fn wait_for_terminal(&self, task_id: &TaskId, timeout: Duration) -> Result<TaskRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self
                .get_status(task_id)
                .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;
            if record.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "Task {} still {} after {:?}",
                    task_id, record.status, timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    // ========================================================================
    // Logs
    // ========================================================================

    /// Progress events of a task (`tail` = last N, `None` = all kept)
    pub async fn get_logs(&self, task_id: &TaskId, tail: Option<usize>) -> Option<Vec<ProgressEvent>> {
        self.inner.logs.tail(task_id, tail).await
    }

    pub async fn get_errors(&self, task_id: &TaskId) -> Vec<ProgressEvent> {
        self.inner.logs.errors(task_id).await
    }

    pub async fn log_summary(&self, task_id: &TaskId) -> Option<LogSummary> {
        self.inner.logs.summary(task_id).await
    }

    /// Live progress events of a task
    pub async fn subscribe_logs(&self, task_id: &TaskId) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.inner.logs.subscribe(task_id).await
    }

    // ========================================================================
    // Usage & artifacts
    // ========================================================================

    pub fn token_usage_by_execution(&self, execution_id: ExecutionId) -> Option<UsageEntry> {
        self.inner.usage.by_execution(execution_id)
    }

    pub fn token_usage_summary(&self) -> UsageTotals {
        self.inner.usage.summary()
    }

    pub fn token_usage_by_model(&self) -> BTreeMap<String, UsageTotals> {
        self.inner.usage.by_model()
    }

    pub fn token_usage_by_session(&self, session_id: &str) -> UsageTotals {
        self.inner.usage.by_session(session_id)
    }

    pub fn cost_analysis(&self) -> CostAnalysis {
        self.inner.usage.cost_analysis()
    }

    pub fn usage_trends(&self, period: TrendPeriod) -> Vec<UsageBucket> {
        self.inner.usage.trends(period)
    }

    pub fn export_usage(&self, format: ExportFormat) -> Result<String> {
        self.inner.usage.export(format)
    }

    pub fn get_artifacts(&self, execution_id: ExecutionId, session_id: &str) -> Vec<ArtifactRecord> {
        self.inner.artifacts.get_artifacts(execution_id, session_id)
    }
}

impl Drop for TaskOrchestrator {
    fn drop(&mut self) {
        // workers are killed on drop of their Child; background loops end here
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

impl Inner {
    /// Spawn an execution for a task in `started`
    ///
    /// `Ok(None)` when the task was stopped before the process started.
    async fn launch(&self, task_id: &TaskId) -> Result<Option<ExecutionId>> {
        let record = self
            .registry
            .get(task_id)
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;
        if record.status != TaskStatus::Started {
            return Ok(None);
        }

        // restarts only get what earlier executions left of the budget
        let timeout = record.remaining_timeout();
        if timeout.is_zero() {
            return Err(Error::Timeout(format!(
                "worker used its {} ms budget before the restart",
                record.options.timeout.as_millis()
            )));
        }

        let options = SessionOptions {
            headless: self.config.worker.headless,
            width: self.config.worker.window_width,
            height: self.config.worker.window_height,
        };
        let session = self
            .sessions
            .get_or_create(&record.session_id, options)
            .await
            .map_err(|e| match e {
                Error::SessionCreation { .. } => e,
                other => Error::session(&record.session_id, other.to_string()),
            })?;
        if !session.alive {
            return Err(Error::session(&record.session_id, "session is not alive"));
        }

        let request = SpawnRequest {
            task_id: task_id.clone(),
            session_id: record.session_id.clone(),
            instruction: record.instruction.clone(),
            max_steps: record.options.max_steps,
            timeout,
            provider: record.options.provider.clone(),
            ws_endpoint: session.ws_endpoint.clone(),
        };

        let handle = {
            let _queue = self.queue.lock();
            // a stop may have landed while the session was prepared
            match self.registry.get(task_id) {
                Some(current) if current.status == TaskStatus::Started => {}
                _ => return Ok(None),
            }
            let handle = self.supervisor.spawn(request)?;
            self.registry.mark_running(task_id, handle.execution_id)?;
            handle
        };

        self.note(
            task_id,
            &record.session_id,
            EventKind::Info,
            format!(
                "Worker started (execution {}, pid {})",
                handle.execution_id.short(),
                handle.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
            ),
            Some(handle.execution_id),
        )
        .await;
        Ok(Some(handle.execution_id))
    }

    /// Record a failure that happened before the worker ran
    async fn fail_launch(self: &Arc<Self>, task_id: &TaskId, error: &Error) {
        warn!(task_id = %task_id, "Failed to start task: {}", error);
        if let Some(record) = self.registry.fail(task_id, TaskFailure::from_error(error)) {
            self.note(task_id, &record.session_id, EventKind::Error, error.to_string(), None)
                .await;
            self.registry.schedule_archive(task_id.clone(), record.status);
        }
        self.logs.mark_ended(task_id).await;
        self.release_slot(task_id);
    }

    /// Free a slot and start the next queued task, if any
    fn release_slot(self: &Arc<Self>, task_id: &TaskId) {
        let promoted = {
            let mut queue = self.queue.lock();
            let entry = queue.release(task_id);
            if let Some(entry) = &entry {
                if let Err(e) = self.registry.mark_started(&entry.task.task_id) {
                    warn!(task_id = %entry.task.task_id, "Promotion rejected: {}", e);
                }
            }
            entry
        };

        if let Some(entry) = promoted {
            let waited = Utc::now() - entry.enqueued_at;
            info!(
                task_id = %entry.task.task_id,
                waited_ms = waited.num_milliseconds(),
                "Promoted queued task"
            );
            tokio::spawn(Arc::clone(self).run_promoted(entry.task));
        }
    }

    async fn run_promoted(self: Arc<Self>, task: Task) {
        self.note(
            &task.task_id,
            &task.session_id,
            EventKind::Info,
            "Promoted from queue",
            None,
        )
        .await;
        if let Err(e) = self.launch(&task.task_id).await {
            self.fail_launch(&task.task_id, &e).await;
        }
    }

    /// Orchestrator-originated log line
    async fn note(
        &self,
        task_id: &TaskId,
        session_id: &str,
        kind: EventKind,
        message: impl Into<String>,
        execution_id: Option<ExecutionId>,
    ) {
        let message = message.into();
        let mut event = ProgressEvent::system(kind, task_id.clone(), session_id, message.clone())
            .with_payload(json!({ "message": message }));
        if let Some(execution_id) = execution_id {
            event = event.with_execution(execution_id);
        }
        self.logs.push(task_id, event).await;
    }

    // ========================================================================
    // Supervisor events
    // ========================================================================

    async fn event_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match event {
                SupervisorEvent::Output {
                    task_id,
                    execution_id,
                    session_id,
                    step,
                    output,
                } => {
                    inner.registry.update_step(&task_id, execution_id, step);
                    for hint in output.hints {
                        debug!(task_id = %task_id, file = %hint.file_name, "File hint");
                        inner.artifacts.track_creation(hint, execution_id, &session_id);
                    }
                    inner.logs.append(&task_id, output.events).await;
                }
                SupervisorEvent::Exited {
                    task_id,
                    execution_id,
                    session_id,
                    code,
                    reason,
                    parser,
                } => {
                    tokio::spawn(inner.finalize(task_id, execution_id, session_id, code, reason, parser));
                }
            }
        }
        debug!("Supervisor event loop ended");
    }

    /// The single finalization path of an execution
    async fn finalize(
        self: Arc<Self>,
        task_id: TaskId,
        execution_id: ExecutionId,
        session_id: String,
        code: Option<i32>,
        reason: ExitReason,
        parser: Box<OutputParser>,
    ) {
        // outputFiles must be complete before the result is assembled
        self.artifacts.await_pending(execution_id).await;
        let files = self.artifacts.get_artifacts(execution_id, &session_id);
        self.registry.add_output_files(&task_id, &files);

        let extraction = parser.extract_result();
        let structured = match &extraction {
            Extraction::Found(value) => Some(value.clone()),
            _ => None,
        };

        let Some(record) = self.registry.get(&task_id) else {
            warn!(task_id = %task_id, "Exit for unknown task");
            return;
        };

        if let Some(usage) = parser.token_usage(structured.as_ref()) {
            self.registry.record_usage(&task_id, &usage);
            self.usage.record(UsageEntry {
                task_id: task_id.clone(),
                session_id: session_id.clone(),
                provider: record.options.provider.clone(),
                usage,
                recorded_at: Utc::now(),
            });
        }

        // a pause-induced exit is never a failure; resume starts a new execution
        if reason == ExitReason::Paused && !record.is_terminal() {
            self.note(
                &task_id,
                &session_id,
                EventKind::Info,
                "Worker terminated for pause",
                Some(execution_id),
            )
            .await;
            return;
        }

        if reason == ExitReason::Finished && record.status == TaskStatus::Paused {
            // the worker finished before the pause reached it
            if let Err(e) = self.registry.mark_resumed(&task_id) {
                debug!(task_id = %task_id, "{}", e);
            }
        }

        let finished = match reason {
            ExitReason::Stopped | ExitReason::Paused => self.registry.stop(&task_id),
            ExitReason::Timeout => {
                let error = Error::Timeout(format!(
                    "worker exceeded {} ms",
                    record.options.timeout.as_millis()
                ));
                self.registry
                    .fail(&task_id, TaskFailure::from_error(&error))
            }
            ExitReason::Finished if code == Some(0) => {
                self.complete(&task_id, &record, &parser, extraction)
            }
            ExitReason::Finished => {
                let error = Error::ProcessExit {
                    code,
                    stderr_tail: parser.stderr_tail(),
                };
                let reported = structured.map(WorkerResult::from_value).and_then(|r| r.error);
                self.registry.fail(
                    &task_id,
                    TaskFailure::from_error(&error)
                        .with_files(self.files_of(&task_id))
                        .with_reported_error(reported),
                )
            }
        };

        if let Some(finished) = finished {
            let (kind, message) = match (&finished.result, &finished.error) {
                (Some(result), _) => (
                    EventKind::Success,
                    format!(
                        "Task completed: {}",
                        result.final_result.as_deref().unwrap_or("(no result text)")
                    ),
                ),
                (None, Some(error)) => (EventKind::Error, format!("Task {}: {}", finished.status, error.message)),
                (None, None) => (EventKind::Info, format!("Task {}", finished.status)),
            };
            self.note(&task_id, &session_id, kind, message, Some(execution_id))
                .await;
            self.registry
                .schedule_archive(task_id.clone(), finished.status);
        }

        self.logs.mark_ended(&task_id).await;
        self.release_slot(&task_id);
    }

    fn files_of(&self, task_id: &TaskId) -> Vec<ArtifactRecord> {
        self.registry
            .get(task_id)
            .map(|r| r.output_files)
            .unwrap_or_default()
    }

    /// Clean exit: structured result if present, heuristic success otherwise
    fn complete(
        &self,
        task_id: &TaskId,
        record: &TaskRecord,
        parser: &OutputParser,
        extraction: Extraction,
    ) -> Option<TaskRecord> {
        let files = self.files_of(task_id);
        let mut warnings: Vec<String> = files
            .iter()
            .filter_map(|f| {
                f.error
                    .as_ref()
                    .map(|e| format!("{} was not uploaded: {}", f.file_name, e))
            })
            .collect();

        let mut worker_steps = parser.current_step();
        let mut final_result = None;
        let mut raw = None;
        let structured = matches!(extraction, Extraction::Found(_));

        match extraction {
            Extraction::Found(value) => {
                let result = WorkerResult::from_value(value);
                if !result.success {
                    let message = result
                        .error
                        .clone()
                        .or(result.final_result.clone())
                        .unwrap_or_else(|| "worker reported failure".to_string());
                    return self.registry.fail(
                        task_id,
                        TaskFailure::from_error(&Error::AgentFailed(message)).with_files(files),
                    );
                }
                worker_steps = result.steps_executed.unwrap_or(worker_steps);
                final_result = result.final_result.clone();
                raw = Some(result.raw);
            }
            Extraction::Malformed(text) => {
                let quoted: String = text.chars().take(MAX_QUOTED_RESULT).collect();
                warnings.push(Error::ResultParse(quoted).to_string());
            }
            Extraction::Missing => {}
        }

        let result = TaskResult {
            success: true,
            final_result: final_result.or_else(|| parser.heuristic_final_result()),
            steps_executed: record
                .current_step
                .max(record.step_offset.saturating_add(worker_steps)),
            structured,
            token_usage: None,
            output_files: files,
            warnings,
            raw,
        };
        self.registry.complete(task_id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::LocalFileStore;
    use crate::session::StaticSessionProvider;
    use webpilot_foundation::ErrorKind;

    fn orchestrator(max_concurrent: usize, queue_limit: usize, store: &std::path::Path) -> TaskOrchestrator {
        let mut config = WebpilotConfig::default();
        config.queue.max_concurrent = max_concurrent;
        config.queue.queue_limit = queue_limit;
        config.worker.program = PathBuf::from("webpilot-missing-worker");
        TaskOrchestrator::new(
            config,
            Arc::new(StaticSessionProvider::new()),
            Arc::new(LocalFileStore::new(store)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(2, 2, dir.path());
        let err = orchestrator
            .submit(Task::new("t1", "s1", "do it"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Spawn);

        let record = orchestrator.get_status(&TaskId::from("t1")).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error_kind(), Some(ErrorKind::Spawn));
        assert_eq!(orchestrator.queue_stats().running, 0);
    }

    #[tokio::test]
    async fn test_invalid_task_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(1, 1, dir.path());
        let err = orchestrator.submit(Task::new("t1", "", "x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(orchestrator.get_status(&TaskId::from("t1")).is_none());
    }

    #[tokio::test]
    async fn test_unknown_task_operations() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(1, 1, dir.path());
        let id = TaskId::from("nope");
        assert_eq!(orchestrator.stop(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(orchestrator.pause(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(orchestrator.resume(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(orchestrator.get_status(&id).is_none());
        assert!(orchestrator.get_logs(&id, None).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_with_spent_budget_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = WebpilotConfig::default();
        config.worker.program = PathBuf::from("sh");
        config.worker.script_args =
            vec!["-c".to_string(), "exec sleep 30".to_string(), "worker".to_string()];
        config.worker.pause_mode = webpilot_foundation::PauseMode::Restart;
        config.worker.kill_grace_secs = 1;
        config.artifacts.downloads_dir = Some(dir.path().join("downloads"));
        let orchestrator = TaskOrchestrator::new(
            config,
            Arc::new(StaticSessionProvider::new()),
            Arc::new(LocalFileStore::new(dir.path().join("store"))),
        )
        .unwrap();

        let id = TaskId::from("t1");
        orchestrator
            .submit(Task::new("t1", "s1", "x").with_timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(orchestrator.pause(&id).await.unwrap(), PauseStrategy::Restart);

        // charge more run time than the task was given
        let registry = &orchestrator.inner.registry;
        registry.mark_resumed(&id).unwrap();
        registry.mark_paused(&id, Duration::from_secs(2)).unwrap();

        let err = orchestrator.resume(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let record = orchestrator.get_status(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(record.executions.len(), 1);
        assert_eq!(orchestrator.queue_stats().running, 0);
    }
}
