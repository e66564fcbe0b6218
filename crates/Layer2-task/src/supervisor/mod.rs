//! Worker Process Supervisor
//!
//! One external process per execution. A monitor task owns the child, reads
//! both pipes, enforces the wall-clock timeout and escalates termination from
//! a graceful signal to a forced kill. Everything it observes is reported as
//! [`SupervisorEvent`]s on one channel, so output of an execution is always
//! delivered before its exit.
//!
//! - `command.rs`: command line and environment
//! - `handle.rs`: AgentProcessHandle, PauseStrategy
//! - `signal.rs`: Unix signals

mod command;
mod handle;
mod signal;

pub use command::{SpawnRequest, WorkerCommand};
pub use handle::{AgentProcessHandle, PauseStrategy};
pub use signal::{supports_suspend, Signal};

use crate::parser::{OutputParser, ParseOutput, StreamKind};
use crate::task::{ExecutionId, TaskId};
use handle::Control;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webpilot_foundation::{Error, ProvidersConfig, Result, WebpilotConfig, WorkerConfig};

/// Bytes per pipe read
const READ_CHUNK: usize = 8 * 1024;

/// Why a monitored process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited on its own
    Finished,
    /// Terminated after the wall-clock budget ran out
    Timeout,
    /// Terminated on the caller's request
    Stopped,
    /// Terminated by a restart-strategy pause
    Paused,
}

/// What the supervisor reports to the orchestrator
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Parsed output of one chunk
    Output {
        task_id: TaskId,
        execution_id: ExecutionId,
        session_id: String,
        /// Step count of this execution after the chunk
        step: u32,
        output: ParseOutput,
    },
    /// The process is gone and its pipes are drained
    Exited {
        task_id: TaskId,
        execution_id: ExecutionId,
        session_id: String,
        code: Option<i32>,
        reason: ExitReason,
        /// Parser state, for result and usage extraction
        parser: Box<OutputParser>,
    },
}

/// Spawns and controls worker processes
pub struct WorkerSupervisor {
    config: WorkerConfig,
    providers: ProvidersConfig,
    strategy: PauseStrategy,
    processes: Arc<Mutex<HashMap<TaskId, Arc<AgentProcessHandle>>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl WorkerSupervisor {
    pub fn new(config: &WebpilotConfig) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            config: config.worker.clone(),
            providers: config.providers.clone(),
            strategy: PauseStrategy::resolve(config.worker.pause_mode),
            processes: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (supervisor, rx)
    }

    pub fn strategy(&self) -> PauseStrategy {
        self.strategy
    }

    pub fn handle(&self, task_id: &TaskId) -> Option<Arc<AgentProcessHandle>> {
        self.processes.lock().get(task_id).cloned()
    }

    pub fn running_count(&self) -> usize {
        self.processes.lock().len()
    }

    // ========================================================================
    // Spawn
    // ========================================================================

    /// Start one execution. Fails synchronously when the process cannot start.
    pub fn spawn(&self, request: SpawnRequest) -> Result<Arc<AgentProcessHandle>> {
        if self.processes.lock().contains_key(&request.task_id) {
            return Err(Error::InvalidState(format!(
                "Task {} already has a running process",
                request.task_id
            )));
        }

        let execution_id = ExecutionId::new();
        let command = WorkerCommand::build(&self.config, &self.providers, &request, execution_id)?;
        info!(
            task_id = %request.task_id,
            execution_id = %execution_id,
            session_id = %request.session_id,
            "Spawning worker: {}",
            command.display()
        );

        let mut child = command
            .to_command(self.config.kill_process_group)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", command.program.display(), e)))?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(AgentProcessHandle::new(
            request.task_id.clone(),
            request.session_id.clone(),
            execution_id,
            child.id(),
            request.max_steps,
            self.strategy,
            control_tx,
        ));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.processes
            .lock()
            .insert(request.task_id.clone(), Arc::clone(&handle));

        let monitor = Monitor {
            handle: Arc::clone(&handle),
            parser: OutputParser::new(request.task_id.clone(), request.session_id.clone(), execution_id),
            events: self.events.clone(),
            processes: Arc::clone(&self.processes),
            timeout: request.timeout,
            kill_grace: self.config.kill_grace(),
            reader_drain: self.config.reader_drain(),
            group: self.config.kill_process_group,
        };
        tokio::spawn(monitor.run(child, stdout, stderr, control_rx));

        Ok(handle)
    }

    // ========================================================================
    // Control
    // ========================================================================

    fn live_handle(&self, task_id: &TaskId) -> Result<Arc<AgentProcessHandle>> {
        self.handle(task_id)
            .ok_or_else(|| Error::NotFound(format!("No running process for task {}", task_id)))
    }

    /// Pause a running process with the configured strategy
    pub fn pause(&self, task_id: &TaskId) -> Result<PauseStrategy> {
        let handle = self.live_handle(task_id)?;
        if handle.is_paused() {
            return Err(Error::InvalidState(format!("Task {} is already paused", task_id)));
        }

        match handle.strategy {
            PauseStrategy::Suspend => {
                let pid = handle
                    .pid
                    .ok_or_else(|| Error::InvalidState("process has no pid".to_string()))?;
                signal::send(pid, Signal::Suspend, self.config.kill_process_group)?;
                handle.set_paused(true);
                handle.send(Control::Suspended);
                info!(task_id = %task_id, pid, "Worker suspended");
            }
            PauseStrategy::Restart => {
                handle.set_paused(true);
                if !handle.send(Control::Restart) {
                    return Err(Error::InvalidState(format!("Task {} is exiting", task_id)));
                }
                info!(task_id = %task_id, "Worker terminating for restart");
            }
        }
        Ok(handle.strategy)
    }

    /// Continue a suspended process
    pub fn resume(&self, task_id: &TaskId) -> Result<()> {
        let handle = self.live_handle(task_id)?;
        if !handle.is_paused() || handle.strategy != PauseStrategy::Suspend {
            return Err(Error::InvalidState(format!("Task {} is not suspended", task_id)));
        }
        let pid = handle
            .pid
            .ok_or_else(|| Error::InvalidState("process has no pid".to_string()))?;
        signal::send(pid, Signal::Continue, self.config.kill_process_group)?;
        handle.set_paused(false);
        handle.send(Control::Resumed);
        info!(task_id = %task_id, pid, "Worker continued");
        Ok(())
    }

    /// Terminate a process. Returns false if the task has none.
    pub fn stop(&self, task_id: &TaskId) -> bool {
        match self.handle(task_id) {
            Some(handle) => {
                info!(task_id = %task_id, "Stopping worker");
                handle.send(Control::Stop)
            }
            None => false,
        }
    }

    /// Stop every process, including ones whose task already left the
    /// active set
    pub fn stop_all(&self) -> usize {
        let handles: Vec<_> = self.processes.lock().values().cloned().collect();
        handles
            .iter()
            .filter(|handle| handle.send(Control::Stop))
            .count()
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Owns one child process until it is gone
struct Monitor {
    handle: Arc<AgentProcessHandle>,
    parser: OutputParser,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    processes: Arc<Mutex<HashMap<TaskId, Arc<AgentProcessHandle>>>>,
    timeout: Duration,
    kill_grace: Duration,
    reader_drain: Duration,
    group: bool,
}

type Chunk = (StreamKind, Vec<u8>);

fn spawn_reader<R>(reader: Option<R>, stream: StreamKind, tx: mpsc::Sender<Chunk>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return;
    };
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Pipe read error: {}", e);
                    break;
                }
            }
        }
    });
}

impl Monitor {
    async fn run<O, E>(
        mut self,
        mut child: Child,
        stdout: Option<O>,
        stderr: Option<E>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Chunk>(64);
        spawn_reader(stdout, StreamKind::Stdout, chunk_tx.clone());
        spawn_reader(stderr, StreamKind::Stderr, chunk_tx);

        let mut deadline = Instant::now() + self.timeout;
        // remaining budget while suspended
        let mut frozen: Option<Duration> = None;
        let mut kill_at: Option<Instant> = None;
        let mut reason = ExitReason::Finished;
        let mut streams_open = true;

        let code = loop {
            let timer_armed = reason == ExitReason::Finished && frozen.is_none();
            let kill_deadline = kill_at.unwrap_or(deadline);

            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!(task_id = %self.handle.task_id, "Failed to wait for worker: {}", e);
                            None
                        }
                    };
                }
                chunk = chunk_rx.recv(), if streams_open => match chunk {
                    Some((stream, bytes)) => {
                        let output = self.parser.consume(stream, &bytes);
                        self.emit(output);
                    }
                    None => streams_open = false,
                },
                Some(control) = control_rx.recv() => match control {
                    Control::Suspended => {
                        frozen = Some(deadline.saturating_duration_since(Instant::now()));
                    }
                    Control::Resumed => {
                        if let Some(remaining) = frozen.take() {
                            deadline = Instant::now() + remaining;
                        }
                    }
                    Control::Restart => {
                        if reason == ExitReason::Finished {
                            reason = ExitReason::Paused;
                            self.terminate(&mut child);
                            kill_at = Some(Instant::now() + self.kill_grace);
                        }
                    }
                    Control::Stop => {
                        if matches!(reason, ExitReason::Finished | ExitReason::Paused) {
                            reason = ExitReason::Stopped;
                            self.terminate(&mut child);
                            kill_at.get_or_insert(Instant::now() + self.kill_grace);
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline), if timer_armed => {
                    warn!(
                        task_id = %self.handle.task_id,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Worker timed out"
                    );
                    reason = ExitReason::Timeout;
                    self.terminate(&mut child);
                    kill_at = Some(Instant::now() + self.kill_grace);
                }
                _ = tokio::time::sleep_until(kill_deadline), if kill_at.is_some() => {
                    warn!(task_id = %self.handle.task_id, "Grace period expired, killing worker");
                    self.force_kill(&mut child);
                    kill_at = None;
                }
            }
        };

        // output written just before exit is still in the pipes
        if streams_open {
            let reader_drain = self.reader_drain;
            let drain = async {
                while let Some((stream, bytes)) = chunk_rx.recv().await {
                    let output = self.parser.consume(stream, &bytes);
                    self.emit(output);
                }
            };
            if tokio::time::timeout(reader_drain, drain).await.is_err() {
                debug!(task_id = %self.handle.task_id, "Pipe drain timed out");
            }
        }
        let output = self.parser.finish();
        self.emit(output);

        info!(
            task_id = %self.handle.task_id,
            execution_id = %self.handle.execution_id,
            code = ?code,
            reason = ?reason,
            "Worker exited"
        );

        {
            let mut processes = self.processes.lock();
            let is_current = processes
                .get(&self.handle.task_id)
                .map_or(false, |h| h.execution_id == self.handle.execution_id);
            if is_current {
                processes.remove(&self.handle.task_id);
            }
        }
        self.handle.mark_exited();

        let _ = self.events.send(SupervisorEvent::Exited {
            task_id: self.handle.task_id.clone(),
            execution_id: self.handle.execution_id,
            session_id: self.handle.session_id.clone(),
            code,
            reason,
            parser: Box::new(self.parser),
        });
    }

    fn emit(&self, output: ParseOutput) {
        self.handle.set_step(self.parser.current_step());
        if output.is_empty() {
            return;
        }
        let _ = self.events.send(SupervisorEvent::Output {
            task_id: self.handle.task_id.clone(),
            execution_id: self.handle.execution_id,
            session_id: self.handle.session_id.clone(),
            step: self.parser.current_step(),
            output,
        });
    }

    /// Graceful termination; a suspended process is continued so it can act on it
    fn terminate(&self, child: &mut Child) {
        if let Some(pid) = self.handle.pid {
            if signal::send(pid, Signal::Terminate, self.group).is_ok() {
                if self.handle.is_paused() && self.handle.strategy == PauseStrategy::Suspend {
                    let _ = signal::send(pid, Signal::Continue, self.group);
                }
                return;
            }
        }
        if let Err(e) = child.start_kill() {
            debug!(task_id = %self.handle.task_id, "start_kill failed: {}", e);
        }
    }

    fn force_kill(&self, child: &mut Child) {
        if let Some(pid) = self.handle.pid {
            let _ = signal::send(pid, Signal::Kill, self.group);
        }
        if let Err(e) = child.start_kill() {
            debug!(task_id = %self.handle.task_id, "start_kill failed: {}", e);
        }
    }
}
