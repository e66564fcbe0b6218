//! # webpilot-task
//!
//! Task orchestration for AI browser-automation workers.
//! Each task runs as an external worker process bound to a browser session.
//!
//! ## Features
//!
//! - Bounded concurrency with a FIFO overflow queue
//! - Task registry with a validated status machine and timed archival
//! - Worker supervision: timeout, stop, pause/resume (suspend or restart)
//! - Incremental parsing of worker output into progress events
//! - Token usage extraction and cost tracking
//! - Capture and upload of files produced by workers

pub mod artifact;
pub mod log;
pub mod orchestrator;
pub mod parser;
pub mod pricing;
pub mod queue;
pub mod registry;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod usage;

// Orchestration
pub use orchestrator::{ResumeOutcome, SubmitReceipt, TaskOrchestrator};
pub use queue::{Admission, ConcurrencyQueue, QueueEntry, QueueStats};
pub use registry::TaskRegistry;
pub use state::TaskStatus;
pub use task::{
    ExecutionId, ResolvedOptions, Task, TaskFailure, TaskId, TaskOptions, TaskRecord, TaskResult,
};

// Worker processes
pub use supervisor::{
    AgentProcessHandle, ExitReason, PauseStrategy, SpawnRequest, SupervisorEvent, WorkerCommand,
    WorkerSupervisor,
};

// Output parsing
pub use parser::{
    EventKind, Extraction, FileHint, OutputParser, ParseOutput, ProgressEvent, StreamKind,
    TokenUsageRecord, WorkerResult, MARKER_VOCABULARY_VERSION,
};

// Logs, usage, artifacts
pub use artifact::{ArtifactRecord, ArtifactTracker, HttpFileStore, LocalFileStore};
pub use log::{LogSummary, TaskLogBuffer, TaskLogManager};
pub use pricing::{estimate_cost, format_cost, ModelPricing};
pub use session::StaticSessionProvider;
pub use usage::{
    CostAnalysis, ExportFormat, TrendPeriod, UsageBucket, UsageEntry, UsageTotals, UsageTracker,
};
