//! `webpilot run` - submit tasks and follow them to completion

use clap::Args;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use webpilot_foundation::{FileStore, WebpilotConfig};
use webpilot_task::{
    ExportFormat, HttpFileStore, LocalFileStore, StaticSessionProvider, SubmitReceipt, Task,
    TaskId, TaskOrchestrator, TaskRecord, TaskStatus,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Instructions, one task each
    #[arg(required = true)]
    instructions: Vec<String>,

    /// Browser session to reuse for every task (default: one session per task)
    #[arg(short, long)]
    session: Option<String>,

    /// DevTools endpoint template, `{session_id}` is substituted
    #[arg(long)]
    ws_endpoint: Option<String>,

    /// Maximum agent steps per task
    #[arg(long)]
    max_steps: Option<u32>,

    /// Per-task timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// LLM provider passed to the worker
    #[arg(long)]
    provider: Option<String>,

    /// Override queue.maxConcurrent
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Upload artifacts to this HTTP endpoint instead of a local directory
    #[arg(long)]
    upload_url: Option<String>,

    /// Bearer token for --upload-url (default: WEBPILOT_UPLOAD_TOKEN)
    #[arg(long)]
    upload_token: Option<String>,

    /// Directory receiving artifacts when no upload URL is given
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Print usage records as json or csv after the run
    #[arg(long)]
    export: Option<ExportFormat>,

    /// Do not stream progress events
    #[arg(short, long)]
    quiet: bool,
}

/// Run every instruction, returns the number of tasks that did not complete
pub async fn run(mut config: WebpilotConfig, args: RunArgs) -> anyhow::Result<usize> {
    if let Some(max_concurrent) = args.max_concurrent {
        config.queue.max_concurrent = max_concurrent;
    }

    let store: Arc<dyn FileStore> = match &args.upload_url {
        Some(url) => {
            let mut store = HttpFileStore::new(url.clone());
            if let Some(token) = args
                .upload_token
                .clone()
                .or_else(|| std::env::var("WEBPILOT_UPLOAD_TOKEN").ok())
            {
                store = store.with_token(token);
            }
            Arc::new(store)
        }
        None => {
            let dir = args
                .store_dir
                .clone()
                .unwrap_or_else(|| config.artifacts.downloads_dir().join("uploaded"));
            Arc::new(LocalFileStore::new(dir))
        }
    };

    let mut sessions = StaticSessionProvider::new();
    if let Some(template) = &args.ws_endpoint {
        sessions = sessions.with_endpoint_template(template.clone());
    }

    let wait = Duration::from_secs(args.timeout.unwrap_or(config.worker.default_timeout_secs))
        + config.worker.kill_grace() * 2
        + config.worker.reader_drain();
    let orchestrator = Arc::new(TaskOrchestrator::new(config, Arc::new(sessions), store)?);

    let mut task_ids = Vec::new();
    let mut printers = Vec::new();
    for (n, instruction) in args.instructions.iter().enumerate() {
        let task = build_task(&args, n + 1, instruction);
        let task_id = task.task_id.clone();

        match orchestrator.submit(task).await {
            Ok(receipt) => {
                print_receipt(&receipt);
                if !args.quiet {
                    printers.push(follow_logs(Arc::clone(&orchestrator), task_id.clone()).await);
                }
                task_ids.push(task_id);
            }
            Err(e) if e.is_retryable() => {
                eprintln!("✗ {} rejected: {} (retry later)", task_id, e)
            }
            Err(e) => eprintln!("✗ {} rejected: {}", task_id, e),
        }
    }
    let rejected = args.instructions.len() - task_ids.len();

    let waits = join_all(
        task_ids
            .iter()
            .map(|id| orchestrator.wait_for_terminal(id, wait)),
    );
    let records = tokio::select! {
        results = waits => results,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, stopping tasks...");
            orchestrator.shutdown(Duration::from_secs(15)).await;
            task_ids
                .iter()
                .map(|id| orchestrator.get_status(id).ok_or_else(|| {
                    webpilot_foundation::Error::NotFound(format!("Task {}", id))
                }))
                .collect()
        }
    };

    for printer in printers {
        printer.abort();
    }

    println!();
    let mut failed = rejected;
    for (task_id, record) in task_ids.iter().zip(records) {
        match record {
            Ok(record) => {
                if record.status != TaskStatus::Completed {
                    failed += 1;
                }
                print_record(&record);
            }
            Err(e) => {
                failed += 1;
                println!("✗ {}: {}", task_id, e);
            }
        }
    }

    print_usage(&orchestrator);
    if let Some(format) = args.export {
        println!("{}", orchestrator.export_usage(format)?);
    }

    Ok(failed)
}

fn build_task(args: &RunArgs, n: usize, instruction: &str) -> Task {
    let session = args
        .session
        .clone()
        .unwrap_or_else(|| format!("session-{}", n));
    let mut task = Task::new(format!("task-{}", n), session, instruction);
    if let Some(max_steps) = args.max_steps {
        task = task.with_max_steps(max_steps);
    }
    if let Some(timeout) = args.timeout {
        task = task.with_timeout(Duration::from_secs(timeout));
    }
    if let Some(provider) = &args.provider {
        task = task.with_provider(provider.clone());
    }
    task
}

/// Print buffered events, then stream new ones
async fn follow_logs(orchestrator: Arc<TaskOrchestrator>, task_id: TaskId) -> JoinHandle<()> {
    let rx = orchestrator.subscribe_logs(&task_id).await;
    let backlog = orchestrator.get_logs(&task_id, None).await.unwrap_or_default();

    tokio::spawn(async move {
        let mut last_line = 0;
        for event in backlog {
            last_line = event.line_number;
            println!("{}", event.annotated());
        }

        let Some(mut rx) = rx else {
            return;
        };
        loop {
            match rx.recv().await {
                Ok(event) if event.line_number > last_line => {
                    last_line = event.line_number;
                    println!("{}", event.annotated());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("[{}] ... {} events skipped", task_id, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_receipt(receipt: &SubmitReceipt) {
    match receipt.queue_position {
        Some(position) => println!(
            "⏳ {} queued at position {} ({} running, {} queued)",
            receipt.task_id, position, receipt.running_count, receipt.queued_count
        ),
        None => println!(
            "▶ {} {} ({} running, {} queued)",
            receipt.task_id, receipt.status, receipt.running_count, receipt.queued_count
        ),
    }
}

fn print_record(record: &TaskRecord) {
    println!(
        "{} {:<10} {:<10} steps {:>3}/{:<3}",
        record.status.symbol(),
        record.task_id,
        record.status,
        record.current_step,
        record.options.max_steps
    );

    if let Some(result) = &record.result {
        if let Some(text) = &result.final_result {
            println!("    {}", truncate(text, 200));
        }
        for warning in &result.warnings {
            println!("    ⚠ {}", warning);
        }
    }
    if let Some(error) = &record.error {
        println!("    {}: {}", error.kind, truncate(&error.message, 200));
        if let Some(tail) = &error.stderr_tail {
            for line in tail.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
                println!("    | {}", line);
            }
        }
    }
    for file in &record.output_files {
        match &file.remote_url {
            Some(url) => println!("    📎 {} -> {}", file.file_name, url),
            None => println!("    📎 {} (kept at {})", file.file_name, file.managed_path.display()),
        }
    }
}

fn print_usage(orchestrator: &TaskOrchestrator) {
    let analysis = orchestrator.cost_analysis();
    if analysis.totals.executions == 0 {
        return;
    }

    println!("\n💰 Usage");
    println!(
        "  {} tokens over {} executions, {}",
        analysis.totals.total_tokens,
        analysis.totals.executions,
        analysis.format_total()
    );
    for (model, totals) in &analysis.by_model {
        println!(
            "  {:<28} {:>10} tokens  {}",
            model,
            totals.total_tokens,
            webpilot_task::format_cost(totals.cost)
        );
    }
    if let Some(model) = &analysis.most_expensive_model {
        println!("  most expensive: {}", model);
    }
}

/// Truncate a string for display
fn truncate(s: &str, max_chars: usize) -> String {
    let s = s.replace('\n', " ");
    if s.chars().count() <= max_chars {
        s
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn test_build_task() {
        let args = Wrapper::parse_from([
            "webpilot", "--max-steps", "3", "--provider", "openai", "open a", "open b",
        ])
        .run;
        let task = build_task(&args, 2, &args.instructions[1]);
        assert_eq!(task.task_id.as_str(), "task-2");
        assert_eq!(task.session_id, "session-2");
        assert_eq!(task.options.max_steps, Some(3));
        assert_eq!(task.options.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn test_shared_session_and_export() {
        let args = Wrapper::parse_from(["webpilot", "-s", "main", "--export", "csv", "x"]).run;
        assert_eq!(build_task(&args, 1, "x").session_id, "main");
        assert_eq!(args.export, Some(ExportFormat::Csv));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("a\nb", 10), "a b");
        assert_eq!(truncate("héllo world", 5), "héllo...");
    }
}
