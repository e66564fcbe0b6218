//! Orchestrator integration tests with shell scripts as workers
//!
//! Scripts see the worker arguments as `$1` (instruction), `$2` (max steps),
//! `$3` (session id) and `$4` (DevTools endpoint).
//!
//! `cargo test -p webpilot-task --test orchestrator_test`

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use webpilot_foundation::{BrowserSession, ErrorKind, PauseMode, WebpilotConfig};
use webpilot_task::{
    EventKind, LocalFileStore, ResumeOutcome, StaticSessionProvider, Task, TaskId,
    TaskOrchestrator, TaskStatus,
};

const WAIT: Duration = Duration::from_secs(15);

struct Harness {
    orchestrator: TaskOrchestrator,
    sessions: Arc<StaticSessionProvider>,
    dir: TempDir,
}

impl Harness {
    fn new(script: &str) -> Self {
        Self::with(script, |_| {})
    }

    fn with(script: &str, tweak: impl FnOnce(&mut WebpilotConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let mut config = WebpilotConfig::default();
        config.worker.program = PathBuf::from("sh");
        config.worker.script_args =
            vec!["-c".to_string(), script.to_string(), "worker".to_string()];
        config.worker.working_dir = Some(work);
        config.worker.kill_grace_secs = 1;
        config.worker.reader_drain_ms = 300;
        config.artifacts.downloads_dir = Some(dir.path().join("downloads"));
        config.artifacts.hint_grace_ms = 20;
        tweak(&mut config);

        let sessions = Arc::new(
            StaticSessionProvider::new().with_endpoint_template("ws://127.0.0.1:9222/{session_id}"),
        );
        let orchestrator = TaskOrchestrator::new(
            config,
            sessions.clone(),
            Arc::new(LocalFileStore::new(dir.path().join("store"))),
        )
        .unwrap();
        Self {
            orchestrator,
            sessions,
            dir,
        }
    }

    fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    async fn wait(&self, id: &str) -> webpilot_task::TaskRecord {
        self.orchestrator
            .wait_for_terminal(&TaskId::from(id), WAIT)
            .await
            .unwrap()
    }

    /// Until every slot is free, which is after the last exit was processed
    async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.orchestrator.queue_stats().running > 0 {
            assert!(tokio::time::Instant::now() < deadline, "slot never freed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_step(&self, id: &str, step: u32) {
        let id = TaskId::from(id);
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let record = self.orchestrator.get_status(&id).unwrap();
            if record.current_step >= step {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "step {} never reached", step);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

#[tokio::test]
async fn test_structured_result_completes_task() {
    let h = Harness::new(
        r#"echo "📍 Step 1"; echo "📍 Step 2"; echo '{"success": true, "final_result": "Title is Example", "steps_executed": 2}'"#,
    );
    let receipt = h
        .orchestrator
        .submit(Task::new("t1", "s1", "read the title").with_max_steps(4))
        .await
        .unwrap();
    assert!(receipt.execution_id.is_some());
    assert_eq!(receipt.running_count, 1);

    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.progress, 100);
    let result = record.result.unwrap();
    assert!(result.structured);
    assert_eq!(result.final_result.as_deref(), Some("Title is Example"));
    assert_eq!(result.steps_executed, 2);

    let logs = h.orchestrator.get_logs(&TaskId::from("t1"), None).await.unwrap();
    assert!(logs.iter().any(|e| e.kind == EventKind::Step));
    let summary = h.orchestrator.log_summary(&TaskId::from("t1")).await.unwrap();
    assert!(!summary.is_active);
}

#[tokio::test]
async fn test_worker_reported_failure() {
    let h = Harness::new(r#"echo '{"success": false, "error": "captcha wall"}'"#);
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();

    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error_kind(), Some(ErrorKind::AgentFailed));
    assert!(record.error.unwrap().message.contains("captcha wall"));
}

#[tokio::test]
async fn test_nonzero_exit_carries_stderr() {
    let h = Harness::new(r#"echo "browser crashed" >&2; exit 3"#);
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();

    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Failed);
    let failure = record.error.unwrap();
    assert_eq!(failure.kind, ErrorKind::ProcessExit);
    assert_eq!(failure.exit_code, Some(3));
    assert!(failure.stderr_tail.unwrap_or_default().contains("browser crashed"));
}

#[tokio::test]
async fn test_queue_promotion() {
    let h = Harness::with(r#"sleep 0.3; echo "✅ done $1""#, |c| {
        c.queue.max_concurrent = 1;
    });

    let first = h.orchestrator.submit(Task::new("t1", "s1", "one")).await.unwrap();
    assert_eq!(first.status, TaskStatus::Running);
    let second = h.orchestrator.submit(Task::new("t2", "s2", "two")).await.unwrap();
    assert_eq!(second.status, TaskStatus::Queued);
    assert_eq!(second.queue_position, Some(1));
    assert_eq!(
        h.orchestrator.get_status(&TaskId::from("t2")).unwrap().queue_position,
        Some(1)
    );

    assert_eq!(h.wait("t1").await.status, TaskStatus::Completed);
    let record = h.wait("t2").await;
    assert_eq!(record.status, TaskStatus::Completed);
    assert!(record.result.unwrap().final_result.unwrap().contains("two"));
    assert_eq!(h.orchestrator.queue_stats().running, 0);
}

#[tokio::test]
async fn test_queued_tasks_start_in_submission_order() {
    let h = Harness::with(r#"echo "$1" >> order.log; sleep 0.1; echo "✅ ran $1""#, |c| {
        c.queue.max_concurrent = 1;
    });

    let mut positions = Vec::new();
    for (n, name) in ["a", "b", "c", "d"].into_iter().enumerate() {
        let receipt = h
            .orchestrator
            .submit(Task::new(format!("t{}", n + 1), "s1", name))
            .await
            .unwrap();
        positions.push(receipt.queue_position);
    }
    assert_eq!(positions, vec![None, Some(1), Some(2), Some(3)]);
    assert_eq!(
        h.orchestrator.get_status(&TaskId::from("t4")).unwrap().queue_position,
        Some(3)
    );

    for id in ["t1", "t2", "t3", "t4"] {
        assert_eq!(h.wait(id).await.status, TaskStatus::Completed);
    }
    let order = std::fs::read_to_string(h.work_dir().join("order.log")).unwrap();
    assert_eq!(order.lines().collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_queue_full() {
    let h = Harness::with("exec sleep 30", |c| {
        c.queue.max_concurrent = 1;
        c.queue.queue_limit = 1;
    });
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();
    h.orchestrator.submit(Task::new("t2", "s1", "x")).await.unwrap();

    let err = h.orchestrator.submit(Task::new("t3", "s1", "x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueFull);
    assert!(h.orchestrator.get_status(&TaskId::from("t3")).is_none());

    let stats = h.orchestrator.queue_stats();
    assert_eq!((stats.running, stats.queued), (1, 1));

    // duplicates of a live task are rejected
    let err = h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    h.orchestrator.shutdown(WAIT).await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_frees_slot() {
    let h = Harness::with("exec sleep 30", |c| {
        c.queue.max_concurrent = 1;
    });
    let t1 = TaskId::from("t1");
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();
    h.orchestrator.submit(Task::new("t2", "s1", "x")).await.unwrap();

    assert!(h.orchestrator.stop(&t1).await.unwrap());
    assert_eq!(h.orchestrator.get_status(&t1).unwrap().status, TaskStatus::Stopped);
    assert!(!h.orchestrator.stop(&t1).await.unwrap());

    // stopping a queued task removes it from the queue
    assert!(h.orchestrator.stop(&TaskId::from("t2")).await.unwrap());
    assert_eq!(h.orchestrator.queue_stats().queued, 0);

    h.wait_idle().await;
    let record = h.wait("t1").await;
    assert_eq!(record.error_kind(), Some(ErrorKind::UserStopped));
}

#[tokio::test]
async fn test_timeout_fails_task() {
    let h = Harness::new("exec sleep 30");
    h.orchestrator
        .submit(Task::new("t1", "s1", "x").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap();

    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error_kind(), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_timeout_kills_worker_ignoring_term() {
    let h = Harness::new("trap '' TERM; while :; do sleep 0.1; done");
    let started = tokio::time::Instant::now();
    h.orchestrator
        .submit(Task::new("t1", "s1", "x").with_timeout(Duration::from_millis(200)))
        .await
        .unwrap();

    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error_kind(), Some(ErrorKind::Timeout));
    // timeout + kill grace (1s) + drain, never the worker's own pace
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    h.wait_idle().await;
}

#[tokio::test]
async fn test_nonzero_exit_keeps_reported_error() {
    let h = Harness::new(r#"echo '{"success": false, "error": "login wall"}'; exit 2"#);
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();

    let failure = h.wait("t1").await.error.unwrap();
    assert_eq!(failure.kind, ErrorKind::ProcessExit);
    assert_eq!(failure.exit_code, Some(2));
    assert!(failure.message.contains("login wall"), "{}", failure.message);
}

#[tokio::test]
async fn test_token_usage_is_tracked() {
    let h = Harness::new(r#"echo "💰 TOKEN_USAGE: modelX | 1000 tokens | \$0.02"; echo "✅ ok""#);
    h.orchestrator
        .submit(Task::new("t1", "s1", "x").with_provider("openai"))
        .await
        .unwrap();

    let record = h.wait("t1").await;
    let usage = record.token_usage.clone().unwrap();
    assert_eq!(usage.total_tokens, 1000);
    assert!((usage.cost - 0.02).abs() < 1e-9);

    let execution_id = record.execution_id.unwrap();
    let entry = h.orchestrator.token_usage_by_execution(execution_id).unwrap();
    assert_eq!(entry.provider, "openai");
    assert_eq!(h.orchestrator.token_usage_by_model()["modelX"].total_tokens, 1000);
    assert_eq!(h.orchestrator.token_usage_by_session("s1").executions, 1);
    assert_eq!(
        h.orchestrator.cost_analysis().most_expensive_model.as_deref(),
        Some("modelX")
    );
}

#[tokio::test]
async fn test_created_file_is_uploaded() {
    let h = Harness::new(r#"printf 'a,b\n1,2\n' > report.csv; echo "File created: report.csv""#);
    h.orchestrator.submit(Task::new("t1", "s1", "export")).await.unwrap();

    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Completed);
    assert!(exists(&h.work_dir().join("report.csv")));

    let files = record.result.unwrap().output_files;
    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.file_name, "report.csv");
    assert!(file.is_uploaded());
    assert!(file.remote_url.as_deref().unwrap().starts_with("file://"));
    assert_eq!(file.size, 8);
    // the managed copy is dropped once uploaded
    assert!(!exists(&file.managed_path));

    let tracked = h
        .orchestrator
        .get_artifacts(record.execution_id.unwrap(), "s1");
    assert_eq!(tracked.len(), 1);
}

#[tokio::test]
async fn test_pause_resume_with_suspend() {
    let h = Harness::with(
        r#"echo "📍 Step 1"; sleep 0.5; echo "📍 Step 2"; echo "✅ finished""#,
        |c| c.worker.pause_mode = PauseMode::Suspend,
    );
    let id = TaskId::from("t1");
    let receipt = h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();
    h.wait_for_step("t1", 1).await;

    h.orchestrator.pause(&id).await.unwrap();
    assert_eq!(h.orchestrator.get_status(&id).unwrap().status, TaskStatus::Paused);
    assert_eq!(h.orchestrator.queue_stats().running, 1);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(h.orchestrator.get_status(&id).unwrap().status, TaskStatus::Paused);

    assert_eq!(h.orchestrator.resume(&id).await.unwrap(), ResumeOutcome::Continued);
    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.current_step, 2);
    assert_eq!(record.execution_id, receipt.execution_id);
}

#[tokio::test]
async fn test_pause_resume_with_restart() {
    let h = Harness::with(
        r#"if [ -f resumed ]; then echo "📍 Step 1"; echo "📍 Step 2"; echo "✅ done"; exit 0; fi; touch resumed; echo "📍 Step 1"; echo "📍 Step 2"; exec sleep 30"#,
        |c| c.worker.pause_mode = PauseMode::Restart,
    );
    let id = TaskId::from("t1");
    let receipt = h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();
    h.wait_for_step("t1", 2).await;

    h.orchestrator.pause(&id).await.unwrap();
    // the slot stays held while paused
    assert_eq!(h.orchestrator.queue_stats().running, 1);

    let outcome = h.orchestrator.resume(&id).await.unwrap();
    let ResumeOutcome::Restarted { execution_id } = outcome else {
        panic!("expected a restart, got {:?}", outcome);
    };
    assert_ne!(Some(execution_id), receipt.execution_id);

    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.executions.len(), 2);
    assert_eq!(record.current_step, 4);
}

#[tokio::test]
async fn test_pause_requires_running() {
    let h = Harness::with("exec sleep 30", |c| c.queue.max_concurrent = 1);
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();
    h.orchestrator.submit(Task::new("t2", "s1", "x")).await.unwrap();

    let err = h.orchestrator.pause(&TaskId::from("t2")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = h.orchestrator.resume(&TaskId::from("t1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    assert_eq!(h.orchestrator.shutdown(WAIT).await, 2);
    assert!(h.orchestrator.list_active().is_empty());
}

#[tokio::test]
async fn test_restart_keeps_remaining_timeout() {
    let h = Harness::with(
        r#"if [ -f resumed ]; then exec sleep 30; fi; touch resumed; echo "📍 Step 1"; exec sleep 30"#,
        |c| c.worker.pause_mode = PauseMode::Restart,
    );
    let id = TaskId::from("t1");
    h.orchestrator
        .submit(Task::new("t1", "s1", "x").with_timeout(Duration::from_millis(2000)))
        .await
        .unwrap();
    h.wait_for_step("t1", 1).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    h.orchestrator.pause(&id).await.unwrap();

    let resumed_at = tokio::time::Instant::now();
    assert!(matches!(
        h.orchestrator.resume(&id).await.unwrap(),
        ResumeOutcome::Restarted { .. }
    ));

    let record = h.wait("t1").await;
    assert_eq!(record.error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(record.executions.len(), 2);
    // a fresh budget would have needed the full 2s
    assert!(
        resumed_at.elapsed() < Duration::from_millis(1800),
        "{:?}",
        resumed_at.elapsed()
    );
}

#[tokio::test]
async fn test_restart_reverifies_session() {
    let h = Harness::with(
        r#"if [ -f resumed ]; then echo "✅ attached to $4"; exit 0; fi; touch resumed; echo "📍 Step 1 on $4"; exec sleep 30"#,
        |c| c.worker.pause_mode = PauseMode::Restart,
    );
    let id = TaskId::from("t1");
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();
    h.wait_for_step("t1", 1).await;
    h.orchestrator.pause(&id).await.unwrap();

    // the browser went away while paused and was provisioned again elsewhere
    assert!(h.sessions.mark_dead("s1"));
    h.sessions
        .insert(BrowserSession::new("s1").with_endpoint("ws://127.0.0.1:9333/replacement"));

    h.orchestrator.resume(&id).await.unwrap();
    let record = h.wait("t1").await;
    assert_eq!(record.status, TaskStatus::Completed);
    let text = record.result.unwrap().final_result.unwrap();
    assert!(text.contains("ws://127.0.0.1:9333/replacement"), "{}", text);

    let logs = h.orchestrator.get_logs(&id, None).await.unwrap();
    assert!(logs
        .iter()
        .any(|e| e.raw.contains("ws://127.0.0.1:9222/s1")));
}

#[tokio::test]
async fn test_stopped_task_keeps_usage_and_files() {
    let h = Harness::new(
        r#"trap 'printf partial > partial.txt; echo "File created: partial.txt"; echo "💰 TOKEN_USAGE: modelX | 500 tokens | \$0.01"; exit 0' TERM; echo "📍 Step 1"; while :; do sleep 0.1; done"#,
    );
    let id = TaskId::from("t1");
    h.orchestrator.submit(Task::new("t1", "s1", "x")).await.unwrap();
    h.wait_for_step("t1", 1).await;

    assert!(h.orchestrator.stop(&id).await.unwrap());
    h.wait_idle().await;

    let record = h.orchestrator.get_status(&id).unwrap();
    assert_eq!(record.status, TaskStatus::Stopped);
    assert_eq!(record.token_usage.as_ref().map(|u| u.total_tokens), Some(500));
    assert_eq!(record.output_files.len(), 1);
    assert_eq!(record.output_files[0].file_name, "partial.txt");

    let failure = record.error.unwrap();
    assert_eq!(failure.kind, ErrorKind::UserStopped);
    assert_eq!(failure.token_usage.map(|u| u.total_tokens), Some(500));
    assert_eq!(failure.output_files.len(), 1);
    assert_eq!(h.orchestrator.token_usage_by_session("s1").executions, 1);
}
