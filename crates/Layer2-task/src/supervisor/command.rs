//! Worker command line and environment

use crate::task::{ExecutionId, TaskId};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use webpilot_foundation::{Error, ProvidersConfig, Result, WorkerConfig};

/// Everything needed to start one execution
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: TaskId,
    pub session_id: String,
    pub instruction: String,
    pub max_steps: u32,
    pub timeout: Duration,
    pub provider: String,

    /// DevTools endpoint of an already provisioned browser
    pub ws_endpoint: Option<String>,
}

/// Resolved program, arguments and environment
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    /// `<program> <scriptArgs...> <instruction> <maxSteps> <sessionId> [<ws>] [--disable-highlighting]`
    pub fn build(
        config: &WorkerConfig,
        providers: &ProvidersConfig,
        request: &SpawnRequest,
        execution_id: ExecutionId,
    ) -> Result<Self> {
        let program = resolve_program(&config.program)?;

        let mut args = config.script_args.clone();
        args.push(request.instruction.clone());
        args.push(request.max_steps.to_string());
        args.push(request.session_id.clone());
        if let Some(ws) = &request.ws_endpoint {
            args.push(ws.clone());
        }
        if config.disable_highlighting {
            args.push("--disable-highlighting".to_string());
        }

        let mut env = vec![("LLM_PROVIDER".to_string(), request.provider.clone())];
        let mut provider_env: Vec<(String, String)> =
            providers.env_for(&request.provider).into_iter().collect();
        provider_env.sort();
        env.extend(provider_env);
        env.push(("BROWSER_HEADLESS".to_string(), config.headless.to_string()));
        env.push(("BROWSER_WINDOW_WIDTH".to_string(), config.window_width.to_string()));
        env.push(("BROWSER_WINDOW_HEIGHT".to_string(), config.window_height.to_string()));
        env.push(("WEBPILOT_TASK_ID".to_string(), request.task_id.to_string()));
        env.push(("WEBPILOT_EXECUTION_ID".to_string(), execution_id.to_string()));
        env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
        let mut extra: Vec<(String, String)> = config.extra_env.clone().into_iter().collect();
        extra.sort();
        env.extend(extra);

        Ok(Self {
            program,
            args,
            env,
            working_dir: config.working_dir.clone(),
        })
    }

    /// Shell-quoted rendering for logs (environment values are not shown)
    pub fn display(&self) -> String {
        let program = self.program.to_string_lossy();
        let parts = std::iter::once(program.as_ref()).chain(self.args.iter().map(|s| s.as_str()));
        shlex::try_join(parts).unwrap_or_else(|_| {
            std::iter::once(program.to_string())
                .chain(self.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ")
        })
    }

    /// Environment variable value as it will be passed
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Tokio command with piped output, null stdin and its own process group
    pub fn to_command(&self, own_process_group: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        if own_process_group {
            cmd.process_group(0);
        }
        #[cfg(not(unix))]
        let _ = own_process_group;

        cmd
    }
}

/// Resolve a bare program name through `PATH`; paths must exist
fn resolve_program(program: &Path) -> Result<PathBuf> {
    if program.as_os_str().is_empty() {
        return Err(Error::Spawn("worker program is not configured".to_string()));
    }
    if program.components().count() > 1 {
        if program.exists() {
            return Ok(program.to_path_buf());
        }
        return Err(Error::Spawn(format!(
            "worker program not found: {}",
            program.display()
        )));
    }
    which::which(program)
        .map_err(|e| Error::Spawn(format!("{}: {}", program.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request() -> SpawnRequest {
        SpawnRequest {
            task_id: TaskId::from("t1"),
            session_id: "s1".to_string(),
            instruction: "open example.com".to_string(),
            max_steps: 5,
            timeout: Duration::from_secs(60),
            provider: "openai".to_string(),
            ws_endpoint: Some("ws://127.0.0.1:9222/devtools/browser/abc".to_string()),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_build_arguments_and_env() {
        let config = WorkerConfig {
            program: PathBuf::from("sh"),
            script_args: vec!["agent.py".to_string()],
            extra_env: HashMap::from([("EXTRA".to_string(), "1".to_string())]),
            ..WorkerConfig::default()
        };
        let mut providers = ProvidersConfig::default();
        providers.env.insert(
            "openai".to_string(),
            HashMap::from([("OPENAI_MODEL".to_string(), "gpt-4o".to_string())]),
        );

        let exec = ExecutionId::new();
        let cmd = WorkerCommand::build(&config, &providers, &request(), exec).unwrap();
        assert_eq!(
            cmd.args,
            vec![
                "agent.py",
                "open example.com",
                "5",
                "s1",
                "ws://127.0.0.1:9222/devtools/browser/abc",
                "--disable-highlighting"
            ]
        );
        assert_eq!(cmd.env_var("LLM_PROVIDER"), Some("openai"));
        assert_eq!(cmd.env_var("OPENAI_MODEL"), Some("gpt-4o"));
        assert_eq!(cmd.env_var("BROWSER_HEADLESS"), Some("true"));
        assert_eq!(cmd.env_var("WEBPILOT_EXECUTION_ID"), Some(exec.to_string().as_str()));
        assert_eq!(cmd.env_var("PYTHONUNBUFFERED"), Some("1"));
        assert_eq!(cmd.env_var("EXTRA"), Some("1"));
        assert!(cmd.display().contains("'open example.com'"));
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let config = WorkerConfig {
            program: PathBuf::from("webpilot-no-such-worker-binary"),
            ..WorkerConfig::default()
        };
        let err = WorkerCommand::build(&config, &ProvidersConfig::default(), &request(), ExecutionId::new())
            .unwrap_err();
        assert_eq!(err.kind(), webpilot_foundation::ErrorKind::Spawn);

        let config = WorkerConfig {
            program: PathBuf::from("/nonexistent/dir/python3"),
            ..WorkerConfig::default()
        };
        assert!(WorkerCommand::build(&config, &ProvidersConfig::default(), &request(), ExecutionId::new()).is_err());
    }
}
