//! Webpilot Config - orchestrator settings
//!
//! Loaded from the global store, merged with the project store, then
//! overridden from the environment.

use crate::storage::{ConfigScope, ConfigStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Webpilot Config
// ============================================================================

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebpilotConfig {
    /// Version (for migrations)
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

impl Default for WebpilotConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            providers: ProvidersConfig::default(),
            registry: RegistryConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

impl WebpilotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// Global + project merge, then environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        for scope in ConfigScope::LOAD_ORDER {
            let store = match ConfigStore::for_scope(scope) {
                Ok(store) => store,
                Err(e) => {
                    debug!("Skipping {} config: {}", scope.as_str(), e);
                    continue;
                }
            };
            if let Some(layer) = store.read::<WebpilotConfig>()? {
                config.merge(layer);
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a single file (no merge, no env overrides). A missing file yields
    /// the defaults, a malformed one is an error.
    pub fn load_from(store: &ConfigStore) -> Result<Self> {
        let config: Self = store.read()?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Write to one scope, returns the file path
    pub fn save(&self, scope: ConfigScope, overwrite: bool) -> Result<PathBuf> {
        ConfigStore::for_scope(scope)?.write(self, overwrite)
    }

    // ========================================================================
    // Merge / Overrides
    // ========================================================================

    /// Merge another config over this one (`other` wins where it differs from
    /// the defaults)
    pub fn merge(&mut self, other: WebpilotConfig) {
        self.version = self.version.max(other.version);
        self.queue.merge(other.queue);
        self.worker.merge(other.worker);
        self.providers.merge(other.providers);
        self.registry.merge(other.registry);
        self.artifacts.merge(other.artifacts);
    }

    /// Apply `WEBPILOT_*` and `LLM_PROVIDER` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("WEBPILOT_MAX_CONCURRENT") {
            self.queue.max_concurrent = parse_env("WEBPILOT_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = lookup("WEBPILOT_QUEUE_LIMIT") {
            self.queue.queue_limit = parse_env("WEBPILOT_QUEUE_LIMIT", &value)?;
        }
        if let Some(value) = lookup("WEBPILOT_WORKER_PROGRAM") {
            self.worker.program = PathBuf::from(value);
        }
        if let Some(value) = lookup("WEBPILOT_DOWNLOADS_DIR") {
            self.artifacts.downloads_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("LLM_PROVIDER") {
            let value = value.trim().to_lowercase();
            if !value.is_empty() {
                debug!("LLM provider overridden from environment: {}", value);
                self.providers.default_provider = value;
            }
        }
        Ok(())
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent == 0 {
            return Err(Error::Config("queue.maxConcurrent must be at least 1".to_string()));
        }
        if self.worker.default_max_steps == 0 {
            return Err(Error::Config("worker.defaultMaxSteps must be at least 1".to_string()));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(Error::Config("worker.program must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {}", key, value)))
}

// ============================================================================
// Queue Config
// ============================================================================

/// Concurrency limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_limit: default_queue_limit(),
        }
    }
}

impl QueueConfig {
    fn merge(&mut self, other: QueueConfig) {
        let defaults = QueueConfig::default();
        if other.max_concurrent != defaults.max_concurrent {
            self.max_concurrent = other.max_concurrent;
        }
        if other.queue_limit != defaults.queue_limit {
            self.queue_limit = other.queue_limit;
        }
    }
}

// ============================================================================
// Worker Config
// ============================================================================

/// How pause/resume is carried out on the worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseMode {
    /// Suspend where the platform supports it, restart otherwise
    #[default]
    Auto,
    /// SIGSTOP / SIGCONT
    Suspend,
    /// Terminate on pause, spawn a fresh execution on resume
    Restart,
}

/// External worker process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Interpreter or executable
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Arguments placed before the task arguments (usually the script path)
    #[serde(default = "default_script_args")]
    pub script_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_max_steps")]
    pub default_max_steps: u32,

    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Wait between the graceful and the forced termination signal
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    #[serde(default = "default_true")]
    pub disable_highlighting: bool,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,

    #[serde(default)]
    pub pause_mode: PauseMode,

    /// Signal the whole process group (Unix only)
    #[serde(default = "default_true")]
    pub kill_process_group: bool,

    /// How long to keep draining pipes after the process exited
    #[serde(default = "default_reader_drain_ms")]
    pub reader_drain_ms: u64,

    #[serde(default)]
    pub extra_env: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script_args: default_script_args(),
            working_dir: None,
            default_max_steps: default_max_steps(),
            default_timeout_secs: default_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            disable_highlighting: true,
            headless: true,
            window_width: default_window_width(),
            window_height: default_window_height(),
            pause_mode: PauseMode::Auto,
            kill_process_group: true,
            reader_drain_ms: default_reader_drain_ms(),
            extra_env: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn reader_drain(&self) -> Duration {
        Duration::from_millis(self.reader_drain_ms)
    }

    fn merge(&mut self, other: WorkerConfig) {
        let defaults = WorkerConfig::default();
        if other.program != defaults.program {
            self.program = other.program;
        }
        if other.script_args != defaults.script_args {
            self.script_args = other.script_args;
        }
        if other.working_dir.is_some() {
            self.working_dir = other.working_dir;
        }
        if other.default_max_steps != defaults.default_max_steps {
            self.default_max_steps = other.default_max_steps;
        }
        if other.default_timeout_secs != defaults.default_timeout_secs {
            self.default_timeout_secs = other.default_timeout_secs;
        }
        if other.kill_grace_secs != defaults.kill_grace_secs {
            self.kill_grace_secs = other.kill_grace_secs;
        }
        if other.disable_highlighting != defaults.disable_highlighting {
            self.disable_highlighting = other.disable_highlighting;
        }
        if other.headless != defaults.headless {
            self.headless = other.headless;
        }
        if other.window_width != defaults.window_width {
            self.window_width = other.window_width;
        }
        if other.window_height != defaults.window_height {
            self.window_height = other.window_height;
        }
        if other.pause_mode != defaults.pause_mode {
            self.pause_mode = other.pause_mode;
        }
        if other.kill_process_group != defaults.kill_process_group {
            self.kill_process_group = other.kill_process_group;
        }
        if other.reader_drain_ms != defaults.reader_drain_ms {
            self.reader_drain_ms = other.reader_drain_ms;
        }
        self.extra_env.extend(other.extra_env);
    }
}

// ============================================================================
// Providers Config
// ============================================================================

/// LLM provider selection
///
/// Credentials stay in the process environment; entries here only name the
/// extra variables a provider needs (e.g. a deployment name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// provider name -> extra environment for the worker
    #[serde(default)]
    pub env: HashMap<String, HashMap<String, String>>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            env: HashMap::new(),
        }
    }
}

impl ProvidersConfig {
    /// Extra environment for a provider (empty when unknown)
    pub fn env_for(&self, provider: &str) -> HashMap<String, String> {
        self.env.get(provider).cloned().unwrap_or_default()
    }

    fn merge(&mut self, other: ProvidersConfig) {
        if other.default_provider != default_provider() {
            self.default_provider = other.default_provider;
        }
        for (name, env) in other.env {
            self.env.entry(name).or_default().extend(env);
        }
    }
}

// ============================================================================
// Registry Config
// ============================================================================

/// Task registry retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Grace before a completed task moves to history
    #[serde(default = "default_success_grace_secs")]
    pub success_grace_secs: u64,

    /// Grace before a failed task moves to history
    #[serde(default = "default_failure_grace_secs")]
    pub failure_grace_secs: u64,

    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            success_grace_secs: default_success_grace_secs(),
            failure_grace_secs: default_failure_grace_secs(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl RegistryConfig {
    pub fn success_grace(&self) -> Duration {
        Duration::from_secs(self.success_grace_secs)
    }

    pub fn failure_grace(&self) -> Duration {
        Duration::from_secs(self.failure_grace_secs)
    }

    fn merge(&mut self, other: RegistryConfig) {
        let defaults = RegistryConfig::default();
        if other.history_limit != defaults.history_limit {
            self.history_limit = other.history_limit;
        }
        if other.success_grace_secs != defaults.success_grace_secs {
            self.success_grace_secs = other.success_grace_secs;
        }
        if other.failure_grace_secs != defaults.failure_grace_secs {
            self.failure_grace_secs = other.failure_grace_secs;
        }
        if other.max_log_entries != defaults.max_log_entries {
            self.max_log_entries = other.max_log_entries;
        }
    }
}

// ============================================================================
// Artifact Config
// ============================================================================

/// Artifact capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactConfig {
    /// Managed downloads area (defaults under the platform data dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloads_dir: Option<PathBuf>,

    /// Extra directories searched for filename-only hints, highest priority first
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,

    /// Directory-name prefix of the worker's scratch directories in the temp area
    #[serde(default = "default_scratch_prefix")]
    pub scratch_prefix: String,

    /// Wait after a filename-only hint before searching
    #[serde(default = "default_hint_grace_ms")]
    pub hint_grace_ms: u64,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Destination prefix handed to the file store
    #[serde(default = "default_upload_prefix")]
    pub upload_prefix: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            downloads_dir: None,
            search_dirs: Vec::new(),
            scratch_prefix: default_scratch_prefix(),
            hint_grace_ms: default_hint_grace_ms(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            upload_prefix: default_upload_prefix(),
        }
    }
}

impl ArtifactConfig {
    /// Resolved downloads directory
    pub fn downloads_dir(&self) -> PathBuf {
        self.downloads_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("webpilot")
                .join("downloads")
        })
    }

    pub fn hint_grace(&self) -> Duration {
        Duration::from_millis(self.hint_grace_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn merge(&mut self, other: ArtifactConfig) {
        let defaults = ArtifactConfig::default();
        if other.downloads_dir.is_some() {
            self.downloads_dir = other.downloads_dir;
        }
        for dir in other.search_dirs {
            if !self.search_dirs.contains(&dir) {
                self.search_dirs.push(dir);
            }
        }
        if other.scratch_prefix != defaults.scratch_prefix {
            self.scratch_prefix = other.scratch_prefix;
        }
        if other.hint_grace_ms != defaults.hint_grace_ms {
            self.hint_grace_ms = other.hint_grace_ms;
        }
        if other.ttl_secs != defaults.ttl_secs {
            self.ttl_secs = other.ttl_secs;
        }
        if other.sweep_interval_secs != defaults.sweep_interval_secs {
            self.sweep_interval_secs = other.sweep_interval_secs;
        }
        if other.upload_prefix != defaults.upload_prefix {
            self.upload_prefix = other.upload_prefix;
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    5
}

fn default_queue_limit() -> usize {
    20
}

fn default_program() -> PathBuf {
    PathBuf::from("python3")
}

fn default_script_args() -> Vec<String> {
    vec!["browser_use_agent.py".to_string()]
}

fn default_max_steps() -> u32 {
    10
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_kill_grace_secs() -> u64 {
    10
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    720
}

fn default_reader_drain_ms() -> u64 {
    2000
}

fn default_provider() -> String {
    "azure".to_string()
}

fn default_history_limit() -> usize {
    100
}

fn default_success_grace_secs() -> u64 {
    5 * 60
}

fn default_failure_grace_secs() -> u64 {
    10 * 60
}

fn default_max_log_entries() -> usize {
    10_000
}

fn default_scratch_prefix() -> String {
    "browser_use_agent_".to_string()
}

fn default_hint_grace_ms() -> u64 {
    1500
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_upload_prefix() -> String {
    "browser-use".to_string()
}
