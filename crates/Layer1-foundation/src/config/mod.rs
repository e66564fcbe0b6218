//! Config - orchestrator settings
//!
//! - `webpilot.rs` - WebpilotConfig (queue, worker, providers, registry, artifacts)

mod webpilot;

pub use webpilot::{
    ArtifactConfig, PauseMode, ProvidersConfig, QueueConfig, RegistryConfig, WebpilotConfig,
    WorkerConfig,
};
