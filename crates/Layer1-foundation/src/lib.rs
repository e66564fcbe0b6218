//! # webpilot-foundation
//!
//! Foundation layer for Webpilot:
//! - Error: one error enum with stable kinds
//! - Config: WebpilotConfig (global + project JSON, env overrides)
//! - Core: collaborator traits (browser sessions, file storage)
//! - Storage: ConfigStore (config.json per scope)

pub mod config;
pub mod core;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, ErrorKind, Result};

// ============================================================================
// Core (collaborator contracts)
// ============================================================================
pub use core::{BrowserSession, BrowserSessionProvider, FileStore, SessionOptions, UploadReceipt};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    ArtifactConfig, PauseMode, ProvidersConfig, QueueConfig, RegistryConfig, WebpilotConfig,
    WorkerConfig,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{ConfigScope, ConfigStore, CONFIG_FILE_NAME};
