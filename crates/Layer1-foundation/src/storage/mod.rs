//! Storage module for Webpilot
//!
//! - `config_store`: where `config.json` lives for each scope
//!
//! Runtime task state is in-memory only; nothing here journals tasks.

mod config_store;

pub use config_store::{ConfigScope, ConfigStore, CONFIG_FILE_NAME};
