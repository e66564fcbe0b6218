//! Collaborator data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Browser sessions
// ============================================================================

/// A live browser session the worker attaches to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSession {
    pub session_id: String,

    /// DevTools websocket endpoint (`ws://...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,

    #[serde(default = "default_alive")]
    pub alive: bool,
}

fn default_alive() -> bool {
    true
}

impl BrowserSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ws_endpoint: None,
            alive: true,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ws_endpoint = Some(endpoint.into());
        self
    }
}

/// Options for creating a session on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub headless: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            headless: true,
            width: 1280,
            height: 720,
        }
    }
}

// ============================================================================
// File store
// ============================================================================

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    /// Remote location of the stored file
    pub url: String,
    pub size: u64,
    /// Storage backend name (e.g. "local", "http")
    pub provider: String,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadReceipt {
    pub fn new(url: impl Into<String>, size: u64, provider: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            size,
            provider: provider.into(),
            uploaded_at: Utc::now(),
        }
    }
}
