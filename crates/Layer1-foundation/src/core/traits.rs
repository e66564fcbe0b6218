//! Core Traits - collaborator contracts
//!
//! The orchestrator never talks to a browser or a storage backend directly.
//! Both sit behind these traits so callers can plug in their own services.

use super::types::{BrowserSession, SessionOptions, UploadReceipt};
use crate::Result;
use async_trait::async_trait;

// ============================================================================
// BrowserSessionProvider
// ============================================================================

/// Source of live browser sessions
#[async_trait]
pub trait BrowserSessionProvider: Send + Sync {
    /// Look up an existing session. `Ok(None)` when it is unknown or dead.
    async fn get_session(&self, session_id: &str) -> Result<Option<BrowserSession>>;

    /// Create a session with the given id
    async fn create_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<BrowserSession>;

    /// Existing session, or a freshly created one
    async fn get_or_create(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<BrowserSession> {
        match self.get_session(session_id).await? {
            Some(session) if session.alive => Ok(session),
            _ => self.create_session(session_id, options).await,
        }
    }
}

// ============================================================================
// FileStore
// ============================================================================

/// Durable storage for worker artifacts
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Backend name recorded on artifacts
    fn name(&self) -> &str;

    /// Stream `content` to `destination` (a `/`-separated key)
    async fn upload(&self, content: tokio::fs::File, destination: &str) -> Result<UploadReceipt>;
}
