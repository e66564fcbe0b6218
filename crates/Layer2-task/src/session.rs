//! In-memory browser session provider
//!
//! Sessions are created on demand. An endpoint template containing
//! `{session_id}` gives each session a DevTools websocket address.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use webpilot_foundation::{BrowserSession, BrowserSessionProvider, Error, Result, SessionOptions};

#[derive(Debug, Default)]
pub struct StaticSessionProvider {
    sessions: RwLock<HashMap<String, BrowserSession>>,
    endpoint_template: Option<String>,
}

impl StaticSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint_template(mut self, template: impl Into<String>) -> Self {
        self.endpoint_template = Some(template.into());
        self
    }

    /// Register an existing session
    pub fn insert(&self, session: BrowserSession) {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session);
    }

    /// Mark a session as no longer usable
    pub fn mark_dead(&self, session_id: &str) -> bool {
        match self.sessions.write().get_mut(session_id) {
            Some(session) => {
                session.alive = false;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<BrowserSession> {
        self.sessions.write().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BrowserSessionProvider for StaticSessionProvider {
    async fn get_session(&self, session_id: &str) -> Result<Option<BrowserSession>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .filter(|s| s.alive)
            .cloned())
    }

    async fn create_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<BrowserSession> {
        if session_id.trim().is_empty() {
            return Err(Error::session(session_id, "empty session id"));
        }
        let mut session = BrowserSession::new(session_id);
        if let Some(template) = &self.endpoint_template {
            session = session.with_endpoint(template.replace("{session_id}", session_id));
        }
        debug!(
            session_id,
            headless = options.headless,
            width = options.width,
            height = options.height,
            "Created browser session"
        );
        self.insert(session.clone());
        Ok(session)
    }
}
