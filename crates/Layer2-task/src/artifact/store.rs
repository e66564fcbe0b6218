//! File store implementations
//!
//! - `LocalFileStore`: copies into a directory, returns a `file://` URL
//! - `HttpFileStore`: streams the file with an HTTP PUT

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use webpilot_foundation::{Error, FileStore, Result, UploadReceipt};

/// Reject destinations that would escape the store root
fn checked_destination(destination: &str) -> Result<&str> {
    let trimmed = destination.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|part| part == "..") {
        return Err(Error::InvalidInput(format!(
            "Invalid upload destination: {}",
            destination
        )));
    }
    Ok(trimmed)
}

// ============================================================================
// Local
// ============================================================================

/// Stores files under a local directory
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload(&self, mut content: tokio::fs::File, destination: &str) -> Result<UploadReceipt> {
        let relative = checked_destination(destination)?;
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut out = tokio::fs::File::create(&target).await?;
        let size = tokio::io::copy(&mut content, &mut out).await?;
        out.sync_all().await?;

        let absolute = tokio::fs::canonicalize(&target).await.unwrap_or(target);
        debug!(path = %absolute.display(), size, "Stored file locally");
        Ok(UploadReceipt::new(
            format!("file://{}", absolute.display()),
            size,
            self.name(),
        ))
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Receipt body returned by the storage service
#[derive(Debug, Deserialize)]
struct ReceiptBody {
    url: Option<String>,
    size: Option<u64>,
}

/// Uploads with `PUT <base_url>/<destination>`
#[derive(Debug, Clone)]
pub struct HttpFileStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFileStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url_for(&self, destination: &str) -> String {
        format!("{}/{}", self.base_url, destination)
    }
}

#[async_trait]
impl FileStore for HttpFileStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload(&self, content: tokio::fs::File, destination: &str) -> Result<UploadReceipt> {
        let relative = checked_destination(destination)?;
        let url = self.url_for(relative);
        let size = content.metadata().await?.len();

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::from(content));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::upload(relative, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upload(
                relative,
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }

        // services that answer with an empty body keep the request URL
        let body = response.text().await.unwrap_or_default();
        let receipt: Option<ReceiptBody> = serde_json::from_str(&body).ok();
        let (remote_url, remote_size) = match receipt {
            Some(r) => (r.url.unwrap_or_else(|| url.clone()), r.size.unwrap_or(size)),
            None => (url.clone(), size),
        };

        debug!(url = %remote_url, size = remote_size, "Uploaded file");
        Ok(UploadReceipt::new(remote_url, remote_size, self.name()))
    }
}
