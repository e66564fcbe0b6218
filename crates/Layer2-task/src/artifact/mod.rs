//! Artifact Tracker
//!
//! Reacts to file-creation hints: locate the file, copy it into the managed
//! downloads area, upload the copy, delete it once stored. Tracking records
//! expire after a fixed TTL.
//!
//! - `locate.rs`: candidate directory search
//! - `store.rs`: `LocalFileStore`, `HttpFileStore`

mod locate;
mod store;

pub use locate::SearchPlan;
pub use store::{HttpFileStore, LocalFileStore};

use crate::parser::FileHint;
use crate::task::ExecutionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webpilot_foundation::{ArtifactConfig, Error, FileStore, Result};

/// A captured output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    pub execution_id: ExecutionId,
    pub session_id: String,
    pub file_name: String,

    /// Where the worker wrote the file
    pub source_path: PathBuf,

    /// Copy in the managed downloads area (removed after upload)
    pub managed_path: PathBuf,

    /// Set when the upload succeeded
    pub remote_url: Option<String>,

    pub size: u64,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Upload failure reason; the managed copy is kept in that case
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArtifactRecord {
    pub fn is_uploaded(&self) -> bool {
        self.remote_url.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

type RecordKey = (ExecutionId, String);

/// Managed copy name: `<session>_<timestamp ms>_<file name>`
fn managed_file_name(session_id: &str, file_name: &str) -> String {
    let session: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}_{}", session, Utc::now().timestamp_millis(), file_name)
}

/// Remote key: `{prefix}/{session}/{execution}/{file}`, so executions
/// sharing a session never overwrite each other's files
fn upload_destination(
    prefix: &str,
    session_id: &str,
    execution_id: ExecutionId,
    file_name: &str,
) -> String {
    format!(
        "{}/{}/{}/{}",
        prefix.trim_matches('/'),
        session_id,
        execution_id,
        file_name
    )
}

/// Tracks artifacts per `(execution, session)`
pub struct ArtifactTracker {
    config: ArtifactConfig,
    store: Arc<dyn FileStore>,

    /// Working directories of the worker process
    worker_dirs: Vec<PathBuf>,

    records: Mutex<HashMap<RecordKey, Vec<ArtifactRecord>>>,

    /// In-flight capture jobs per execution
    pending: Mutex<HashMap<ExecutionId, Vec<JoinHandle<()>>>>,

    /// Directories where artifacts were found before
    seen_dirs: Mutex<Vec<PathBuf>>,
}

impl ArtifactTracker {
    pub fn new(config: ArtifactConfig, store: Arc<dyn FileStore>) -> Self {
        Self {
            config,
            store,
            worker_dirs: Vec::new(),
            records: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seen_dirs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_worker_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.worker_dirs = dirs;
        self
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    // ========================================================================
    // Capture
    // ========================================================================

    /// Start capturing a hinted file in the background
    pub fn track_creation(self: &Arc<Self>, hint: FileHint, execution_id: ExecutionId, session_id: &str) {
        let tracker = Arc::clone(self);
        let session_id = session_id.to_string();
        let handle = tokio::spawn(async move {
            let file_name = hint.file_name.clone();
            match tracker.capture(hint, execution_id, &session_id).await {
                Ok(Some(record)) => {
                    tracker.insert(record);
                }
                Ok(None) => {}
                Err(e) => warn!(file = %file_name, execution_id = %execution_id, "Artifact capture failed: {}", e),
            }
        });

        self.pending.lock().entry(execution_id).or_default().push(handle);
    }

    /// Wait for every capture started for an execution
    pub async fn await_pending(&self, execution_id: ExecutionId) {
        let handles = self.pending.lock().remove(&execution_id).unwrap_or_default();
        if handles.is_empty() {
            return;
        }
        debug!(execution_id = %execution_id, count = handles.len(), "Waiting for artifact captures");
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Artifact capture task panicked: {}", e);
            }
        }
    }

    async fn capture(
        &self,
        hint: FileHint,
        execution_id: ExecutionId,
        session_id: &str,
    ) -> Result<Option<ArtifactRecord>> {
        let source = match hint.path {
            Some(path) => path,
            None => {
                tokio::time::sleep(self.config.hint_grace()).await;
                match self.search_plan().find(&hint.file_name).await {
                    Some(path) => path,
                    None => {
                        warn!(file = %hint.file_name, "Hinted file not found in any candidate directory");
                        return Ok(None);
                    }
                }
            }
        };

        let meta = tokio::fs::metadata(&source).await?;
        if !meta.is_file() {
            return Err(Error::NotFound(format!("{} is not a file", source.display())));
        }
        if let Some(parent) = source.parent() {
            self.remember_dir(parent);
        }

        let downloads = self.config.downloads_dir();
        tokio::fs::create_dir_all(&downloads).await?;
        let managed = downloads.join(managed_file_name(session_id, &hint.file_name));
        let size = tokio::fs::copy(&source, &managed).await?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl()).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut record = ArtifactRecord {
            id: Uuid::new_v4().to_string(),
            execution_id,
            session_id: session_id.to_string(),
            file_name: hint.file_name.clone(),
            source_path: source,
            managed_path: managed.clone(),
            remote_url: None,
            size,
            provider: self.store.name().to_string(),
            created_at: now,
            expires_at: now + ttl,
            error: None,
        };

        let destination = upload_destination(
            &self.config.upload_prefix,
            session_id,
            execution_id,
            &hint.file_name,
        );
        match self.upload(&managed, &destination).await {
            Ok(receipt) => {
                record.remote_url = Some(receipt.url);
                record.size = receipt.size;
                record.provider = receipt.provider;
                if let Err(e) = tokio::fs::remove_file(&managed).await {
                    warn!(path = %managed.display(), "Failed to remove managed copy: {}", e);
                }
                info!(file = %record.file_name, execution_id = %execution_id, "Artifact uploaded");
            }
            Err(e) => {
                warn!(file = %record.file_name, "Upload failed, keeping local copy: {}", e);
                record.error = Some(e.to_string());
            }
        }

        Ok(Some(record))
    }

    async fn upload(&self, managed: &Path, destination: &str) -> Result<webpilot_foundation::UploadReceipt> {
        let file = tokio::fs::File::open(managed).await?;
        self.store.upload(file, destination).await
    }

    fn search_plan(&self) -> SearchPlan {
        SearchPlan {
            worker_dirs: self.worker_dirs.clone(),
            search_dirs: self.config.search_dirs.clone(),
            seen_dirs: self.seen_dirs.lock().clone(),
            temp_dir: Some(std::env::temp_dir()),
            scratch_prefix: self.config.scratch_prefix.clone(),
        }
    }

    fn remember_dir(&self, dir: &Path) {
        let mut seen = self.seen_dirs.lock();
        if !seen.iter().any(|d| d == dir) {
            seen.push(dir.to_path_buf());
        }
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Add a record unless the same file and URL is already tracked
    fn insert(self: &Arc<Self>, record: ArtifactRecord) -> bool {
        let key = (record.execution_id, record.session_id.clone());
        {
            let mut records = self.records.lock();
            let entries = records.entry(key).or_default();
            if entries
                .iter()
                .any(|r| r.file_name == record.file_name && r.remote_url == record.remote_url)
            {
                debug!(file = %record.file_name, "Artifact already tracked");
                return false;
            }
            entries.push(record.clone());
        }
        self.schedule_expiry(record.id, record.expires_at);
        true
    }

    fn schedule_expiry(self: &Arc<Self>, id: String, expires_at: DateTime<Utc>) {
        let tracker: Weak<Self> = Arc::downgrade(self);
        let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.remove(&id);
            }
        });
    }

    fn remove(&self, id: &str) {
        let mut records = self.records.lock();
        for entries in records.values_mut() {
            entries.retain(|r| r.id != id);
        }
        records.retain(|_, entries| !entries.is_empty());
    }

    /// Artifacts of one execution in one session
    pub fn get_artifacts(&self, execution_id: ExecutionId, session_id: &str) -> Vec<ArtifactRecord> {
        self.records
            .lock()
            .get(&(execution_id, session_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total tracked records
    pub fn len(&self) -> usize {
        self.records.lock().values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.lock();
        let mut removed = 0;
        for entries in records.values_mut() {
            let before = entries.len();
            entries.retain(|r| !r.is_expired(now));
            removed += before - entries.len();
        }
        records.retain(|_, entries| !entries.is_empty());
        if removed > 0 {
            info!(removed, "Swept expired artifact records");
        }
        removed
    }

    /// Periodic bulk sweep; ends when the tracker is dropped
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        let period = self.config.sweep_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match tracker.upgrade() {
                    Some(tracker) => {
                        tracker.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::HintStyle;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use webpilot_foundation::UploadReceipt;

    struct FailingStore;

    #[async_trait]
    impl FileStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn upload(&self, _content: tokio::fs::File, destination: &str) -> Result<UploadReceipt> {
            Err(Error::upload(destination, "service unavailable"))
        }
    }

    fn config(downloads: &Path) -> ArtifactConfig {
        ArtifactConfig {
            downloads_dir: Some(downloads.to_path_buf()),
            hint_grace_ms: 10,
            ..ArtifactConfig::default()
        }
    }

    fn generic(name: &str) -> FileHint {
        FileHint {
            file_name: name.to_string(),
            path: None,
            style: HintStyle::Generic,
        }
    }

    fn managed_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_generic_hint_is_located_uploaded_and_cleaned() {
        let worker = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let store_root = TempDir::new().unwrap();
        std::fs::write(worker.path().join("report.csv"), "x,y\n").unwrap();

        let tracker = Arc::new(
            ArtifactTracker::new(
                config(downloads.path()),
                Arc::new(LocalFileStore::new(store_root.path())),
            )
            .with_worker_dirs(vec![worker.path().to_path_buf()]),
        );
        let exec = ExecutionId::new();
        tracker.track_creation(generic("report.csv"), exec, "s1");
        tracker.await_pending(exec).await;

        let artifacts = tracker.get_artifacts(exec, "s1");
        assert_eq!(artifacts.len(), 1);
        // same file and URL is never tracked twice
        assert!(!tracker.insert(artifacts[0].clone()));
        assert_eq!(tracker.len(), 1);
        assert_eq!(artifacts[0].file_name, "report.csv");
        assert_eq!(artifacts[0].provider, "local");
        assert!(artifacts[0].is_uploaded());
        assert_eq!(managed_files(downloads.path()), 0);
        assert!(store_root
            .path()
            .join(format!("browser-use/s1/{}/report.csv", exec))
            .exists());
    }

    #[tokio::test]
    async fn test_same_file_from_two_executions_kept_apart() {
        let worker = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let store_root = TempDir::new().unwrap();

        let tracker = Arc::new(
            ArtifactTracker::new(
                config(downloads.path()),
                Arc::new(LocalFileStore::new(store_root.path())),
            )
            .with_worker_dirs(vec![worker.path().to_path_buf()]),
        );

        let first = ExecutionId::new();
        std::fs::write(worker.path().join("report.csv"), "first").unwrap();
        tracker.track_creation(generic("report.csv"), first, "s1");
        tracker.await_pending(first).await;

        let second = ExecutionId::new();
        std::fs::write(worker.path().join("report.csv"), "second run").unwrap();
        tracker.track_creation(generic("report.csv"), second, "s1");
        tracker.await_pending(second).await;

        let a = &tracker.get_artifacts(first, "s1")[0];
        let b = &tracker.get_artifacts(second, "s1")[0];
        assert_ne!(a.remote_url, b.remote_url);
        let stored = |exec: ExecutionId| {
            std::fs::read_to_string(store_root.path().join(format!("browser-use/s1/{}/report.csv", exec)))
                .unwrap()
        };
        assert_eq!(stored(first), "first");
        assert_eq!(stored(second), "second run");
    }

    #[tokio::test]
    async fn test_attachment_hint_reads_path_directly() {
        let elsewhere = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let store_root = TempDir::new().unwrap();
        let path = elsewhere.path().join("invoice.pdf");
        std::fs::write(&path, "%PDF").unwrap();

        let tracker = Arc::new(ArtifactTracker::new(
            config(downloads.path()),
            Arc::new(LocalFileStore::new(store_root.path())),
        ));
        let exec = ExecutionId::new();
        let hint = FileHint {
            file_name: "invoice.pdf".to_string(),
            path: Some(path.clone()),
            style: HintStyle::Attachment,
        };
        tracker.track_creation(hint, exec, "s1");
        tracker.await_pending(exec).await;

        let artifacts = tracker.get_artifacts(exec, "s1");
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].source_path, path);
        assert_eq!(artifacts[0].size, 4);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_local_copy() {
        let worker = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        std::fs::write(worker.path().join("data.json"), "{}").unwrap();

        let tracker = Arc::new(
            ArtifactTracker::new(config(downloads.path()), Arc::new(FailingStore))
                .with_worker_dirs(vec![worker.path().to_path_buf()]),
        );
        let exec = ExecutionId::new();
        tracker.track_creation(generic("data.json"), exec, "session/1");
        tracker.await_pending(exec).await;

        let artifacts = tracker.get_artifacts(exec, "session/1");
        assert_eq!(artifacts.len(), 1);
        assert!(!artifacts[0].is_uploaded());
        assert!(artifacts[0].error.as_deref().unwrap().contains("service unavailable"));
        assert!(artifacts[0].managed_path.exists());
        let name = artifacts[0].managed_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("session_1_"));
        assert!(name.ends_with("_data.json"));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_tracked() {
        let downloads = TempDir::new().unwrap();
        let store_root = TempDir::new().unwrap();
        let tracker = Arc::new(ArtifactTracker::new(
            config(downloads.path()),
            Arc::new(LocalFileStore::new(store_root.path())),
        ));
        let exec = ExecutionId::new();
        tracker.track_creation(generic("nowhere-7f3a.csv"), exec, "s1");
        tracker.await_pending(exec).await;
        assert!(tracker.get_artifacts(exec, "s1").is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let worker = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let store_root = TempDir::new().unwrap();
        std::fs::write(worker.path().join("a.txt"), "a").unwrap();

        let short_ttl = ArtifactConfig {
            ttl_secs: 0,
            ..config(downloads.path())
        };
        let tracker = Arc::new(
            ArtifactTracker::new(short_ttl, Arc::new(LocalFileStore::new(store_root.path())))
                .with_worker_dirs(vec![worker.path().to_path_buf()]),
        );
        let exec = ExecutionId::new();
        tracker.track_creation(generic("a.txt"), exec, "s1");
        tracker.await_pending(exec).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tracker.is_empty());
        assert_eq!(tracker.sweep_expired(), 0);
    }
}
