//! Locating files announced by name only
//!
//! Candidate directories, highest priority first:
//! 1. the worker's working directories
//! 2. configured search directories
//! 3. directories where earlier artifacts were found
//! 4. the shared temp area
//! 5. worker scratch directories in the temp area (newest first), plus one
//!    nested level inside each

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Inputs for building the search order
#[derive(Debug, Clone, Default)]
pub struct SearchPlan {
    pub worker_dirs: Vec<PathBuf>,
    pub search_dirs: Vec<PathBuf>,
    pub seen_dirs: Vec<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub scratch_prefix: String,
}

impl SearchPlan {
    /// Ordered, de-duplicated candidate directories
    pub async fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();

        for dir in self
            .worker_dirs
            .iter()
            .chain(&self.search_dirs)
            .chain(&self.seen_dirs)
        {
            push(dir, &mut dirs);
        }

        if let Some(temp) = &self.temp_dir {
            push(temp, &mut dirs);
            for scratch in scratch_dirs(temp, &self.scratch_prefix).await {
                push(&scratch, &mut dirs);
                for nested in subdirs(&scratch).await {
                    push(&nested, &mut dirs);
                }
            }
        }

        dirs
    }

    /// First candidate directory holding `file_name`
    pub async fn find(&self, file_name: &str) -> Option<PathBuf> {
        for dir in self.candidate_dirs().await {
            let candidate = dir.join(file_name);
            match tokio::fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => {
                    debug!(file = %file_name, dir = %dir.display(), "Located artifact");
                    return Some(candidate);
                }
                _ => {}
            }
        }
        None
    }
}

fn push(dir: &Path, dirs: &mut Vec<PathBuf>) {
    if !dirs.iter().any(|d| d == dir) {
        dirs.push(dir.to_path_buf());
    }
}

/// Scratch directories under `temp`, newest first
async fn scratch_dirs(temp: &Path, prefix: &str) -> Vec<PathBuf> {
    if prefix.is_empty() {
        return Vec::new();
    }
    let Ok(mut entries) = tokio::fs::read_dir(temp).await else {
        return Vec::new();
    };

    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) {
            continue;
        }
        if let Ok(meta) = entry.metadata().await {
            if meta.is_dir() {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((modified, entry.path()));
            }
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.into_iter().map(|(_, path)| path).collect()
}

async fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map_or(false, |t| t.is_dir()) {
            found.push(entry.path());
        }
    }
    found.sort();
    found
}
