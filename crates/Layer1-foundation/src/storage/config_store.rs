//! Config file locations
//!
//! Two scopes hold a `config.json`: the user's config directory and the
//! project directory. Reads treat a missing file as "no overrides" but never
//! hide a malformed one.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name inside either scope directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Which config file a store points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// `<config dir>/webpilot/config.json`
    Global,
    /// `<cwd>/.webpilot/config.json`
    Project,
}

impl ConfigScope {
    /// Lowest precedence first
    pub const LOAD_ORDER: [ConfigScope; 2] = [ConfigScope::Global, ConfigScope::Project];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigScope::Global => "global",
            ConfigScope::Project => "project",
        }
    }
}

/// One scope's config file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Store rooted at an explicit directory
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_scope(scope: ConfigScope) -> Result<Self> {
        match scope {
            ConfigScope::Global => {
                let dir = dirs::config_dir()
                    .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?;
                Ok(Self::at(dir.join("webpilot")))
            }
            ConfigScope::Project => {
                let cwd = std::env::current_dir()
                    .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
                Ok(Self::project(cwd))
            }
        }
    }

    /// Project scope below `root`
    pub fn project(root: impl AsRef<Path>) -> Self {
        Self::at(root.as_ref().join(".webpilot"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// `None` when the file is absent, an error when it does not parse
    pub fn read<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Config(format!("Failed to read {}: {}", path.display(), e)))
            }
        };

        let value = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "{} is not valid (line {}, column {}): {}",
                path.display(),
                e.line(),
                e.column(),
                e
            ))
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(Some(value))
    }

    /// Write pretty JSON through a sibling temp file so readers never see a
    /// half-written config. Refuses to replace an existing file unless
    /// `overwrite` is set.
    pub fn write<T: Serialize>(&self, value: &T, overwrite: bool) -> Result<PathBuf> {
        let path = self.path();
        if !overwrite && path.exists() {
            return Err(Error::InvalidState(format!(
                "{} already exists",
                path.display()
            )));
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            Error::Config(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;

        let mut content = serde_json::to_string_pretty(value)?;
        content.push('\n');

        let staging = self.dir.join(format!(".{}.tmp", CONFIG_FILE_NAME));
        std::fs::write(&staging, content)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", staging.display(), e)))?;
        std::fs::rename(&staging, &path)
            .map_err(|e| Error::Config(format!("Failed to replace {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Wrote config file");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Limits {
        max_concurrent: usize,
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::project(dir.path());
        assert!(store.dir().ends_with(".webpilot"));
        assert!(!store.exists());
        assert!(store.read::<Limits>().unwrap().is_none());
    }

    #[test]
    fn test_write_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::at(dir.path().join("nested"));

        let path = store.write(&Limits { max_concurrent: 2 }, false).unwrap();
        assert_eq!(path, store.path());
        assert!(!store.dir().join(".config.json.tmp").exists());

        let err = store.write(&Limits { max_concurrent: 9 }, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(store.read::<Limits>().unwrap(), Some(Limits { max_concurrent: 2 }));

        store.write(&Limits { max_concurrent: 9 }, true).unwrap();
        assert_eq!(store.read::<Limits>().unwrap(), Some(Limits { max_concurrent: 9 }));
    }

    #[test]
    fn test_malformed_file_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::at(dir.path());
        std::fs::write(store.path(), "{\n  \"max_concurrent\": ,\n}").unwrap();

        let err = store.read::<Limits>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_scope_order() {
        assert_eq!(
            ConfigScope::LOAD_ORDER.map(|s| s.as_str()),
            ["global", "project"]
        );
    }
}
