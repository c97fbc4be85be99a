//! Store configuration.

use crate::durable::write_json_atomic;
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the tunables file inside the store root.
pub const CONFIG_FILE: &str = "config.json";

/// Autosave configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Whether change notifications schedule saves at all.
    pub enabled: bool,

    /// Quiet period before a pending change is saved.
    pub debounce_ms: u64,
}

impl AutosaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 100,
        }
    }
}

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base path for the store.
    #[serde(skip)]
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    #[serde(skip)]
    pub create_if_missing: bool,

    /// Snapshot cache size (number of snapshots).
    pub snapshot_cache_size: usize,

    /// Write the mirror file when `main` is saved.
    pub mirror_sync: bool,

    pub autosave: AutosaveConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./folio"),
            create_if_missing: true,
            snapshot_cache_size: 256,
            mirror_sync: true,
            autosave: AutosaveConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Config rooted at `path` with default tunables.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Replace tunables with those stored in `<root>/config.json`, if any.
    ///
    /// `path` and `create_if_missing` are never taken from the file.
    pub(crate) fn merge_from_root(self, root: &Path) -> Result<Self> {
        let file = root.join(CONFIG_FILE);
        if !file.exists() {
            return Ok(self);
        }

        let data = std::fs::read(&file)?;
        let stored: StoreConfig = serde_json::from_slice(&data)
            .map_err(|e| StoreError::InvalidFormat(format!("{}: {}", file.display(), e)))?;

        Ok(Self {
            path: self.path,
            create_if_missing: self.create_if_missing,
            ..stored
        })
    }

    /// Write tunables to `<root>/config.json`.
    pub(crate) fn persist(&self, root: &Path) -> Result<()> {
        write_json_atomic(&root.join(CONFIG_FILE), self)
    }
}
