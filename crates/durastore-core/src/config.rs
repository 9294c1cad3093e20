//! Configuration surface for Durastore
//!
//! Absence of a remote endpoint means the store runs in local-only mode
//! permanently; that is not an error.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Remote replica endpoint and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Endpoint URL of the remote document store
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Recognized configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Remote replica; `None` means local-only mode
    pub remote: Option<RemoteConfig>,
    /// Keep a continuous two-way replication session running
    pub live_sync: bool,
    /// Let the replication session retry transient failures
    pub retry_on_error: bool,
    /// Maximum number of changes pushed per replication batch
    pub batch_size: usize,
    /// Minutes between automatic backups
    pub backup_interval_minutes: u64,
    /// Maximum number of backups retained in history
    pub retention_cap: usize,
    /// Whether the auto-backup timer takes snapshots at all
    pub auto_backup_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            remote: None,
            live_sync: true,
            retry_on_error: true,
            batch_size: 100,
            backup_interval_minutes: 30,
            retention_cap: 10,
            auto_backup_enabled: true,
        }
    }
}

impl StoreConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Save configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data =
            serde_json::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
