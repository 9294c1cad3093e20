//! Download-style export layer: write-only dump files.
//!
//! The last-resort tier. Every save drops a dated JSON file into an exports
//! directory so a user can always recover data by hand even when both real
//! stores are broken. Loads always report absence; this tier never
//! participates in the read path.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::layers::{json_err, StorageLayer};
use crate::types::PersistedRecord;

/// Write-only export tier
pub struct ExportLayer {
    dir: PathBuf,
    available: bool,
}

impl ExportLayer {
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let available = match std::fs::create_dir_all(&dir) {
            Ok(()) => true,
            Err(e) => {
                warn!(?dir, error = %e, "Export directory unusable");
                false
            }
        };
        Self { dir, available }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file a key's latest export lands in
    fn latest_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}_latest.json"))
    }
}

impl StorageLayer for ExportLayer {
    fn name(&self) -> &'static str {
        "export"
    }

    fn reliability_rank(&self) -> u8 {
        2
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn save(&self, record: &PersistedRecord) -> StoreResult<()> {
        if !self.available {
            return Err(StoreError::LayerUnavailable("export".to_string()));
        }
        let data = serde_json::to_vec_pretty(record).map_err(json_err)?;

        // One dated copy per day plus a rolling "latest"
        let date = chrono::Utc::now().format("%Y-%m-%d");
        let dated = self.dir.join(format!("{}_{date}.json", record.key));
        std::fs::write(&dated, &data)?;
        std::fs::write(self.latest_path(&record.key), &data)?;
        Ok(())
    }

    fn load(&self, _key: &str) -> StoreResult<Option<PersistedRecord>> {
        // Write-only tier
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalKey;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_layer_opens_and_is_available() {
        let temp = TempDir::new().unwrap();
        let layer = ExportLayer::open(temp.path().join("exports"));
        assert!(layer.is_available());
        assert_eq!(layer.name(), "export");
        assert_eq!(layer.reliability_rank(), 2);
    }

    #[test]
    fn test_save_writes_dated_and_latest_files() {
        let temp = TempDir::new().unwrap();
        let layer = ExportLayer::open(temp.path().join("exports"));

        let record = PersistedRecord::new(LogicalKey::Tasks, json!([{"id": 1}]));
        layer.save(&record).unwrap();

        let latest = layer.dir().join("tasks_latest.json");
        assert!(latest.exists());

        let restored: PersistedRecord =
            serde_json::from_str(&std::fs::read_to_string(latest).unwrap()).unwrap();
        assert_eq!(restored, record);

        let dated_count = std::fs::read_dir(layer.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tasks_2"))
            .count();
        assert_eq!(dated_count, 1);
    }

    #[test]
    fn test_load_is_always_absent() {
        let temp = TempDir::new().unwrap();
        let layer = ExportLayer::open(temp.path().join("exports"));

        let record = PersistedRecord::new(LogicalKey::Settings, json!({"x": 1}));
        layer.save(&record).unwrap();

        assert!(layer.load("settings").unwrap().is_none());
    }
}
