//! Simple key-value layer: one JSON file holding every record.
//!
//! The middle tier. Writes rewrite the whole map through a temp file and an
//! atomic rename, so a crash mid-write leaves the previous file intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::layers::{json_err, StorageLayer};
use crate::types::PersistedRecord;

/// File-backed key-value store
pub struct KvFileLayer {
    path: PathBuf,
    available: bool,
    /// Serializes the read-modify-rename cycle within this process
    write_guard: Mutex<()>,
}

impl KvFileLayer {
    /// Probe whether the backing file location is usable.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let available = match Self::probe(&path) {
            Ok(()) => true,
            Err(e) => {
                warn!(?path, error = %e, "Key-value store location unusable");
                false
            }
        };
        Self {
            path,
            available,
            write_guard: Mutex::new(()),
        }
    }

    fn probe(path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // An existing file must parse; otherwise start from an empty map
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            if !data.trim().is_empty() {
                serde_json::from_str::<HashMap<String, PersistedRecord>>(&data)
                    .map_err(json_err)?;
            }
        }
        Ok(())
    }

    fn read_map(&self) -> StoreResult<HashMap<String, PersistedRecord>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&data).map_err(json_err)
    }

    fn write_map(&self, map: &HashMap<String, PersistedRecord>) -> StoreResult<()> {
        let data = serde_json::to_vec(map).map_err(json_err)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageLayer for KvFileLayer {
    fn name(&self) -> &'static str {
        "key-value"
    }

    fn reliability_rank(&self) -> u8 {
        1
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn save(&self, record: &PersistedRecord) -> StoreResult<()> {
        if !self.available {
            return Err(StoreError::LayerUnavailable("key-value".to_string()));
        }
        let _guard = self.write_guard.lock();
        let mut map = self.read_map().unwrap_or_default();
        map.insert(record.key.clone(), record.clone());
        self.write_map(&map)
    }

    fn load(&self, key: &str) -> StoreResult<Option<PersistedRecord>> {
        if !self.available {
            return Err(StoreError::LayerUnavailable("key-value".to_string()));
        }
        Ok(self.read_map()?.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalKey;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_layer() -> (KvFileLayer, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let layer = KvFileLayer::open(temp_dir.path().join("kv.json"));
        (layer, temp_dir)
    }

    #[test]
    fn test_layer_opens_and_is_available() {
        let (layer, _temp) = create_test_layer();
        assert!(layer.is_available());
        assert_eq!(layer.name(), "key-value");
        assert_eq!(layer.reliability_rank(), 1);
    }

    #[test]
    fn test_save_and_load_record() {
        let (layer, _temp) = create_test_layer();

        let record = PersistedRecord::new(LogicalKey::Projects, json!([{"name": "orchard"}]));
        layer.save(&record).unwrap();

        let loaded = layer.load("projects").unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_nonexistent_key() {
        let (layer, _temp) = create_test_layer();
        assert!(layer.load("tasks").unwrap().is_none());
    }

    #[test]
    fn test_multiple_keys_coexist() {
        let (layer, _temp) = create_test_layer();

        layer
            .save(&PersistedRecord::new(LogicalKey::Tasks, json!([1])))
            .unwrap();
        layer
            .save(&PersistedRecord::new(LogicalKey::Settings, json!({"a": 1})))
            .unwrap();

        assert_eq!(layer.load("tasks").unwrap().unwrap().payload, json!([1]));
        assert_eq!(
            layer.load("settings").unwrap().unwrap().payload,
            json!({"a": 1})
        );
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kv.json");
        let layer = KvFileLayer::open(&path);

        layer
            .save(&PersistedRecord::new(LogicalKey::Canvas, json!({})))
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_makes_layer_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kv.json");
        std::fs::write(&path, "{definitely not json").unwrap();

        let layer = KvFileLayer::open(&path);
        assert!(!layer.is_available());
    }

    #[test]
    fn test_records_persist_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kv.json");

        {
            let layer = KvFileLayer::open(&path);
            layer
                .save(&PersistedRecord::new(LogicalKey::Tasks, json!(["persisted"])))
                .unwrap();
        }

        {
            let layer = KvFileLayer::open(&path);
            let loaded = layer.load("tasks").unwrap().unwrap();
            assert_eq!(loaded.payload, json!(["persisted"]));
        }
    }
}
