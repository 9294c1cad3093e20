//! Embedded transactional layer backed by redb.
//!
//! This is the most reliable tier: every write commits through a redb
//! transaction, so a record is either fully written or not written at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use tracing::warn;

use crate::error::StoreResult;
use crate::layers::{json_err, StorageLayer};
use crate::types::PersistedRecord;

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Storage layer using redb for ACID-compliant persistence
pub struct RedbLayer {
    /// `None` when the database failed to open (layer unavailable)
    db: Option<Arc<RwLock<Database>>>,
    path: PathBuf,
}

impl RedbLayer {
    /// Open or create the database at the given path.
    ///
    /// An open failure does not propagate; it leaves the layer unavailable
    /// so the manager falls through to the next tier.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let db = match Self::try_open(&path) {
            Ok(db) => Some(Arc::new(RwLock::new(db))),
            Err(e) => {
                warn!(?path, error = %e, "Embedded store failed to open");
                None
            }
        };
        Self { db, path }
    }

    fn try_open(path: &Path) -> StoreResult<Database> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Make sure the table exists so first reads don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageLayer for RedbLayer {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn reliability_rank(&self) -> u8 {
        0
    }

    fn is_available(&self) -> bool {
        self.db.is_some()
    }

    fn save(&self, record: &PersistedRecord) -> StoreResult<()> {
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| crate::error::StoreError::LayerUnavailable("embedded".to_string()))?;

        let data = serde_json::to_vec(record).map_err(json_err)?;
        let db = db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            table.insert(record.key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Option<PersistedRecord>> {
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| crate::error::StoreError::LayerUnavailable("embedded".to_string()))?;

        let db = db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        match table.get(key)? {
            Some(v) => {
                let record: PersistedRecord =
                    serde_json::from_slice(v.value()).map_err(json_err)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalKey;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_layer() -> (RedbLayer, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let layer = RedbLayer::open(temp_dir.path().join("test.redb"));
        (layer, temp_dir)
    }

    #[test]
    fn test_layer_opens_and_is_available() {
        let (layer, _temp) = create_test_layer();
        assert!(layer.is_available());
        assert_eq!(layer.name(), "embedded");
        assert_eq!(layer.reliability_rank(), 0);
    }

    #[test]
    fn test_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let layer = RedbLayer::open(temp_dir.path().join("nested/path/test.redb"));
        assert!(layer.is_available());
    }

    #[test]
    fn test_save_and_load_record() {
        let (layer, _temp) = create_test_layer();

        let record = PersistedRecord::new(LogicalKey::Tasks, json!([{"id": 7}]));
        layer.save(&record).unwrap();

        let loaded = layer.load("tasks").unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_nonexistent_key() {
        let (layer, _temp) = create_test_layer();
        assert!(layer.load("settings").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_is_atomic_per_key() {
        let (layer, _temp) = create_test_layer();

        let first = PersistedRecord::new(LogicalKey::Canvas, json!({"zoom": 1.0}));
        let second = PersistedRecord::new(LogicalKey::Canvas, json!({"zoom": 2.5}));
        layer.save(&first).unwrap();
        layer.save(&second).unwrap();

        let loaded = layer.load("canvas").unwrap().unwrap();
        assert_eq!(loaded.payload, json!({"zoom": 2.5}));
    }

    #[test]
    fn test_records_persist_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.redb");

        {
            let layer = RedbLayer::open(&path);
            let record = PersistedRecord::new(LogicalKey::Settings, json!({"lang": "en"}));
            layer.save(&record).unwrap();
        }

        {
            let layer = RedbLayer::open(&path);
            let loaded = layer.load("settings").unwrap().unwrap();
            assert_eq!(loaded.payload, json!({"lang": "en"}));
        }
    }
}
