//! Layered local storage with ordered failover.
//!
//! Several concrete persistence backends sit behind one [`StorageLayer`]
//! trait and are tried in reliability order:
//!
//! - embedded transactional store (redb), most reliable
//! - simple key-value store (one JSON file, atomic rename)
//! - download-style export (write-only dump files), last resort
//!
//! A save is fanned out to every available layer and succeeds when at least
//! one accepts it. A load walks the layers most-reliable-first and returns
//! the first record that deserializes and passes the schema check; the
//! manager does not cross-validate agreement between layers.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::types::{LogicalKey, PersistedRecord};

mod export_layer;
mod kv_layer;
mod redb_layer;

pub use export_layer::ExportLayer;
pub use kv_layer::KvFileLayer;
pub use redb_layer::RedbLayer;

/// One concrete persistence backend among several tried in priority order
pub trait StorageLayer: Send + Sync {
    /// Short stable name used in reports and logs
    fn name(&self) -> &'static str;

    /// Lower rank means more reliable; layers are tried in rank order
    fn reliability_rank(&self) -> u8;

    /// Whether this backend opened successfully on this device
    fn is_available(&self) -> bool;

    /// Persist one record. Must be atomic per key from the caller's view.
    fn save(&self, record: &PersistedRecord) -> StoreResult<()>;

    /// Load the record for a key, `None` when absent.
    fn load(&self, key: &str) -> StoreResult<Option<PersistedRecord>>;
}

/// Availability of one backend, discovered by feature-probing at startup
///
/// Immutable after discovery; re-probed only on explicit
/// [`StorageLayerManager::reset_probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayerDescriptor {
    pub name: &'static str,
    pub reliability_rank: u8,
    pub is_available: bool,
}

/// Outcome of one multi-layer save
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    /// Names of the layers that accepted the write
    pub succeeded: Vec<&'static str>,
    /// Layers that rejected the write, with the failure reason
    pub failed: Vec<(&'static str, String)>,
}

impl SaveReport {
    /// True when at least one layer accepted the write
    pub fn is_success(&self) -> bool {
        !self.succeeded.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }
}

/// Multi-layer storage manager with ordered fallback
pub struct StorageLayerManager {
    layers: Vec<Arc<dyn StorageLayer>>,
    descriptors: RwLock<Vec<StorageLayerDescriptor>>,
}

impl StorageLayerManager {
    /// Open every backend under `data_dir` and probe availability.
    ///
    /// A backend that fails to open is kept in the list as unavailable and
    /// skipped by save/load; opening the manager itself only fails if the
    /// data directory cannot be created.
    pub fn open(data_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let layers: Vec<Arc<dyn StorageLayer>> = vec![
            Arc::new(RedbLayer::open(data_dir.join("durastore.redb"))),
            Arc::new(KvFileLayer::open(data_dir.join("durastore-kv.json"))),
            Arc::new(ExportLayer::open(data_dir.join("exports"))),
        ];

        let manager = Self {
            layers,
            descriptors: RwLock::new(Vec::new()),
        };
        manager.reset_probe();

        let available = manager
            .descriptors
            .read()
            .iter()
            .filter(|d| d.is_available)
            .count();
        info!(
            total = manager.layers.len(),
            available, "Storage layers probed"
        );
        Ok(manager)
    }

    /// Build a manager from explicit layers (used by tests to force failures)
    pub fn with_layers(mut layers: Vec<Arc<dyn StorageLayer>>) -> Self {
        layers.sort_by_key(|l| l.reliability_rank());
        let manager = Self {
            layers,
            descriptors: RwLock::new(Vec::new()),
        };
        manager.reset_probe();
        manager
    }

    /// Re-run availability probing across all layers
    pub fn reset_probe(&self) {
        let descriptors = self
            .layers
            .iter()
            .map(|layer| StorageLayerDescriptor {
                name: layer.name(),
                reliability_rank: layer.reliability_rank(),
                is_available: layer.is_available(),
            })
            .collect();
        *self.descriptors.write() = descriptors;
    }

    /// The probed layer descriptors, most-reliable first
    pub fn layer_descriptors(&self) -> Vec<StorageLayerDescriptor> {
        self.descriptors.read().clone()
    }

    /// Write a value under a logical key to every available layer.
    ///
    /// Never fails purely because one layer did; the report lists which
    /// layers accepted the write. Zero successes are the caller's problem
    /// to surface (there is no retry at this level).
    pub fn save(&self, key: LogicalKey, value: serde_json::Value) -> SaveReport {
        let record = PersistedRecord::new(key, value);
        let mut report = SaveReport::default();

        for layer in &self.layers {
            if !self.is_layer_available(layer.name()) {
                report
                    .failed
                    .push((layer.name(), "unavailable".to_string()));
                continue;
            }
            match layer.save(&record) {
                Ok(()) => report.succeeded.push(layer.name()),
                Err(e) => {
                    warn!(key = %key, layer = layer.name(), error = %e, "Layer rejected write");
                    report.failed.push((layer.name(), e.to_string()));
                }
            }
        }

        debug!(
            key = %key,
            succeeded = report.success_count(),
            failed = report.failed.len(),
            "Save fanned out"
        );
        report
    }

    /// Load the value for a logical key, most-reliable-available wins.
    ///
    /// Corrupt data (parse failure) or a record written under a newer schema
    /// is treated the same as absence and the next layer is tried.
    pub fn load(&self, key: LogicalKey) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.load_record(key)?.map(|r| r.payload))
    }

    /// Load the full record for a logical key
    pub fn load_record(&self, key: LogicalKey) -> StoreResult<Option<PersistedRecord>> {
        for layer in &self.layers {
            if !self.is_layer_available(layer.name()) {
                continue;
            }
            match layer.load(key.as_str()) {
                Ok(Some(record)) if record.is_readable() => {
                    debug!(key = %key, layer = layer.name(), "Record loaded");
                    return Ok(Some(record));
                }
                Ok(Some(record)) => {
                    warn!(
                        key = %key,
                        layer = layer.name(),
                        schema_version = record.schema_version,
                        "Record written under newer schema, trying next layer"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, layer = layer.name(), error = %e, "Layer read failed, trying next");
                }
            }
        }
        Ok(None)
    }

    /// Load a value, falling back to the key's empty payload when absent
    pub fn load_or_empty(&self, key: LogicalKey) -> serde_json::Value {
        match self.load(key) {
            Ok(Some(value)) => value,
            Ok(None) => key.empty_payload(),
            Err(e) => {
                warn!(key = %key, error = %e, "Load failed, substituting empty payload");
                key.empty_payload()
            }
        }
    }

    fn is_layer_available(&self, name: &str) -> bool {
        self.descriptors
            .read()
            .iter()
            .any(|d| d.name == name && d.is_available)
    }
}

impl std::fmt::Debug for StorageLayerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLayerManager")
            .field("layers", &self.layer_descriptors())
            .finish()
    }
}

/// Convert a serde_json error into the crate error type
pub(crate) fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory layer with switchable failure modes, for manager tests
    pub struct FlakyLayer {
        name: &'static str,
        rank: u8,
        pub available: AtomicBool,
        pub fail_writes: AtomicBool,
        pub corrupt_reads: AtomicBool,
        records: Mutex<HashMap<String, PersistedRecord>>,
    }

    impl FlakyLayer {
        pub fn new(name: &'static str, rank: u8) -> Self {
            Self {
                name,
                rank,
                available: AtomicBool::new(true),
                fail_writes: AtomicBool::new(false),
                corrupt_reads: AtomicBool::new(false),
                records: Mutex::new(HashMap::new()),
            }
        }
    }

    impl StorageLayer for FlakyLayer {
        fn name(&self) -> &'static str {
            self.name
        }

        fn reliability_rank(&self) -> u8 {
            self.rank
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn save(&self, record: &PersistedRecord) -> StoreResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::LayerUnavailable(format!(
                    "{}: injected write failure",
                    self.name
                )));
            }
            self.records
                .lock()
                .insert(record.key.clone(), record.clone());
            Ok(())
        }

        fn load(&self, key: &str) -> StoreResult<Option<PersistedRecord>> {
            if self.corrupt_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Serialization(format!(
                    "{}: injected parse failure",
                    self.name
                )));
            }
            Ok(self.records.lock().get(key).cloned())
        }
    }
}
