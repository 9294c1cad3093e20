//! Main DuraStore - the primary entry point for the durability subsystem
//!
//! DuraStore wires together the storage layer manager, the cross-instance
//! write coordinator, the backup lifecycle, and the replication engine behind
//! one facade:
//! - Every save fans out across all storage layers and reports per-layer
//!   outcomes
//! - Writes are announced on the coordination channel so concurrent
//!   instances can surface races
//! - Local changes feed the replication queue when a remote is attached
//! - A zero-success save triggers an emergency snapshot of whatever is still
//!   readable
//!
//! # Example
//!
//! ```ignore
//! use durastore_core::{DuraStore, StoreConfig, LogicalKey};
//!
//! let store = DuraStore::open("~/.durastore/data", StoreConfig::default()).await?;
//!
//! let outcome = store.save(LogicalKey::Tasks, serde_json::json!([{"id": 1}])).await?;
//! if outcome.has_warnings() {
//!     // another instance wrote concurrently, or some layer failed
//! }
//!
//! let tasks = store.load_or_empty(LogicalKey::Tasks);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::backup::{
    BackupKind, BackupManager, BackupSnapshot, RestoreOptions, RestoreReport,
};
use crate::config::{RemoteConfig, StoreConfig};
use crate::coordinator::{origin_channel, WriteCoordinator, WriteRace};
use crate::error::StoreResult;
use crate::layers::{SaveReport, StorageLayerDescriptor, StorageLayerManager};
use crate::replication::{
    RemoteReplica, ReplicationSyncEngine, SyncEvent, SyncOnceReport, SyncState,
};
use crate::types::{BackupId, DocId, LogicalKey, TabId};

/// Combined result of one save: per-layer persistence outcome plus any
/// coordination warnings
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub report: SaveReport,
    /// Concurrent writers detected on the same document
    pub races: Vec<WriteRace>,
    /// True when coordination was unavailable and the save proceeded
    /// without it
    pub degraded: bool,
}

impl SaveOutcome {
    pub fn has_warnings(&self) -> bool {
        !self.races.is_empty() || self.degraded || !self.report.failed.is_empty()
    }
}

/// Main entry point for the durability subsystem
pub struct DuraStore {
    config: StoreConfig,
    layers: Arc<StorageLayerManager>,
    coordinator: WriteCoordinator,
    backups: BackupManager,
    /// Swapped out wholesale when a remote is attached
    replication: RwLock<Arc<ReplicationSyncEngine>>,
    data_dir: PathBuf,
}

impl DuraStore {
    /// Open a store rooted at the given data directory.
    ///
    /// This will:
    /// - Create the data directory if it doesn't exist
    /// - Probe and rank the storage layers
    /// - Join the write coordination channel under a fresh tab id
    /// - Start the auto-backup timer when enabled in config
    pub async fn open(data_dir: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let store = Self::open_inner(data_dir, config).await?;
        if let Some(remote) = &store.config.remote {
            // The endpoint alone is not enough; a transport has to be
            // attached before anything replicates
            warn!(
                url = %remote.url,
                "Remote endpoint configured but no replica transport attached, staying local-only"
            );
        }
        Ok(store)
    }

    /// Open a store and connect the configured remote endpoint through a
    /// replica factory.
    ///
    /// The factory maps the config's remote endpoint to a concrete
    /// [`RemoteReplica`] transport; it is never called when no remote is
    /// configured, and the live session starts per `live_sync`.
    pub async fn open_with_replica<F>(
        data_dir: impl AsRef<Path>,
        config: StoreConfig,
        factory: F,
    ) -> StoreResult<Self>
    where
        F: FnOnce(&RemoteConfig) -> StoreResult<Arc<dyn RemoteReplica>>,
    {
        let store = Self::open_inner(data_dir, config).await?;
        if let Some(remote_cfg) = store.config.remote.clone() {
            let replica = factory(&remote_cfg)?;
            store.attach_remote(replica);
        }
        Ok(store)
    }

    async fn open_inner(data_dir: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let layers = Arc::new(StorageLayerManager::open(&data_dir)?);
        let coordinator = WriteCoordinator::new(TabId::new(), origin_channel());

        let backups = BackupManager::new(
            layers.clone(),
            config.retention_cap,
            config.auto_backup_enabled,
        );
        if config.auto_backup_enabled {
            backups.start_auto_backup(config.backup_interval_minutes);
        }

        let replication = Arc::new(ReplicationSyncEngine::new(
            layers.clone(),
            None,
            config.batch_size,
            config.retry_on_error,
        ));

        info!(data_dir = %data_dir.display(), tab_id = %coordinator.tab_id(), "Store opened");
        Ok(Self {
            config,
            layers,
            coordinator,
            backups,
            replication: RwLock::new(replication),
            data_dir,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Current state of each storage layer, in reliability order
    pub fn layer_descriptors(&self) -> Vec<StorageLayerDescriptor> {
        self.layers.layer_descriptors()
    }

    /// Re-probe layers that were marked unavailable
    pub fn reset_layer_probe(&self) {
        self.layers.reset_probe();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Save / Load
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist a value under a logical key across every layer.
    ///
    /// The write is announced on the coordination channel first, so the
    /// outcome includes any concurrent writers seen during the wait window.
    /// The data write itself is never blocked by coordination. A save that
    /// succeeds on no layer triggers an emergency snapshot before returning.
    pub async fn save(&self, key: LogicalKey, value: serde_json::Value) -> StoreResult<SaveOutcome> {
        let doc_id = DocId::from(key);
        let grant = self.coordinator.begin_write(&doc_id).await;

        let report = self.layers.save(key, value.clone());

        if report.success_count() == 0 {
            warn!(%key, "Save failed on every layer, taking emergency snapshot");
            self.take_emergency_backup();
        } else {
            self.replication
                .read()
                .record_local_change(key.as_str(), value);
        }

        self.coordinator.end_write(&doc_id);
        Ok(SaveOutcome {
            report,
            races: grant.races,
            degraded: grant.degraded,
        })
    }

    /// Load a value, trying layers in reliability order
    pub fn load(&self, key: LogicalKey) -> StoreResult<Option<serde_json::Value>> {
        self.layers.load(key)
    }

    /// Load a value, falling back to the key's empty shape
    pub fn load_or_empty(&self, key: LogicalKey) -> serde_json::Value {
        self.layers.load_or_empty(key)
    }

    /// Which instance currently holds an active write claim on a document
    pub fn document_locked_by(&self, key: LogicalKey) -> Option<TabId> {
        self.coordinator.is_document_locked(&DocId::from(key))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Backups
    // ═══════════════════════════════════════════════════════════════════════

    /// Snapshot the current data and add it to history
    pub fn create_manual_backup(&self) -> StoreResult<BackupSnapshot> {
        let snapshot = self.backups.create_backup(BackupKind::Manual)?;
        self.backups.save_to_history(snapshot.clone())?;
        Ok(snapshot)
    }

    pub fn list_backups(&self) -> StoreResult<Vec<BackupSnapshot>> {
        self.backups.list_backups()
    }

    pub fn get_backup(&self, id: &BackupId) -> StoreResult<Option<BackupSnapshot>> {
        self.backups.get_backup(id)
    }

    pub fn restore_backup(
        &self,
        id: &BackupId,
        options: &RestoreOptions,
    ) -> StoreResult<RestoreReport> {
        self.backups.restore_backup(id, options)
    }

    pub fn delete_backup(&self, id: &BackupId) -> StoreResult<()> {
        self.backups.delete_backup(id)
    }

    pub fn export_backup(&self, id: &BackupId) -> StoreResult<String> {
        self.backups.export_backup(id)
    }

    pub fn import_backup(&self, serialized: &str) -> StoreResult<BackupSnapshot> {
        self.backups.import_backup(serialized)
    }

    pub fn is_auto_backup_running(&self) -> bool {
        self.backups.is_auto_backup_running()
    }

    fn take_emergency_backup(&self) {
        match self
            .backups
            .create_backup(BackupKind::Emergency)
            .and_then(|snapshot| self.backups.save_to_history(snapshot))
        {
            Ok(()) => info!("Emergency snapshot retained"),
            // Likely the same layer failure that triggered us
            Err(e) => warn!(error = %e, "Emergency snapshot could not be retained"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Replication
    // ═══════════════════════════════════════════════════════════════════════

    /// Connect a remote replica, replacing the local-only engine.
    ///
    /// Starts the live session immediately when `live_sync` is enabled in
    /// config. Changes queued before attachment belong to the old engine and
    /// are not carried over; a manual sync after attaching pushes the full
    /// current state via [`DuraStore::trigger_manual_sync`].
    pub fn attach_remote(&self, remote: Arc<dyn RemoteReplica>) {
        let engine = Arc::new(ReplicationSyncEngine::new(
            self.layers.clone(),
            Some(remote),
            self.config.batch_size,
            self.config.retry_on_error,
        ));
        if self.config.live_sync {
            engine.start_live_sync();
        }
        *self.replication.write() = engine;
        info!("Remote replica attached");
    }

    /// Whether any remote replica is attached
    pub fn is_local_only(&self) -> bool {
        self.replication.read().is_local_only()
    }

    pub fn sync_status(&self) -> SyncState {
        self.replication.read().state()
    }

    pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.replication.read().subscribe()
    }

    /// One-shot push-then-pull, independent of the live session
    pub fn trigger_manual_sync(&self) -> StoreResult<SyncOnceReport> {
        self.replication.read().sync_once()
    }

    /// Tear down live streams while keeping queued changes
    pub fn set_offline(&self) {
        self.replication.read().set_offline();
    }

    /// Rebuild live streams after connectivity returns
    pub fn set_online(&self) {
        self.replication.read().set_online();
    }

    pub fn has_pending_changes(&self) -> bool {
        self.replication.read().state().pending_changes > 0
    }

    pub fn has_sync_errors(&self) -> bool {
        !self.replication.read().state().error_log.is_empty()
    }

    pub fn clear_sync_errors(&self) {
        self.replication.read().clear_errors();
    }

    /// Stop background work: the live session and the auto-backup timer.
    ///
    /// Also runs on drop; exposed for callers that want a deterministic
    /// shutdown point.
    pub fn shutdown(&self) {
        self.replication.read().stop();
        self.backups.stop_auto_backup();
        info!("Store shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::MemoryReplica;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store() -> (DuraStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig {
            auto_backup_enabled: false,
            ..StoreConfig::default()
        };
        let store = DuraStore::open(temp.path(), config).await.unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (store, _temp) = open_store().await;

        let outcome = store
            .save(LogicalKey::Tasks, json!([{"id": 1, "title": "water the beds"}]))
            .await
            .unwrap();
        assert!(outcome.report.is_success());
        assert!(!outcome.degraded);

        let loaded = store.load(LogicalKey::Tasks).unwrap().unwrap();
        assert_eq!(loaded, json!([{"id": 1, "title": "water the beds"}]));
    }

    #[tokio::test]
    async fn test_load_or_empty_for_missing_key() {
        let (store, _temp) = open_store().await;
        assert_eq!(store.load_or_empty(LogicalKey::Projects), json!([]));
        assert_eq!(store.load_or_empty(LogicalKey::Settings), json!({}));
    }

    #[tokio::test]
    async fn test_manual_backup_and_restore_through_facade() {
        let (store, _temp) = open_store().await;

        store
            .save(LogicalKey::Tasks, json!([{"id": 1}]))
            .await
            .unwrap();
        let backup = store.create_manual_backup().unwrap();

        store
            .save(LogicalKey::Tasks, json!([{"id": 2}]))
            .await
            .unwrap();

        let report = store
            .restore_backup(&backup.id, &RestoreOptions::default())
            .unwrap();
        assert!(report.success);
        assert_eq!(
            store.load(LogicalKey::Tasks).unwrap().unwrap(),
            json!([{"id": 1}])
        );
    }

    #[tokio::test]
    async fn test_local_only_until_remote_attached() {
        let (store, _temp) = open_store().await;
        assert!(store.is_local_only());
        assert!(store.trigger_manual_sync().is_err());

        let remote = Arc::new(MemoryReplica::new());
        store.attach_remote(remote.clone() as Arc<dyn RemoteReplica>);
        assert!(!store.is_local_only());

        store
            .save(LogicalKey::Tasks, json!([{"id": 7}]))
            .await
            .unwrap();
        assert!(store.has_pending_changes());

        let report = store.trigger_manual_sync().unwrap();
        assert_eq!(report.pushed, 1);
        assert!(!store.has_pending_changes());
        assert_eq!(remote.document("tasks").unwrap(), json!([{"id": 7}]));
    }

    #[tokio::test]
    async fn test_configured_remote_connects_through_replica_factory() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig {
            remote: Some(RemoteConfig {
                url: "https://replica.example/db".to_string(),
                username: None,
                password: None,
            }),
            live_sync: false,
            auto_backup_enabled: false,
            ..StoreConfig::default()
        };

        let remote = Arc::new(MemoryReplica::new());
        let replica = remote.clone();
        let store = DuraStore::open_with_replica(temp.path(), config, move |cfg| {
            assert_eq!(cfg.url, "https://replica.example/db");
            Ok(replica as Arc<dyn RemoteReplica>)
        })
        .await
        .unwrap();
        assert!(!store.is_local_only());

        store
            .save(LogicalKey::Tasks, json!([{"id": 3}]))
            .await
            .unwrap();
        store.trigger_manual_sync().unwrap();
        assert_eq!(remote.document("tasks").unwrap(), json!([{"id": 3}]));
    }

    #[tokio::test]
    async fn test_replica_factory_skipped_without_remote_config() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig {
            auto_backup_enabled: false,
            ..StoreConfig::default()
        };
        let store = DuraStore::open_with_replica(
            temp.path(),
            config,
            |_| -> StoreResult<Arc<dyn RemoteReplica>> {
                panic!("factory must not run without a configured remote")
            },
        )
        .await
        .unwrap();
        assert!(store.is_local_only());
    }

    #[tokio::test]
    async fn test_save_announces_and_releases_write_claim() {
        let (store, _temp) = open_store().await;

        store
            .save(LogicalKey::Canvas, json!({"zoom": 2.0}))
            .await
            .unwrap();
        // Claim released once the save returns
        assert!(store.document_locked_by(LogicalKey::Canvas).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_work() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::default();
        let store = DuraStore::open(temp.path(), config).await.unwrap();
        assert!(store.is_auto_backup_running());

        store.shutdown();
        assert!(!store.is_auto_backup_running());
        assert_eq!(store.sync_status().status, crate::replication::SyncStatus::Idle);
    }
}
