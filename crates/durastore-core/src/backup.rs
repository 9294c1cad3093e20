//! Backup lifecycle: periodic snapshots, bounded retention, integrity-checked
//! restore, and portable export/import.
//!
//! A backup is always a full snapshot of the tracked domain keys, never a
//! delta. History is bounded by the retention cap (insertion prepends,
//! eviction removes the oldest) and persisted through the same layer manager
//! as live data, under reserved logical keys.
//!
//! A restore is a best-effort multi-step sequence: per-key failures are
//! reported, keys already restored stay restored, and the optional
//! pre-restore safety snapshot is the recovery path; there is no automatic
//! rollback.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::layers::StorageLayerManager;
use crate::types::{epoch_ms, BackupId, LogicalKey, TRACKED_KEYS};

/// Version string stamped into portable backup files
pub const BACKUP_FORMAT_VERSION: &str = "1.0";

/// What triggered a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Auto,
    Manual,
    /// Taken when a save reported zero successful layers
    Emergency,
    /// Safety snapshot taken right before a restore
    PreRestore,
    CloudSync,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupKind::Auto => "auto",
            BackupKind::Manual => "manual",
            BackupKind::Emergency => "emergency",
            BackupKind::PreRestore => "pre-restore",
            BackupKind::CloudSync => "cloud-sync",
        };
        write!(f, "{}", s)
    }
}

/// Full copy of the tracked domain data at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub tasks: serde_json::Value,
    pub projects: serde_json::Value,
    pub canvas: serde_json::Value,
    pub settings: serde_json::Value,
}

impl BackupPayload {
    fn value_for(&self, key: LogicalKey) -> Option<&serde_json::Value> {
        match key {
            LogicalKey::Tasks => Some(&self.tasks),
            LogicalKey::Projects => Some(&self.projects),
            LogicalKey::Canvas => Some(&self.canvas),
            LogicalKey::Settings => Some(&self.settings),
            _ => None,
        }
    }

    /// Canonical serialized form the checksum is computed over
    fn canonical_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Immutable snapshot plus its integrity metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: BackupId,
    pub kind: BackupKind,
    /// Epoch ms at creation
    pub created_at: i64,
    pub payload: BackupPayload,
    /// blake3 hex digest of the canonical payload bytes
    pub checksum: String,
    pub size_bytes: usize,
}

impl BackupSnapshot {
    /// Whether the stored checksum still matches the payload.
    ///
    /// Corruption detection only; a mismatch downgrades to a warning at
    /// restore time, it never hard-blocks.
    pub fn verify_checksum(&self) -> bool {
        match self.payload.canonical_bytes() {
            Ok(bytes) => blake3::hash(&bytes).to_hex().to_string() == self.checksum,
            Err(_) => false,
        }
    }
}

/// Portable export format for manual transfer between devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub tasks: serde_json::Value,
    pub projects: serde_json::Value,
    pub canvas: serde_json::Value,
    pub settings: serde_json::Value,
    /// Epoch ms
    pub timestamp: i64,
    pub version: String,
}

/// Options controlling a restore attempt
#[derive(Clone)]
pub struct RestoreOptions {
    /// Snapshot current state first so the restore itself is recoverable
    pub pre_restore_snapshot: bool,
    /// Verify the checksum (mismatch warns, does not block)
    pub validate_checksum: bool,
    /// Invoked once the keys are written so domain collaborators can reload
    pub refresh: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            pre_restore_snapshot: true,
            validate_checksum: true,
            refresh: None,
        }
    }
}

impl std::fmt::Debug for RestoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreOptions")
            .field("pre_restore_snapshot", &self.pre_restore_snapshot)
            .field("validate_checksum", &self.validate_checksum)
            .field("refresh", &self.refresh.is_some())
            .finish()
    }
}

/// Structured outcome of a restore attempt
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// True only when every key was written successfully
    pub success: bool,
    /// Items restored per logical key
    pub per_key_counts: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Id of the safety snapshot, when one was taken
    pub pre_restore_backup_id: Option<BackupId>,
}

struct BackupInner {
    layers: Arc<StorageLayerManager>,
    retention_cap: usize,
    /// Administrative switch; the auto-backup timer skips ticks silently
    /// while this is false
    enabled: AtomicBool,
}

/// Manager for the backup lifecycle
pub struct BackupManager {
    inner: Arc<BackupInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BackupManager {
    pub fn new(layers: Arc<StorageLayerManager>, retention_cap: usize, enabled: bool) -> Self {
        Self {
            inner: Arc::new(BackupInner {
                layers,
                retention_cap: retention_cap.max(1),
                enabled: AtomicBool::new(enabled),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Enable or disable backups administratively
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshot Creation & History
    // ═══════════════════════════════════════════════════════════════════════

    /// Assemble a snapshot of the current tracked data.
    ///
    /// Reads through the layer manager; does not persist anything by itself.
    pub fn create_backup(&self, kind: BackupKind) -> StoreResult<BackupSnapshot> {
        self.inner.create_backup(kind)
    }

    /// Prepend a snapshot to history, persist it, and trim to the cap
    pub fn save_to_history(&self, snapshot: BackupSnapshot) -> StoreResult<()> {
        self.inner.save_to_history(snapshot)
    }

    /// Retained history, newest first
    pub fn list_backups(&self) -> StoreResult<Vec<BackupSnapshot>> {
        self.inner.load_history()
    }

    /// Fetch one retained snapshot by id
    pub fn get_backup(&self, id: &BackupId) -> StoreResult<Option<BackupSnapshot>> {
        Ok(self
            .inner
            .load_history()?
            .into_iter()
            .find(|b| &b.id == id))
    }

    /// Remove one entry from history; a no-op when absent
    pub fn delete_backup(&self, id: &BackupId) -> StoreResult<()> {
        let mut history = self.inner.load_history()?;
        let before = history.len();
        history.retain(|b| &b.id != id);
        if history.len() != before {
            self.inner.persist_history(&history)?;
            info!(%id, "Backup deleted");
        } else {
            debug!(%id, "Delete requested for unknown backup");
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Auto-Backup Timer
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the recurring auto-backup job.
    ///
    /// Idempotent: calling start twice never creates two timers. Ticks skip
    /// silently while backups are administratively disabled. The timer's
    /// lifecycle is independent of any caller's lifecycle; stop it via
    /// [`BackupManager::stop_auto_backup`].
    pub fn start_auto_backup(&self, interval_minutes: u64) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            debug!("Auto-backup timer already running");
            return;
        }

        info!(interval_minutes, "Starting auto-backup timer");
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let period = Duration::from_secs(interval_minutes.max(1) * 60);
            let mut interval = tokio::time::interval(period);
            // The immediate first tick would snapshot at startup; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                if !inner.enabled.load(Ordering::SeqCst) {
                    continue;
                }
                match inner
                    .create_backup(BackupKind::Auto)
                    .and_then(|snapshot| inner.save_to_history(snapshot))
                {
                    Ok(()) => debug!("Auto-backup tick complete"),
                    Err(e) => warn!(error = %e, "Auto-backup tick failed"),
                }
            }
        });
        *timer = Some(handle);
    }

    /// Cancel the recurring job via its handle
    pub fn stop_auto_backup(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            info!("Auto-backup timer stopped");
        }
    }

    pub fn is_auto_backup_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Restore
    // ═══════════════════════════════════════════════════════════════════════

    /// Restore a retained snapshot over the current data.
    ///
    /// Sequence: validate target → optional pre-restore snapshot → optional
    /// checksum validation (warns on mismatch) → overwrite each tracked key
    /// → report. Failures partway through do not roll back keys already
    /// restored.
    pub fn restore_backup(&self, id: &BackupId, options: &RestoreOptions) -> StoreResult<RestoreReport> {
        let snapshot = self
            .get_backup(id)?
            .ok_or_else(|| StoreError::BackupNotFound(id.to_string()))?;

        info!(%id, kind = %snapshot.kind, "Restore requested");
        let mut report = RestoreReport::default();

        if options.pre_restore_snapshot {
            match self
                .create_backup(BackupKind::PreRestore)
                .and_then(|safety| {
                    let safety_id = safety.id.clone();
                    self.save_to_history(safety)?;
                    Ok(safety_id)
                }) {
                Ok(safety_id) => {
                    debug!(%safety_id, "Pre-restore snapshot taken");
                    report.pre_restore_backup_id = Some(safety_id);
                }
                Err(e) => {
                    // Losing the safety net is worth a warning, not an abort
                    report
                        .warnings
                        .push(format!("pre-restore snapshot failed: {}", e));
                }
            }
        }

        if options.validate_checksum && !snapshot.verify_checksum() {
            warn!(%id, "Backup checksum mismatch");
            report.warnings.push(format!(
                "integrity check failed for backup {}: checksum mismatch",
                id
            ));
        }

        let mut all_ok = true;
        for key in TRACKED_KEYS {
            let value = snapshot
                .payload
                .value_for(key)
                .cloned()
                .unwrap_or_else(|| key.empty_payload());
            let count = payload_item_count(&value);

            let save = self.inner.layers.save(key, value);
            if save.is_success() {
                report.per_key_counts.insert(key.as_str().to_string(), count);
            } else {
                all_ok = false;
                report
                    .errors
                    .push(format!("restore of '{}' failed on every layer", key));
            }
        }

        if let Some(refresh) = &options.refresh {
            refresh();
        }

        report.success = all_ok;
        info!(
            %id,
            success = report.success,
            warnings = report.warnings.len(),
            errors = report.errors.len(),
            "Restore finished"
        );
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Export / Import
    // ═══════════════════════════════════════════════════════════════════════

    /// Serialize one retained snapshot to the portable file format
    pub fn export_backup(&self, id: &BackupId) -> StoreResult<String> {
        let snapshot = self
            .get_backup(id)?
            .ok_or_else(|| StoreError::BackupNotFound(id.to_string()))?;

        let file = BackupFile {
            tasks: snapshot.payload.tasks,
            projects: snapshot.payload.projects,
            canvas: snapshot.payload.canvas,
            settings: snapshot.payload.settings,
            timestamp: snapshot.created_at,
            version: BACKUP_FORMAT_VERSION.to_string(),
        };
        serde_json::to_string_pretty(&file).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Parse and validate a portable backup file, adding it to history.
    ///
    /// Performs the same structural validation as restore before accepting.
    pub fn import_backup(&self, serialized: &str) -> StoreResult<BackupSnapshot> {
        let file: BackupFile = serde_json::from_str(serialized)
            .map_err(|e| StoreError::InvalidBackup(e.to_string()))?;

        if !file.tasks.is_array() || !file.projects.is_array() {
            return Err(StoreError::InvalidBackup(
                "tasks and projects must be arrays".to_string(),
            ));
        }
        if !file.canvas.is_object() || !file.settings.is_object() {
            return Err(StoreError::InvalidBackup(
                "canvas and settings must be objects".to_string(),
            ));
        }

        let payload = BackupPayload {
            tasks: file.tasks,
            projects: file.projects,
            canvas: file.canvas,
            settings: file.settings,
        };
        let bytes = payload.canonical_bytes()?;
        let snapshot = BackupSnapshot {
            id: BackupId::new(),
            kind: BackupKind::Manual,
            created_at: file.timestamp,
            checksum: blake3::hash(&bytes).to_hex().to_string(),
            size_bytes: bytes.len(),
            payload,
        };

        self.save_to_history(snapshot.clone())?;
        info!(id = %snapshot.id, "Backup imported");
        Ok(snapshot)
    }
}

impl BackupInner {
    fn create_backup(&self, kind: BackupKind) -> StoreResult<BackupSnapshot> {
        let payload = BackupPayload {
            tasks: self.layers.load_or_empty(LogicalKey::Tasks),
            projects: self.layers.load_or_empty(LogicalKey::Projects),
            canvas: self.layers.load_or_empty(LogicalKey::Canvas),
            settings: self.layers.load_or_empty(LogicalKey::Settings),
        };

        let bytes = payload.canonical_bytes()?;
        let snapshot = BackupSnapshot {
            id: BackupId::new(),
            kind,
            created_at: epoch_ms(),
            checksum: blake3::hash(&bytes).to_hex().to_string(),
            size_bytes: bytes.len(),
            payload,
        };
        debug!(id = %snapshot.id, kind = %kind, size = snapshot.size_bytes, "Backup created");
        Ok(snapshot)
    }

    fn save_to_history(&self, snapshot: BackupSnapshot) -> StoreResult<()> {
        let mut history = self.load_history()?;
        let latest_id = snapshot.id.clone();
        history.insert(0, snapshot);
        history.truncate(self.retention_cap);
        self.persist_history(&history)?;

        let latest = serde_json::to_value(&latest_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let report = self.layers.save(LogicalKey::BackupLatest, latest);
        if !report.is_success() {
            return Err(StoreError::AllLayersFailed(
                LogicalKey::BackupLatest.as_str().to_string(),
            ));
        }
        debug!(%latest_id, retained = history.len(), "Backup history updated");
        Ok(())
    }

    fn load_history(&self) -> StoreResult<Vec<BackupSnapshot>> {
        match self.layers.load(LogicalKey::BackupHistory)? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn persist_history(&self, history: &[BackupSnapshot]) -> StoreResult<()> {
        let value = serde_json::to_value(history)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let report = self.layers.save(LogicalKey::BackupHistory, value);
        if !report.is_success() {
            return Err(StoreError::AllLayersFailed(
                LogicalKey::BackupHistory.as_str().to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for BackupManager {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

/// Number of restorable items in one key's payload (array length, or 1 for
/// a non-empty object)
fn payload_item_count(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => items.len(),
        serde_json::Value::Object(map) if map.is_empty() => 0,
        serde_json::Value::Object(_) => 1,
        _ => 0,
    }
}
