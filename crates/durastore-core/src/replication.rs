//! Bidirectional replication against a remote document store.
//!
//! The engine keeps the local store and a remote replica converging through
//! two independent logical streams: push (local changes out) and pull
//! (remote changes in). Both run as background tasks whose events derive the
//! public [`SyncStatus`]. Individual replication errors accumulate in a
//! bounded log and are surfaced as events, never exceptions; the session's
//! own retry/backoff is relied on rather than reimplemented.
//!
//! Absence of a remote replica is not an error: the engine simply stays in
//! local-only mode permanently.
//!
//! Connectivity transitions tear the session down and rebuild it from
//! scratch; the underlying stream tasks are not safely reusable after
//! cancellation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::layers::StorageLayerManager;
use crate::types::{epoch_ms, LogicalKey};

/// How often the live streams look for work
const STREAM_INTERVAL: Duration = Duration::from_millis(500);

/// Backoff after a transient stream failure
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Bound on the accumulated error log
const MAX_ERROR_LOG: usize = 100;

/// Capacity of the sync event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Public status of the synchronization session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// No session running
    #[default]
    Idle,
    /// Data is flowing on at least one stream
    Syncing,
    /// Session exists but is caught up or backed off
    Paused,
    /// Both streams settled with nothing pending
    Complete,
    /// A stream reported an unrecovered error
    Error(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Paused => write!(f, "Paused"),
            SyncStatus::Complete => write!(f, "Complete"),
            SyncStatus::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

/// Snapshot of the engine's mutable sync state
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub status: SyncStatus,
    /// Epoch ms of the last successful one-shot or stream settle
    pub last_sync: Option<i64>,
    /// Local changes not yet pushed to the remote
    pub pending_changes: usize,
    /// Accumulated replication errors (bounded)
    pub error_log: Vec<String>,
}

/// Events emitted while replicating
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The derived status changed
    StatusChanged(SyncStatus),
    /// Remote changes were applied to the local store
    ChangesApplied { count: usize },
    /// A replication error occurred (also appended to the error log)
    SyncError { message: String },
}

/// One document change travelling between local store and replica
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub doc_id: String,
    pub payload: serde_json::Value,
    /// Remote sequence number; 0 for not-yet-pushed local changes
    pub seq: u64,
}

/// A batch of remote changes plus the cursor to resume from
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: Vec<DocChange>,
    pub last_seq: u64,
}

/// Seam to the remote document store.
///
/// Conflict resolution is the replica's own concern; this side only moves
/// whole-document payloads in both directions.
pub trait RemoteReplica: Send + Sync {
    fn ping(&self) -> StoreResult<()>;

    /// Push local changes; returns how many the replica accepted
    fn push(&self, changes: &[DocChange]) -> StoreResult<usize>;

    /// Pull remote changes made after `since`
    fn pull(&self, since: u64) -> StoreResult<ChangeBatch>;
}

/// In-process replica used by tests and demo mode
#[derive(Default)]
pub struct MemoryReplica {
    inner: Mutex<MemoryReplicaInner>,
}

#[derive(Default)]
struct MemoryReplicaInner {
    docs: HashMap<String, serde_json::Value>,
    log: Vec<DocChange>,
    seq: u64,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current replica-side copy of a document
    pub fn document(&self, doc_id: &str) -> Option<serde_json::Value> {
        self.inner.lock().docs.get(doc_id).cloned()
    }
}

impl RemoteReplica for MemoryReplica {
    fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn push(&self, changes: &[DocChange]) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        for change in changes {
            inner.seq += 1;
            let seq = inner.seq;
            inner
                .docs
                .insert(change.doc_id.clone(), change.payload.clone());
            inner.log.push(DocChange {
                doc_id: change.doc_id.clone(),
                payload: change.payload.clone(),
                seq,
            });
        }
        Ok(changes.len())
    }

    fn pull(&self, since: u64) -> StoreResult<ChangeBatch> {
        let inner = self.inner.lock();
        let changes: Vec<DocChange> = inner
            .log
            .iter()
            .filter(|c| c.seq > since)
            .cloned()
            .collect();
        let last_seq = changes.iter().map(|c| c.seq).max().unwrap_or(since);
        Ok(ChangeBatch { changes, last_seq })
    }
}

/// Result of a manual one-shot sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOnceReport {
    pub pushed: usize,
    pub pulled: usize,
}

/// Per-stream last-observed event, used to derive the public status
#[derive(Debug, Clone, PartialEq)]
enum StreamEvent {
    Active,
    Paused,
    Complete,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Push,
    Pull,
}

struct StreamStates {
    push: StreamEvent,
    pull: StreamEvent,
}

impl Default for StreamStates {
    fn default() -> Self {
        Self {
            push: StreamEvent::Paused,
            pull: StreamEvent::Paused,
        }
    }
}

/// State shared with the background stream tasks
struct Shared {
    state: Mutex<SyncState>,
    streams: Mutex<StreamStates>,
    /// Local changes awaiting push, coalesced per document
    pending: Mutex<Vec<DocChange>>,
    /// Last remote sequence applied locally
    pull_cursor: AtomicU64,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl Shared {
    fn record_error(&self, message: String) {
        let mut state = self.state.lock();
        if state.error_log.len() >= MAX_ERROR_LOG {
            state.error_log.remove(0);
        }
        state.error_log.push(message.clone());
        drop(state);
        let _ = self.event_tx.send(SyncEvent::SyncError { message });
    }

    fn set_status(&self, status: SyncStatus) {
        let changed = {
            let mut state = self.state.lock();
            if state.status == status {
                false
            } else {
                state.status = status.clone();
                true
            }
        };
        if changed {
            debug!(%status, "Sync status changed");
            let _ = self.event_tx.send(SyncEvent::StatusChanged(status));
        }
    }

    /// Fold one stream event into the derived status.
    ///
    /// `Syncing` is only ever entered on an `Active` event, which is what
    /// keeps the status from regressing out of `Complete` while nothing is
    /// actually flowing.
    fn apply_stream_event(&self, kind: StreamKind, event: StreamEvent) {
        if let StreamEvent::Error(message) = &event {
            self.record_error(format!("{:?} stream: {}", kind, message));
        }

        let derived = {
            let mut streams = self.streams.lock();
            match kind {
                StreamKind::Push => streams.push = event,
                StreamKind::Pull => streams.pull = event,
            }

            let pending = self.state.lock().pending_changes;
            match (&streams.push, &streams.pull) {
                (StreamEvent::Error(msg), _) | (_, StreamEvent::Error(msg)) => {
                    SyncStatus::Error(msg.clone())
                }
                (StreamEvent::Active, _) | (_, StreamEvent::Active) => SyncStatus::Syncing,
                (push, pull)
                    if pending == 0
                        && matches!(push, StreamEvent::Complete | StreamEvent::Paused)
                        && matches!(pull, StreamEvent::Complete | StreamEvent::Paused) =>
                {
                    SyncStatus::Complete
                }
                _ => SyncStatus::Paused,
            }
        };

        if derived == SyncStatus::Complete {
            // Only a transition counts; idle ticks that stay settled must
            // not creep the timestamp forward
            let mut state = self.state.lock();
            if state.status != SyncStatus::Complete {
                state.last_sync = Some(epoch_ms());
            }
        }
        self.set_status(derived);
    }

    fn set_pending_count(&self, count: usize) {
        self.state.lock().pending_changes = count;
    }
}

struct SessionHandles {
    push: JoinHandle<()>,
    pull: JoinHandle<()>,
}

impl SessionHandles {
    fn abort(self) {
        self.push.abort();
        self.pull.abort();
    }
}

/// Live bidirectional synchronization between the local store and a remote
/// replica
pub struct ReplicationSyncEngine {
    shared: Arc<Shared>,
    layers: Arc<StorageLayerManager>,
    remote: Option<Arc<dyn RemoteReplica>>,
    batch_size: usize,
    retry_on_error: bool,
    session: Mutex<Option<SessionHandles>>,
}

impl ReplicationSyncEngine {
    pub fn new(
        layers: Arc<StorageLayerManager>,
        remote: Option<Arc<dyn RemoteReplica>>,
        batch_size: usize,
        retry_on_error: bool,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        if remote.is_none() {
            info!("No remote replica configured, staying in local-only mode");
        }
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SyncState::default()),
                streams: Mutex::new(StreamStates::default()),
                pending: Mutex::new(Vec::new()),
                pull_cursor: AtomicU64::new(0),
                event_tx,
            }),
            layers,
            remote,
            batch_size: batch_size.max(1),
            retry_on_error,
            session: Mutex::new(None),
        }
    }

    /// Whether a remote replica is configured at all
    pub fn is_local_only(&self) -> bool {
        self.remote.is_none()
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Current state snapshot
    pub fn state(&self) -> SyncState {
        self.shared.state.lock().clone()
    }

    /// Drop all accumulated errors
    pub fn clear_errors(&self) {
        self.shared.state.lock().error_log.clear();
    }

    /// Queue a local change for the push stream.
    ///
    /// Coalesced per document: only the latest payload for a document is
    /// pushed. A no-op in local-only mode.
    pub fn record_local_change(&self, doc_id: &str, payload: serde_json::Value) {
        if self.remote.is_none() {
            return;
        }
        let count = {
            let mut pending = self.shared.pending.lock();
            if let Some(existing) = pending.iter_mut().find(|c| c.doc_id == doc_id) {
                existing.payload = payload;
            } else {
                pending.push(DocChange {
                    doc_id: doc_id.to_string(),
                    payload,
                    seq: 0,
                });
            }
            pending.len()
        };
        self.shared.set_pending_count(count);
    }

    /// Start the live two-way session.
    ///
    /// Idempotent; a no-op when already running or in local-only mode.
    pub fn start_live_sync(&self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let mut session = self.session.lock();
        if session.is_some() {
            debug!("Live sync already running");
            return;
        }

        info!("Starting live replication session");
        let push = self.spawn_push_stream(remote.clone());
        let pull = self.spawn_pull_stream(remote);
        *session = Some(SessionHandles { push, pull });
    }

    fn spawn_push_stream(&self, remote: Arc<dyn RemoteReplica>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let batch_size = self.batch_size;
        let retry_on_error = self.retry_on_error;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STREAM_INTERVAL);
            loop {
                interval.tick().await;

                let batch: Vec<DocChange> = {
                    let mut pending = shared.pending.lock();
                    let take = pending.len().min(batch_size);
                    pending.drain(..take).collect()
                };
                if batch.is_empty() {
                    shared.apply_stream_event(StreamKind::Push, StreamEvent::Paused);
                    continue;
                }

                shared.apply_stream_event(StreamKind::Push, StreamEvent::Active);
                match remote.push(&batch) {
                    Ok(accepted) => {
                        let remaining = shared.pending.lock().len();
                        shared.set_pending_count(remaining);
                        debug!(accepted, remaining, "Pushed local changes");
                        shared.apply_stream_event(StreamKind::Push, StreamEvent::Paused);
                    }
                    Err(e) => {
                        // Requeue so nothing is lost, then back off
                        {
                            let mut pending = shared.pending.lock();
                            for change in batch.into_iter().rev() {
                                if !pending.iter().any(|c| c.doc_id == change.doc_id) {
                                    pending.insert(0, change);
                                }
                            }
                            let count = pending.len();
                            drop(pending);
                            shared.set_pending_count(count);
                        }
                        shared.apply_stream_event(
                            StreamKind::Push,
                            StreamEvent::Error(e.to_string()),
                        );
                        if !retry_on_error {
                            break;
                        }
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        shared.apply_stream_event(StreamKind::Push, StreamEvent::Paused);
                    }
                }
            }
        })
    }

    fn spawn_pull_stream(&self, remote: Arc<dyn RemoteReplica>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let layers = self.layers.clone();
        let retry_on_error = self.retry_on_error;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STREAM_INTERVAL);
            loop {
                interval.tick().await;

                let since = shared.pull_cursor.load(Ordering::SeqCst);
                match remote.pull(since) {
                    Ok(batch) if batch.changes.is_empty() => {
                        shared.apply_stream_event(StreamKind::Pull, StreamEvent::Paused);
                    }
                    Ok(batch) => {
                        shared.apply_stream_event(StreamKind::Pull, StreamEvent::Active);
                        let applied = apply_remote_changes(&layers, &batch.changes);
                        shared.pull_cursor.store(batch.last_seq, Ordering::SeqCst);
                        let _ = shared
                            .event_tx
                            .send(SyncEvent::ChangesApplied { count: applied });
                        shared.apply_stream_event(StreamKind::Pull, StreamEvent::Paused);
                    }
                    Err(e) => {
                        shared.apply_stream_event(
                            StreamKind::Pull,
                            StreamEvent::Error(e.to_string()),
                        );
                        if !retry_on_error {
                            break;
                        }
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        shared.apply_stream_event(StreamKind::Pull, StreamEvent::Paused);
                    }
                }
            }
        })
    }

    /// Tear the live session down in response to connectivity loss
    pub fn set_offline(&self) {
        let mut session = self.session.lock();
        if let Some(handles) = session.take() {
            handles.abort();
            info!("Connectivity lost, live session cancelled");
        }
        *self.shared.streams.lock() = StreamStates::default();
        self.shared.set_status(SyncStatus::Paused);
    }

    /// Rebuild the session from scratch after connectivity returns
    pub fn set_online(&self) {
        {
            let mut session = self.session.lock();
            if let Some(handles) = session.take() {
                handles.abort();
            }
        }
        *self.shared.streams.lock() = StreamStates::default();
        info!("Connectivity restored, rebuilding live session");
        self.start_live_sync();
    }

    /// Stop the live session explicitly; status returns to idle
    pub fn stop(&self) {
        let mut session = self.session.lock();
        if let Some(handles) = session.take() {
            handles.abort();
            info!("Live session stopped");
        }
        *self.shared.streams.lock() = StreamStates::default();
        self.shared.set_status(SyncStatus::Idle);
    }

    /// Manual one-shot sync: a single push followed by a single pull.
    ///
    /// Separate from the live session; it neither reads nor writes the
    /// session's stream state. Updates `last_sync` on success; a failure is
    /// recorded in the error log and returned, with the live session
    /// untouched.
    pub fn sync_once(&self) -> StoreResult<SyncOnceReport> {
        let Some(remote) = self.remote.clone() else {
            return Err(StoreError::InvalidOperation(
                "no remote replica configured".to_string(),
            ));
        };

        let result = self.sync_once_inner(&remote);
        if let Err(e) = &result {
            self.shared.record_error(format!("manual sync: {}", e));
        }
        result
    }

    fn sync_once_inner(&self, remote: &Arc<dyn RemoteReplica>) -> StoreResult<SyncOnceReport> {
        let batch: Vec<DocChange> = std::mem::take(&mut *self.shared.pending.lock());
        let pushed = if batch.is_empty() {
            0
        } else {
            match remote.push(&batch) {
                Ok(n) => n,
                Err(e) => {
                    // Merge the batch back without clobbering changes that
                    // were recorded while the push was in flight
                    let count = {
                        let mut pending = self.shared.pending.lock();
                        for change in batch.into_iter().rev() {
                            if !pending.iter().any(|c| c.doc_id == change.doc_id) {
                                pending.insert(0, change);
                            }
                        }
                        pending.len()
                    };
                    self.shared.set_pending_count(count);
                    return Err(e);
                }
            }
        };
        self.shared.set_pending_count(self.shared.pending.lock().len());

        let since = self.shared.pull_cursor.load(Ordering::SeqCst);
        let batch = remote.pull(since)?;
        let pulled = apply_remote_changes(&self.layers, &batch.changes);
        self.shared
            .pull_cursor
            .store(batch.last_seq, Ordering::SeqCst);

        self.shared.state.lock().last_sync = Some(epoch_ms());
        info!(pushed, pulled, "Manual sync complete");
        Ok(SyncOnceReport { pushed, pulled })
    }
}

impl Drop for ReplicationSyncEngine {
    fn drop(&mut self) {
        if let Some(handles) = self.session.lock().take() {
            handles.abort();
        }
    }
}

/// Write pulled changes through the layer manager.
///
/// Unknown document ids are skipped with a warning; a failed write is not
/// fatal to the batch.
fn apply_remote_changes(layers: &StorageLayerManager, changes: &[DocChange]) -> usize {
    let mut applied = 0;
    for change in changes {
        let Ok(key) = LogicalKey::from_str(&change.doc_id) else {
            warn!(doc_id = %change.doc_id, "Skipping remote change for unknown document");
            continue;
        };
        let report = layers.save(key, change.payload.clone());
        if report.is_success() {
            applied += 1;
        } else {
            warn!(doc_id = %change.doc_id, "Remote change could not be persisted locally");
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn test_layers() -> (Arc<StorageLayerManager>, TempDir) {
        let temp = TempDir::new().unwrap();
        let layers = Arc::new(StorageLayerManager::open(temp.path()).unwrap());
        (layers, temp)
    }

    /// Replica whose calls fail while the flag is set
    struct FlakyReplica {
        inner: MemoryReplica,
        failing: AtomicBool,
    }

    impl FlakyReplica {
        fn new() -> Self {
            Self {
                inner: MemoryReplica::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn check(&self) -> StoreResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Replication("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl RemoteReplica for FlakyReplica {
        fn ping(&self) -> StoreResult<()> {
            self.check()
        }

        fn push(&self, changes: &[DocChange]) -> StoreResult<usize> {
            self.check()?;
            self.inner.push(changes)
        }

        fn pull(&self, since: u64) -> StoreResult<ChangeBatch> {
            self.check()?;
            self.inner.pull(since)
        }
    }

    #[test]
    fn test_sync_status_display() {
        assert_eq!(format!("{}", SyncStatus::Idle), "Idle");
        assert_eq!(format!("{}", SyncStatus::Syncing), "Syncing");
        assert_eq!(
            format!("{}", SyncStatus::Error("boom".to_string())),
            "Error: boom"
        );
    }

    #[tokio::test]
    async fn test_local_only_mode() {
        let (layers, _temp) = test_layers();
        let engine = ReplicationSyncEngine::new(layers, None, 100, true);

        assert!(engine.is_local_only());
        engine.start_live_sync();
        assert_eq!(engine.state().status, SyncStatus::Idle);

        // Local changes are not queued when there is nowhere to push them
        engine.record_local_change("tasks", json!([1]));
        assert_eq!(engine.state().pending_changes, 0);

        assert!(matches!(
            engine.sync_once(),
            Err(StoreError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_sync_round_trip() {
        let remote = Arc::new(MemoryReplica::new());
        let (layers_a, _ta) = test_layers();
        let (layers_b, _tb) = test_layers();

        let engine_a =
            ReplicationSyncEngine::new(layers_a, Some(remote.clone() as Arc<dyn RemoteReplica>), 100, true);
        let engine_b =
            ReplicationSyncEngine::new(layers_b.clone(), Some(remote.clone() as Arc<dyn RemoteReplica>), 100, true);

        engine_a.record_local_change("tasks", json!([{"id": 1, "title": "sow seeds"}]));
        assert_eq!(engine_a.state().pending_changes, 1);

        let report = engine_a.sync_once().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(engine_a.state().pending_changes, 0);
        assert!(engine_a.state().last_sync.is_some());

        let report = engine_b.sync_once().unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(
            layers_b.load(LogicalKey::Tasks).unwrap().unwrap(),
            json!([{"id": 1, "title": "sow seeds"}])
        );
    }

    #[tokio::test]
    async fn test_pending_changes_coalesce_per_document() {
        let remote = Arc::new(MemoryReplica::new());
        let (layers, _temp) = test_layers();
        let engine = ReplicationSyncEngine::new(layers, Some(remote.clone() as Arc<dyn RemoteReplica>), 100, true);

        engine.record_local_change("tasks", json!(["v1"]));
        engine.record_local_change("tasks", json!(["v2"]));
        engine.record_local_change("settings", json!({"a": 1}));
        assert_eq!(engine.state().pending_changes, 2);

        engine.sync_once().unwrap();
        assert_eq!(remote.document("tasks").unwrap(), json!(["v2"]));
    }

    #[tokio::test]
    async fn test_manual_sync_failure_is_logged_not_thrown_as_state() {
        let remote = Arc::new(FlakyReplica::new());
        remote.failing.store(true, Ordering::SeqCst);
        let (layers, _temp) = test_layers();
        let engine = ReplicationSyncEngine::new(layers, Some(remote.clone() as Arc<dyn RemoteReplica>), 100, true);

        engine.record_local_change("tasks", json!([1]));
        assert!(engine.sync_once().is_err());

        let state = engine.state();
        assert_eq!(state.error_log.len(), 1);
        // Live session state untouched by the one-shot failure
        assert_eq!(state.status, SyncStatus::Idle);
        // The failed batch is requeued, not lost
        assert_eq!(state.pending_changes, 1);

        engine.clear_errors();
        assert!(engine.state().error_log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_session_reaches_complete() {
        let remote = Arc::new(MemoryReplica::new());
        let (layers, _temp) = test_layers();
        let engine = ReplicationSyncEngine::new(layers, Some(remote.clone() as Arc<dyn RemoteReplica>), 100, true);

        engine.record_local_change("projects", json!([{"name": "greenhouse"}]));
        engine.start_live_sync();

        tokio::time::sleep(Duration::from_secs(3)).await;

        let state = engine.state();
        assert_eq!(state.status, SyncStatus::Complete);
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync.is_some());
        assert_eq!(
            remote.document("projects").unwrap(),
            json!([{"name": "greenhouse"}])
        );

        engine.stop();
        assert_eq!(engine.state().status, SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_pauses_and_online_recovers() {
        let remote = Arc::new(MemoryReplica::new());
        let (layers, _temp) = test_layers();
        let engine = ReplicationSyncEngine::new(layers, Some(remote.clone() as Arc<dyn RemoteReplica>), 100, true);

        engine.record_local_change("tasks", json!(["offline edit"]));
        engine.start_live_sync();
        tokio::time::sleep(Duration::from_millis(100)).await;

        engine.set_offline();
        assert_eq!(engine.state().status, SyncStatus::Paused);

        engine.record_local_change("tasks", json!(["offline edit", "another"]));

        engine.set_online();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let state = engine.state();
        assert_eq!(state.status, SyncStatus::Complete);
        assert_eq!(state.pending_changes, 0);
        assert_eq!(
            remote.document("tasks").unwrap(),
            json!(["offline edit", "another"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_errors_accumulate_and_session_survives() {
        let remote = Arc::new(FlakyReplica::new());
        let (layers, _temp) = test_layers();
        let engine =
            ReplicationSyncEngine::new(layers, Some(remote.clone() as Arc<dyn RemoteReplica>), 100, true);

        remote.failing.store(true, Ordering::SeqCst);
        engine.record_local_change("tasks", json!([1]));
        engine.start_live_sync();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!engine.state().error_log.is_empty());

        // Recovery: the session's own retry loop picks the work back up
        remote.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let state = engine.state();
        assert_eq!(state.status, SyncStatus::Complete);
        assert_eq!(state.pending_changes, 0);
        assert_eq!(remote.inner.document("tasks").unwrap(), json!([1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_does_not_regress_without_activity() {
        let remote = Arc::new(MemoryReplica::new());
        let (layers, _temp) = test_layers();
        let engine = ReplicationSyncEngine::new(layers, Some(remote as Arc<dyn RemoteReplica>), 100, true);

        engine.start_live_sync();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.state().status, SyncStatus::Complete);

        // Idle ticks with nothing pending keep the settled status
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.state().status, SyncStatus::Complete);
    }

    /// Replica whose push always fails, running a hook first so tests can
    /// interleave work with an in-flight push
    struct HookedFailingReplica {
        on_push: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    }

    impl RemoteReplica for HookedFailingReplica {
        fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        fn push(&self, _changes: &[DocChange]) -> StoreResult<usize> {
            if let Some(hook) = &*self.on_push.lock() {
                hook();
            }
            Err(StoreError::Replication("connection reset".to_string()))
        }

        fn pull(&self, _since: u64) -> StoreResult<ChangeBatch> {
            Ok(ChangeBatch::default())
        }
    }

    #[tokio::test]
    async fn test_change_recorded_during_failed_push_survives() {
        let remote = Arc::new(HookedFailingReplica {
            on_push: Mutex::new(None),
        });
        let (layers, _temp) = test_layers();
        let engine = Arc::new(ReplicationSyncEngine::new(
            layers,
            Some(remote.clone() as Arc<dyn RemoteReplica>),
            100,
            true,
        ));

        engine.record_local_change("tasks", json!([1]));

        // A second document changes while the push is in flight
        let hooked = engine.clone();
        *remote.on_push.lock() = Some(Box::new(move || {
            hooked.record_local_change("settings", json!({"theme": "dark"}));
        }));

        assert!(engine.sync_once().is_err());

        // Restoring the failed batch must not clobber the newer change
        let state = engine.state();
        assert_eq!(state.pending_changes, 2);
        let docs: Vec<String> = engine
            .shared
            .pending
            .lock()
            .iter()
            .map(|c| c.doc_id.clone())
            .collect();
        assert!(docs.contains(&"tasks".to_string()));
        assert!(docs.contains(&"settings".to_string()));
    }

    #[test]
    fn test_last_sync_only_advances_on_transition_into_complete() {
        let (event_tx, _) = broadcast::channel(8);
        let shared = Shared {
            state: Mutex::new(SyncState::default()),
            streams: Mutex::new(StreamStates::default()),
            pending: Mutex::new(Vec::new()),
            pull_cursor: AtomicU64::new(0),
            event_tx,
        };

        shared.apply_stream_event(StreamKind::Push, StreamEvent::Paused);
        assert_eq!(shared.state.lock().status, SyncStatus::Complete);
        let first = shared.state.lock().last_sync.unwrap();

        // Idle ticks that stay settled keep the old timestamp
        shared.state.lock().last_sync = Some(first - 60_000);
        shared.apply_stream_event(StreamKind::Pull, StreamEvent::Paused);
        shared.apply_stream_event(StreamKind::Push, StreamEvent::Paused);
        assert_eq!(shared.state.lock().last_sync, Some(first - 60_000));

        // A fresh activity cycle stamps it again on settling
        shared.apply_stream_event(StreamKind::Push, StreamEvent::Active);
        shared.apply_stream_event(StreamKind::Push, StreamEvent::Paused);
        assert!(shared.state.lock().last_sync.unwrap() >= first - 1);
    }
}
