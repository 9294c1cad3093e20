//! Advisory cross-tab write coordination.
//!
//! Tabs of the same origin announce write intent over a broadcast channel so
//! concurrent writers to the same logical document can warn each other. This
//! is a best-effort conflict *detector*, not a mutex: a write is never
//! blocked, and callers must not assume exclusivity. Broadcast delivery is
//! asynchronous with no ordering guarantee relative to local operations,
//! which is exactly why nothing stronger than a warning is possible here.
//!
//! Protocol:
//! - `write-start {tabId, docId, timestamp}` before a write begins
//! - `write-end {tabId, docId, timestamp}` after it completes
//! - `heartbeat {tabId, timestamp}` every few seconds; receivers purge
//!   claims older than the stale threshold, treating silence as a crashed
//!   or closed owner

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{epoch_ms, DocId, TabId};

/// How long a tab waits for conflicting announcements before proceeding
pub const WRITE_WAIT_WINDOW: Duration = Duration::from_millis(50);

/// How often each tab announces it is alive
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Claims older than this are never treated as active
pub const STALE_LOCK_TIMEOUT_MS: i64 = 10_000;

/// Capacity of the shared broadcast channel
const CHANNEL_CAPACITY: usize = 64;

/// Wire schema for cross-context announcements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoordMessage {
    #[serde(rename_all = "camelCase")]
    WriteStart {
        tab_id: TabId,
        doc_id: DocId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    WriteEnd {
        tab_id: TabId,
        doc_id: DocId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { tab_id: TabId, timestamp: i64 },
}

/// Advisory claim on a shared document. Held only in each tab's in-memory
/// map; never persisted.
#[derive(Debug, Clone)]
pub struct WriteLock {
    pub owner: TabId,
    pub acquired_at: i64,
}

impl WriteLock {
    fn is_stale(&self, now: i64) -> bool {
        now - self.acquired_at > STALE_LOCK_TIMEOUT_MS
    }
}

/// Another tab was writing the same document at the same time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRace {
    pub doc_id: DocId,
    pub other_tab: TabId,
}

/// Result of a write acquisition. The write always proceeds; warnings
/// annotate what coordination observed.
#[derive(Debug, Clone, Default)]
pub struct WriteGrant {
    /// Races detected before or during the wait window
    pub races: Vec<WriteRace>,
    /// True when no broadcast primitive is available and coordination
    /// degraded to single-tab semantics
    pub degraded: bool,
}

impl WriteGrant {
    pub fn has_warnings(&self) -> bool {
        self.degraded || !self.races.is_empty()
    }
}

/// The one broadcast channel shared by every coordinator in this process.
///
/// Guarded initializer per the singleton policy: repeated construction of
/// coordinators must reuse the existing channel rather than spawn duplicates.
pub fn origin_channel() -> broadcast::Sender<CoordMessage> {
    static CHANNEL: OnceLock<broadcast::Sender<CoordMessage>> = OnceLock::new();
    CHANNEL
        .get_or_init(|| broadcast::channel(CHANNEL_CAPACITY).0)
        .clone()
}

/// Advisory write coordinator for one execution context (tab)
pub struct WriteCoordinator {
    tab_id: TabId,
    channel: Option<broadcast::Sender<CoordMessage>>,
    /// Currently-claimed documents as observed by this tab
    claims: Arc<Mutex<HashMap<DocId, WriteLock>>>,
    listener: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl WriteCoordinator {
    /// Join the given origin channel.
    ///
    /// Spawns this tab's listener and heartbeat tasks; one of each per
    /// coordinator, and the caller is expected to construct one coordinator
    /// per execution context.
    pub fn new(tab_id: TabId, channel: broadcast::Sender<CoordMessage>) -> Self {
        let claims: Arc<Mutex<HashMap<DocId, WriteLock>>> = Arc::new(Mutex::new(HashMap::new()));

        let listener = {
            let mut rx = channel.subscribe();
            let claims = claims.clone();
            let own_tab = tab_id.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) => Self::apply_message(&own_tab, &claims, msg),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Advisory protocol: missed announcements just widen
                            // the race window, so log and carry on
                            warn!(tab = %own_tab, skipped, "Coordinator lagged behind channel");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let heartbeat = {
            let tx = channel.clone();
            let claims = claims.clone();
            let own_tab = tab_id.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    interval.tick().await;
                    let _ = tx.send(CoordMessage::Heartbeat {
                        tab_id: own_tab.clone(),
                        timestamp: epoch_ms(),
                    });
                    Self::purge_stale(&claims);
                }
            })
        };

        Self {
            tab_id,
            channel: Some(channel),
            claims,
            listener: Some(listener),
            heartbeat: Some(heartbeat),
        }
    }

    /// Degraded coordinator for runtimes without a broadcast primitive.
    ///
    /// Every grant carries a warning; callers must treat the absence of
    /// coordination as equivalent to single-tab operation.
    pub fn detached(tab_id: TabId) -> Self {
        Self {
            tab_id,
            channel: None,
            claims: Arc::new(Mutex::new(HashMap::new())),
            listener: None,
            heartbeat: None,
        }
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    fn apply_message(own_tab: &TabId, claims: &Mutex<HashMap<DocId, WriteLock>>, msg: CoordMessage) {
        match msg {
            CoordMessage::WriteStart {
                tab_id,
                doc_id,
                timestamp,
            } => {
                if &tab_id != own_tab {
                    debug!(tab = %own_tab, from = %tab_id, doc = %doc_id, "Observed write-start");
                    claims.lock().insert(
                        doc_id,
                        WriteLock {
                            owner: tab_id,
                            acquired_at: timestamp,
                        },
                    );
                }
            }
            CoordMessage::WriteEnd { tab_id, doc_id, .. } => {
                if &tab_id != own_tab {
                    let mut claims = claims.lock();
                    if claims.get(&doc_id).is_some_and(|l| l.owner == tab_id) {
                        claims.remove(&doc_id);
                    }
                }
            }
            CoordMessage::Heartbeat { tab_id, .. } => {
                if &tab_id != own_tab {
                    Self::purge_stale(claims);
                }
            }
        }
    }

    fn purge_stale(claims: &Mutex<HashMap<DocId, WriteLock>>) {
        let now = epoch_ms();
        let mut claims = claims.lock();
        let before = claims.len();
        claims.retain(|_, lock| !lock.is_stale(now));
        let purged = before - claims.len();
        if purged > 0 {
            debug!(purged, "Purged stale write locks");
        }
    }

    fn foreign_claim(&self, doc_id: &DocId) -> Option<TabId> {
        let now = epoch_ms();
        self.claims
            .lock()
            .get(doc_id)
            .filter(|lock| lock.owner != self.tab_id && !lock.is_stale(now))
            .map(|lock| lock.owner.clone())
    }

    /// Announce intent to write `doc_id` and wait out the advisory window.
    ///
    /// Never blocks the write: the grant always permits proceeding, with
    /// warnings for any race detected before or during the wait.
    pub async fn begin_write(&self, doc_id: &DocId) -> WriteGrant {
        let Some(channel) = &self.channel else {
            return WriteGrant {
                races: Vec::new(),
                degraded: true,
            };
        };

        let mut races = Vec::new();

        // Existing non-stale claim from another tab: warn, proceed anyway
        if let Some(other_tab) = self.foreign_claim(doc_id) {
            warn!(doc = %doc_id, %other_tab, "Write race: document already claimed");
            races.push(WriteRace {
                doc_id: doc_id.clone(),
                other_tab,
            });
        }

        let _ = channel.send(CoordMessage::WriteStart {
            tab_id: self.tab_id.clone(),
            doc_id: doc_id.clone(),
            timestamp: epoch_ms(),
        });
        self.claims.lock().insert(
            doc_id.clone(),
            WriteLock {
                owner: self.tab_id.clone(),
                acquired_at: epoch_ms(),
            },
        );

        // Give conflicting announcements a moment to arrive
        tokio::time::sleep(WRITE_WAIT_WINDOW).await;

        if let Some(other_tab) = self.foreign_claim(doc_id) {
            if !races.iter().any(|r| r.other_tab == other_tab) {
                warn!(doc = %doc_id, %other_tab, "Write race detected during wait window");
                races.push(WriteRace {
                    doc_id: doc_id.clone(),
                    other_tab,
                });
            }
        }

        WriteGrant {
            races,
            degraded: false,
        }
    }

    /// Announce completion and clear this tab's claim
    pub fn end_write(&self, doc_id: &DocId) {
        {
            let mut claims = self.claims.lock();
            if claims.get(doc_id).is_some_and(|l| l.owner == self.tab_id) {
                claims.remove(doc_id);
            }
        }
        if let Some(channel) = &self.channel {
            let _ = channel.send(CoordMessage::WriteEnd {
                tab_id: self.tab_id.clone(),
                doc_id: doc_id.clone(),
                timestamp: epoch_ms(),
            });
        }
    }

    /// The current non-stale claim holder for a document, if any.
    ///
    /// A claim past the stale threshold is never reported as active, even
    /// without an explicit write-end.
    pub fn is_document_locked(&self, doc_id: &DocId) -> Option<TabId> {
        let now = epoch_ms();
        self.claims
            .lock()
            .get(doc_id)
            .filter(|lock| !lock.is_stale(now))
            .map(|lock| lock.owner.clone())
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}
