//! Core types for Durastore

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::StoreError;

/// Schema version stamped onto every persisted record.
///
/// Records with a newer version than this are treated as unreadable on load
/// (the next storage layer is tried instead).
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Current epoch-milliseconds timestamp
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Logical key for one persisted document
///
/// The persisted key/value namespace is shared by all execution contexts of
/// the same origin; every write goes through the layer manager keyed by one
/// of these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalKey {
    Tasks,
    Projects,
    Canvas,
    Settings,
    /// Reserved: serialized backup history (owned by the backup manager)
    BackupHistory,
    /// Reserved: pointer to the most recent backup
    BackupLatest,
}

/// The domain keys captured by every backup snapshot
pub const TRACKED_KEYS: [LogicalKey; 4] = [
    LogicalKey::Tasks,
    LogicalKey::Projects,
    LogicalKey::Canvas,
    LogicalKey::Settings,
];

impl LogicalKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalKey::Tasks => "tasks",
            LogicalKey::Projects => "projects",
            LogicalKey::Canvas => "canvas",
            LogicalKey::Settings => "settings",
            LogicalKey::BackupHistory => "backup-history",
            LogicalKey::BackupLatest => "backup-latest",
        }
    }

    /// Whether this key holds an array payload (vs. a single object)
    pub fn is_collection(&self) -> bool {
        matches!(self, LogicalKey::Tasks | LogicalKey::Projects)
    }

    /// The empty payload for this key, used when nothing has been saved yet
    pub fn empty_payload(&self) -> serde_json::Value {
        if self.is_collection() {
            serde_json::Value::Array(Vec::new())
        } else {
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogicalKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tasks" => Ok(LogicalKey::Tasks),
            "projects" => Ok(LogicalKey::Projects),
            "canvas" => Ok(LogicalKey::Canvas),
            "settings" => Ok(LogicalKey::Settings),
            "backup-history" => Ok(LogicalKey::BackupHistory),
            "backup-latest" => Ok(LogicalKey::BackupLatest),
            other => Err(StoreError::KeyNotFound(other.to_string())),
        }
    }
}

/// Unique identifier for one execution context (tab)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    /// Create a new random TabId
    pub fn new() -> Self {
        Self(format!("tab_{}", Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a shared logical document claimed by the write coordinator
///
/// In practice this is the logical key name ("tasks", "settings", ...), but
/// the coordinator does not require claimed documents to exist in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<LogicalKey> for DocId {
    fn from(key: LogicalKey) -> Self {
        Self(key.as_str().to_string())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a backup snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupId(String);

impl BackupId {
    /// Create a new random BackupId (ULIDs sort by creation time)
    pub fn new() -> Self {
        Self(format!("backup_{}", Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BackupId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for BackupId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(StoreError::BackupNotFound(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One persisted record per logical key
///
/// Owned exclusively by the storage layer manager; each layer's write of a
/// record is atomic from the caller's perspective, though cross-layer
/// consistency is not guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Logical key name
    pub key: String,
    /// The serialized domain payload
    pub payload: serde_json::Value,
    /// Epoch milliseconds at write time
    pub written_at: i64,
    /// Schema version the payload was written under
    pub schema_version: u32,
}

impl PersistedRecord {
    pub fn new(key: LogicalKey, payload: serde_json::Value) -> Self {
        Self {
            key: key.as_str().to_string(),
            payload,
            written_at: epoch_ms(),
            schema_version: RECORD_SCHEMA_VERSION,
        }
    }

    /// Whether this record can be read by the current schema
    pub fn is_readable(&self) -> bool {
        self.schema_version <= RECORD_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_key_round_trip() {
        for key in TRACKED_KEYS {
            let parsed: LogicalKey = key.as_str().parse().unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn test_logical_key_unknown() {
        assert!("nonsense".parse::<LogicalKey>().is_err());
    }

    #[test]
    fn test_empty_payloads() {
        assert!(LogicalKey::Tasks.empty_payload().is_array());
        assert!(LogicalKey::Projects.empty_payload().is_array());
        assert!(LogicalKey::Canvas.empty_payload().is_object());
        assert!(LogicalKey::Settings.empty_payload().is_object());
    }

    #[test]
    fn test_tab_ids_are_unique() {
        assert_ne!(TabId::new(), TabId::new());
    }

    #[test]
    fn test_record_readability() {
        let mut record = PersistedRecord::new(LogicalKey::Tasks, serde_json::json!([]));
        assert!(record.is_readable());

        record.schema_version = RECORD_SCHEMA_VERSION + 1;
        assert!(!record.is_readable());
    }

    #[test]
    fn test_doc_id_from_key() {
        let doc: DocId = LogicalKey::Tasks.into();
        assert_eq!(doc.as_str(), "tasks");
    }
}
