//! DuraStore Core Library
//!
//! Offline-first durability and synchronization for user data.
//!
//! ## Overview
//!
//! DuraStore keeps user data safe on a single machine and converging across
//! machines. Every write fans out to a stack of storage layers ordered by
//! reliability, so one failing backend never loses data. Concurrent
//! instances coordinate writes over an advisory broadcast channel, a
//! replication engine mirrors changes to an optional remote replica, and a
//! backup lifecycle keeps a bounded history of full snapshots with
//! integrity-checked restore.
//!
//! ## Core Principles
//!
//! - **Local-first**: everything works fully offline; replication is optional
//! - **Redundant persistence**: saves succeed if any layer succeeds
//! - **Advisory coordination**: concurrent writers are warned, never blocked
//! - **Recoverable restore**: restoring takes a safety snapshot first
//!
//! ## Quick Start
//!
//! ```ignore
//! use durastore_core::{DuraStore, LogicalKey, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = DuraStore::open("~/.durastore/data", StoreConfig::default()).await?;
//!
//!     store.save(LogicalKey::Tasks, serde_json::json!([{"id": 1}])).await?;
//!     let tasks = store.load_or_empty(LogicalKey::Tasks);
//!
//!     let backup = store.create_manual_backup()?;
//!     println!("backed up {} bytes as {}", backup.size_bytes, backup.id);
//!
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod layers;
pub mod replication;
pub mod types;

// Re-exports
pub use backup::{
    BackupFile, BackupKind, BackupManager, BackupPayload, BackupSnapshot, RestoreOptions,
    RestoreReport, BACKUP_FORMAT_VERSION,
};
pub use config::{RemoteConfig, StoreConfig};
pub use coordinator::{origin_channel, CoordMessage, WriteCoordinator, WriteGrant, WriteRace};
pub use engine::{DuraStore, SaveOutcome};
pub use error::{StoreError, StoreResult};
pub use layers::{
    ExportLayer, KvFileLayer, RedbLayer, SaveReport, StorageLayer, StorageLayerDescriptor,
    StorageLayerManager,
};
pub use replication::{
    ChangeBatch, DocChange, MemoryReplica, RemoteReplica, ReplicationSyncEngine, SyncEvent,
    SyncOnceReport, SyncState, SyncStatus,
};
pub use types::*;
