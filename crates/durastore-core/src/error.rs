//! Error types for Durastore

use thiserror::Error;

/// Main error type for Durastore operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record exists under the given logical key
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Backup was not found in the retained history
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Every storage layer rejected a write; the data only exists in memory
    #[error("All storage layers failed for key: {0}")]
    AllLayersFailed(String),

    /// A storage backend failed to open or initialize
    #[error("Storage layer unavailable: {0}")]
    LayerUnavailable(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backup file failed structural validation on import
    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    /// Error talking to the remote replica
    #[error("Replication error: {0}")]
    Replication(String),

    /// Configuration could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using StoreError
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::KeyNotFound("tasks".to_string());
        assert_eq!(format!("{}", err), "Key not found: tasks");

        let err = StoreError::AllLayersFailed("settings".to_string());
        assert_eq!(
            format!("{}", err),
            "All storage layers failed for key: settings"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();
        assert!(matches!(store_err, StoreError::Io(_)));
    }
}
