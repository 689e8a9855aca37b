//! Storage error types for unitdata-storage.
//!
//! [`StorageError`] covers every failure the store surfaces. Engine and
//! serialization errors are passed through unchanged; the store performs no
//! retry or recovery of its own.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::types::Revision;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite reported an error, including busy/locked conflicts.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A value could not be serialized, or stored data could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// Preparing the database file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A hook scope was entered while another one is still active.
    #[error("hook scope already active at revision {revision}")]
    ScopeActive { revision: Revision },

    /// A record view was requested for a value that is not a JSON object.
    #[error("value stored under '{key}' is not an object")]
    NotARecord { key: String },

    /// The process-wide store is already in use on this thread.
    #[error("process-wide store is already in use on this thread")]
    KvInUse,

    /// The store has been closed.
    #[error("storage is closed")]
    Closed,

    /// An environment variable held a value that could not be used.
    #[error("invalid value for {name}: '{value}'")]
    InvalidConfig { name: String, value: String },

    /// Stored data violated an expected invariant.
    #[error("integrity error: {reason}")]
    Integrity { reason: String },
}

impl StorageError {
    /// True if the engine rejected the operation because another connection
    /// holds a conflicting lock.
    pub fn is_locked(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
