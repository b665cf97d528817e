//! Persistent storage contract for sessions and project documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  append_operations   ┌──────────────────────────────────┐
//! │ Session actor│ ───────────────────► │ SessionStore                     │
//! │ (in-memory)  │  save_snapshot       │                                  │
//! └──────┬───────┘  flush (on drain)    │  documents    project @ version  │
//!        │                              │  snapshots    session base       │
//!        │ on start                     │  operations   session log tail   │
//!        ▼                              └──────────────────────────────────┘
//! ┌──────────────┐
//! │ load_document│ → load_snapshot → load_operations_since → OperationLog::restore
//! └──────────────┘
//! ```
//!
//! Stores are synchronous and shared by every session; each implementation
//! serializes writes per project internally.

pub mod memory;
pub mod pending;
pub mod rocks;

use ariaforge_core::Document;
use thiserror::Error;
use uuid::Uuid;

use crate::oplog::LogEntry;

pub use memory::MemoryStore;
pub use pending::{PendingError, WriteBuffer};
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// Stored session data that can no longer be read back. Sessions treat
    /// it like a failed log check and rebuild from the last valid state.
    #[error("Corrupted session data: {0}")]
    Corrupted(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable backing for project documents and session logs.
pub trait SessionStore: Send + Sync {
    /// Last flushed state of a project, or a fresh document if none exists.
    fn load_document(&self, project_id: Uuid) -> Result<Document, StoreError>;

    /// Persist accepted log entries for a session.
    fn append_operations(&self, session_id: Uuid, entries: &[LogEntry]) -> Result<(), StoreError>;

    /// Stored entries with `global_seq > seq`, in order.
    fn load_operations_since(&self, session_id: Uuid, seq: u64) -> Result<Vec<LogEntry>, StoreError>;

    /// Latest compaction snapshot of a session.
    fn load_snapshot(&self, session_id: Uuid) -> Result<Option<(u64, Document)>, StoreError>;

    /// Store a compaction snapshot at `seq` and drop stored entries up to it.
    fn save_snapshot(&self, session_id: Uuid, seq: u64, document: &Document) -> Result<(), StoreError>;

    /// Drop stored entries with `global_seq > after_seq`.
    fn truncate_operations(&self, session_id: Uuid, after_seq: u64) -> Result<(), StoreError>;

    /// Final write when a session drains: the project document becomes
    /// `document` and the session's log and snapshot are discarded.
    fn flush(&self, session_id: Uuid, project_id: Uuid, seq: u64, document: &Document) -> Result<(), StoreError>;
}

pub(crate) fn encode_value<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
