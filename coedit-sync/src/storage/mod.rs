//! Durable update log for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append(delta)   ┌──────────────┐
//! │ SharedDoc   │ ───────────────► │ UpdateLog    │
//! │ (in-memory) │                  │ (RocksDB or  │
//! └──────┬──────┘                  │  hub)        │
//!        │ first connection        └──────┬───────┘
//!        ▼                                │
//! load_and_maybe_compact ◄────────────────┘
//!        │  ≥ threshold entries: replay → one full-state entry,
//!        │  superseded entries deleted in the same atomic batch
//!        ▼
//!   replay into the fresh replica
//! ```

pub mod compaction;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use compaction::{load_and_maybe_compact, DEFAULT_COMPACTION_THRESHOLD};
pub use rocks::{RocksUpdateLog, StoreConfig};

/// One persisted update delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Insertion id, strictly increasing across the whole log.
    pub id: u64,
    pub doc_name: String,
    pub update: Vec<u8>,
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
    #[error("log unavailable: {0}")]
    Unavailable(String),
    #[error("log request timed out")]
    Timeout,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Append-only, per-document log of update deltas.
#[async_trait]
pub trait UpdateLog: Send + Sync {
    /// Persist one delta; returns the assigned id.
    async fn append(&self, doc_name: &str, update: Vec<u8>) -> Result<u64, StoreError>;

    /// All entries of a document, ordered by id.
    async fn list_ordered(&self, doc_name: &str) -> Result<Vec<LogEntry>, StoreError>;

    /// Insert `merged` and delete `superseded` as one atomic unit.
    async fn insert_and_delete_atomically(
        &self,
        doc_name: &str,
        merged: Vec<u8>,
        superseded: &[u64],
    ) -> Result<LogEntry, StoreError>;
}
