//! Error types for the storage engines.

use thiserror::Error;

use weft_core::{CoId, SessionId};

/// A chunk merge that would skip or reorder transactions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("non-contiguous merge for {id} session {session}: have up to {have}, addition starts after {after}")]
pub struct NonContiguous {
    pub id: CoId,
    pub session: SessionId,
    pub have: u64,
    pub after: u64,
}

/// Errors from storage backends.
///
/// Filesystem and database failures are typed separately from protocol
/// errors so storage peers can degrade without crashing the sync layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    NonContiguous(#[from] NonContiguous),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
