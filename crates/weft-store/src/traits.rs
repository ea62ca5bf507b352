//! The storage backend trait.
//!
//! Backends persist chunks and speak through the storage peer task; the
//! WAL+block engine and the SQLite engine are interchangeable behind
//! this interface, with an in-memory implementation as the reference.

use async_trait::async_trait;

use weft_core::{CoId, KnownState, NewContent};

use crate::chunk::CoValueChunk;
use crate::error::Result;

/// Result of persisting a content message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    /// The content assumed transactions we do not hold; nothing beyond
    /// the already-known prefix was stored.
    pub invalid_assumptions: bool,
}

/// Async interface for chunk persistence.
///
/// Implementations serialize updates per covalue internally, so two
/// concurrent stores for the same id never interleave partial merges.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the best chunk we have for a covalue.
    async fn load(&self, id: &CoId) -> Result<Option<CoValueChunk>>;

    /// Persist a content message.
    async fn store(&self, content: &NewContent) -> Result<StoreOutcome>;

    /// What we durably know about a covalue.
    async fn known_state(&self, id: &CoId) -> Result<Option<KnownState>> {
        Ok(self.load(id).await?.map(|chunk| chunk.known_state(*id)))
    }

    /// Run housekeeping (WAL compaction, level merges). A no-op where
    /// the backend has none.
    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
