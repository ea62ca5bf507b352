//! In-memory storage backend.
//!
//! Reference semantics for the durable engines, and the default backend
//! in tests. All data is lost on drop.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use weft_core::{CoId, NewContent};

use crate::chunk::CoValueChunk;
use crate::error::Result;
use crate::traits::{StorageBackend, StoreOutcome};

/// Chunk store backed by a mutex-guarded map.
pub struct MemoryBackend {
    chunks: Mutex<HashMap<CoId, CoValueChunk>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self, id: &CoId) -> Result<Option<CoValueChunk>> {
        Ok(self.chunks.lock().await.get(id).cloned())
    }

    async fn store(&self, content: &NewContent) -> Result<StoreOutcome> {
        let mut chunks = self.chunks.lock().await;
        let addition = CoValueChunk::from_content(content);

        match chunks.get(&content.id) {
            None => {
                // A first run starting past zero is held, but flagged:
                // the sender assumed state we never had.
                let floating = addition
                    .session_entries
                    .values()
                    .any(|runs| runs.first().is_some_and(|e| e.after > 0));
                chunks.insert(content.id, addition);
                Ok(StoreOutcome {
                    invalid_assumptions: floating,
                })
            }
            Some(existing) => match existing.merge(&addition, &content.id) {
                Ok(merged) => {
                    chunks.insert(content.id, merged);
                    Ok(StoreOutcome::default())
                }
                Err(e) => {
                    warn!(id = %content.id, error = %e, "non-contiguous content, not stored");
                    Ok(StoreOutcome {
                        invalid_assumptions: true,
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{
        AgentId, AgentSecret, CoValueCore, CoValueHeader, CoValueKind, MapOp, PrincipalId,
        Ruleset, SessionId, WritePrivacy,
    };

    struct Fixture {
        core: CoValueCore,
        secret: AgentSecret,
        session: SessionId,
        next: usize,
    }

    impl Fixture {
        fn new() -> Self {
            let secret = AgentSecret::from_seed(&[1; 32]);
            let session =
                SessionId::with_nonce(PrincipalId::Agent(AgentId::of(&secret)), [1; 8]);
            Self {
                core: CoValueCore::new(CoValueHeader::new(
                    CoValueKind::Map,
                    Ruleset::UnsafeAllowAll,
                    None,
                    1,
                )),
                secret,
                session,
                next: 0,
            }
        }

        fn append(&mut self, count: usize) {
            for _ in 0..count {
                let n = self.next;
                self.next += 1;
                self.core
                    .make_transaction(
                        &self.session,
                        self.secret.signer(),
                        n as i64,
                        vec![MapOp::set(format!("k{n}"), serde_json::json!(n))],
                        WritePrivacy::Trusting,
                    )
                    .unwrap();
            }
        }
    }

    fn sample_core(txs: usize) -> CoValueCore {
        let mut fixture = Fixture::new();
        fixture.append(txs);
        fixture.core
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let backend = MemoryBackend::new();
        let core = sample_core(3);
        let content = core.new_content_since(None).remove(0);

        let outcome = backend.store(&content).await.unwrap();
        assert!(!outcome.invalid_assumptions);

        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 3);
        assert_eq!(
            backend.known_state(core.id()).await.unwrap().unwrap(),
            core.known_state()
        );
    }

    #[tokio::test]
    async fn test_incremental_store_merges() {
        let backend = MemoryBackend::new();
        let mut fixture = Fixture::new();
        fixture.append(2);
        let first = fixture.core.new_content_since(None).remove(0);
        backend.store(&first).await.unwrap();

        // Grow the core and store only the diff.
        let known = fixture.core.known_state();
        fixture.append(2);
        let diff = fixture.core.new_content_since(Some(&known)).remove(0);
        backend.store(&diff).await.unwrap();

        let chunk = backend.load(fixture.core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 4);
    }

    #[tokio::test]
    async fn test_gap_reported_not_stored() {
        let backend = MemoryBackend::new();
        let mut fixture = Fixture::new();
        fixture.append(2);
        let first = fixture.core.new_content_since(None).remove(0);
        backend.store(&first).await.unwrap();

        // Skip ahead: a diff computed against three known transactions
        // leaves a gap over our two.
        fixture.append(3);
        let mut assumed = fixture.core.known_state();
        let session = fixture.session.clone();
        assumed.sessions.insert(session.clone(), 3);
        let tail = fixture.core.new_content_since(Some(&assumed)).remove(0);

        let outcome = backend.store(&tail).await.unwrap();
        assert!(outcome.invalid_assumptions);

        let chunk = backend.load(fixture.core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 2);
    }
}
