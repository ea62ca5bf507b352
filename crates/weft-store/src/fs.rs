//! The WAL + leveled block storage engine.
//!
//! Writes land in the WAL first; an in-memory merge makes them readable
//! immediately. `compact()` folds WAL entries into a block at the
//! highest level, and whenever a level holds more than `2^level` blocks
//! they merge into a single block one level down, bounding how many
//! block files a lookup has to probe.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use weft_core::{CoId, NewContent};

use crate::blocks::{block_files, write_block, BlockFile};
use crate::chunk::CoValueChunk;
use crate::error::Result;
use crate::traits::{StorageBackend, StoreOutcome};
use crate::wal::{read_wal_file, wal_files, WalEntry, WalWriter};

/// Deepest compaction level; fresh blocks start here.
pub const MAX_LEVELS: u32 = 3;

struct FsInner {
    dir: PathBuf,
    wal: WalWriter,
    /// Chunks merged from live WAL entries, readable before compaction.
    cache: HashMap<CoId, CoValueChunk>,
    /// Opened blocks, oldest first within the scan order.
    blocks: Vec<BlockFile>,
}

/// Filesystem storage engine.
///
/// All state sits behind one async mutex: concurrent stores for the same
/// covalue serialize, so partial merges never interleave.
pub struct FileSystemBackend {
    inner: Mutex<FsInner>,
}

impl FileSystemBackend {
    /// Open (or create) a storage directory, replaying any WAL left by a
    /// previous run into the in-memory cache.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut blocks = Vec::new();
        for path in block_files(&dir)? {
            match BlockFile::open(&path) {
                Ok(block) => blocks.push(block),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable block file, skipping"),
            }
        }
        // Lower levels hold older data; scan oldest first (ties broken
        // by file age) so newer runs merge on top.
        let mut keyed: Vec<(u32, std::time::SystemTime, BlockFile)> = blocks
            .into_iter()
            .map(|b| {
                let mtime = std::fs::metadata(b.path())
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                (b.level(), mtime, b)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let blocks: Vec<BlockFile> = keyed.into_iter().map(|(_, _, b)| b).collect();

        let mut cache: HashMap<CoId, CoValueChunk> = HashMap::new();
        for path in wal_files(&dir)? {
            for entry in read_wal_file(&path)? {
                let (id, chunk) = entry.into_chunk();
                merge_into(&mut cache, id, chunk);
            }
        }

        let wal = WalWriter::create(&dir)?;
        Ok(Self {
            inner: Mutex::new(FsInner {
                dir,
                wal,
                cache,
                blocks,
            }),
        })
    }

    /// Number of block files currently tracked (diagnostics and tests).
    pub async fn block_count(&self) -> usize {
        self.inner.lock().await.blocks.len()
    }
}

/// Merge a chunk into a cache slot, logging instead of failing: the WAL
/// line is already durable, so a non-contiguous merge only delays
/// readability until the missing run arrives.
fn merge_into(cache: &mut HashMap<CoId, CoValueChunk>, id: CoId, chunk: CoValueChunk) -> bool {
    match cache.get(&id) {
        None => {
            cache.insert(id, chunk);
            true
        }
        Some(existing) => match existing.merge(&chunk, &id) {
            Ok(merged) => {
                cache.insert(id, merged);
                true
            }
            Err(e) => {
                warn!(id = %id, error = %e, "non-contiguous chunk merge, keeping existing");
                false
            }
        },
    }
}

impl FsInner {
    fn lookup(&self, id: &CoId) -> Result<Option<CoValueChunk>> {
        // Scan blocks oldest-first so later chunks extend earlier ones,
        // then the live WAL cache on top.
        let mut result: Option<CoValueChunk> = None;
        for block in &self.blocks {
            let Some(chunk) = block.load_chunk(id)? else {
                continue;
            };
            result = Some(match result {
                None => chunk,
                Some(base) => match base.merge(&chunk, id) {
                    Ok(merged) => merged,
                    Err(e) => {
                        warn!(id = %id, error = %e, "non-contiguous chunks across blocks, returning best effort");
                        if chunk.transaction_count() > base.transaction_count() {
                            chunk
                        } else {
                            base
                        }
                    }
                },
            });
        }

        if let Some(live) = self.cache.get(id) {
            result = Some(match result {
                None => live.clone(),
                Some(base) => match base.merge(live, id) {
                    Ok(merged) => merged,
                    Err(e) => {
                        warn!(id = %id, error = %e, "live WAL chunk not contiguous with blocks, returning best effort");
                        if live.transaction_count() > base.transaction_count() {
                            live.clone()
                        } else {
                            base
                        }
                    }
                },
            });
        }

        Ok(result)
    }

    fn compact(&mut self) -> Result<()> {
        // Rotate the WAL so new writes keep landing while we fold the
        // old files.
        let consumed = wal_files(&self.dir)?;
        self.wal = WalWriter::create(&self.dir)?;
        let consumed: Vec<PathBuf> = consumed
            .into_iter()
            .filter(|p| p != self.wal.path())
            .collect();

        // Fold all WAL entries per id; failed merges are logged and the
        // offending run dropped from the block (its WAL file is only
        // deleted once written or deliberately skipped).
        let mut folded: BTreeMap<CoId, CoValueChunk> = BTreeMap::new();
        for path in &consumed {
            for entry in read_wal_file(path)? {
                let (id, chunk) = entry.into_chunk();
                match folded.get(&id) {
                    None => {
                        folded.insert(id, chunk);
                    }
                    Some(existing) => match existing.merge(&chunk, &id) {
                        Ok(merged) => {
                            folded.insert(id, merged);
                        }
                        Err(e) => {
                            warn!(id = %id, error = %e, "skipping non-contiguous WAL run during compaction");
                        }
                    },
                }
            }
        }

        if !folded.is_empty() {
            let path = write_block(&self.dir, MAX_LEVELS, &folded)?;
            self.blocks.push(BlockFile::open(&path)?);
            debug!(path = %path.display(), covalues = folded.len(), "wrote block from WAL");
        }

        for path in &consumed {
            std::fs::remove_file(path)?;
        }
        self.cache.clear();

        self.compact_levels()
    }

    /// Merge overfull levels downward until every level fits.
    fn compact_levels(&mut self) -> Result<()> {
        for level in (1..=MAX_LEVELS).rev() {
            let at_level: Vec<usize> = self
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.level() == level)
                .map(|(i, _)| i)
                .collect();
            if at_level.len() <= (1usize << level) {
                continue;
            }

            let mut folded: BTreeMap<CoId, CoValueChunk> = BTreeMap::new();
            for &i in &at_level {
                for (id, chunk) in self.blocks[i].load_all()? {
                    match folded.get(&id) {
                        None => {
                            folded.insert(id, chunk);
                        }
                        Some(existing) => match existing.merge(&chunk, &id) {
                            Ok(merged) => {
                                folded.insert(id, merged);
                            }
                            Err(e) => {
                                warn!(id = %id, error = %e, "skipping non-contiguous run during level merge");
                            }
                        },
                    }
                }
            }

            let path = write_block(&self.dir, level - 1, &folded)?;
            let merged_block = BlockFile::open(&path)?;
            debug!(from_level = level, path = %path.display(), "merged level into one block");

            // Drop the consumed blocks (indices descending to keep them
            // valid), then insert the merged one at scan position 0 so
            // newer blocks still merge on top of it.
            for &i in at_level.iter().rev() {
                let old = self.blocks.remove(i);
                std::fs::remove_file(old.path())?;
            }
            self.blocks.insert(0, merged_block);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    async fn load(&self, id: &CoId) -> Result<Option<CoValueChunk>> {
        self.inner.lock().await.lookup(id)
    }

    async fn store(&self, content: &NewContent) -> Result<StoreOutcome> {
        let mut inner = self.inner.lock().await;

        // Durability first: the WAL write is the commit point.
        inner.wal.append(&WalEntry::from_content(content))?;

        // Best-effort in-memory merge for fast reads. Merge against what
        // blocks already hold if the cache is cold for this id.
        let addition = CoValueChunk::from_content(content);
        let id = content.id;
        if !inner.cache.contains_key(&id) {
            if let Some(existing) = inner.lookup(&id)? {
                inner.cache.insert(id, existing);
            }
        }
        let merged = merge_into(&mut inner.cache, id, addition);
        Ok(StoreOutcome {
            invalid_assumptions: !merged,
        })
    }

    async fn compact(&self) -> Result<()> {
        self.inner.lock().await.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{
        AgentId, AgentSecret, CoValueCore, CoValueHeader, CoValueKind, MapOp, PrincipalId,
        Ruleset, SessionId, WritePrivacy,
    };

    fn sample_core(seed: u8, txs: usize) -> CoValueCore {
        let secret = AgentSecret::from_seed(&[seed; 32]);
        let session = SessionId::with_nonce(PrincipalId::Agent(AgentId::of(&secret)), [seed; 8]);
        let mut core = CoValueCore::new(CoValueHeader::new(
            CoValueKind::Map,
            Ruleset::UnsafeAllowAll,
            None,
            seed as i64,
        ));
        for n in 0..txs {
            core.make_transaction(
                &session,
                secret.signer(),
                n as i64,
                vec![MapOp::set(format!("k{n}"), serde_json::json!(n))],
                WritePrivacy::Trusting,
            )
            .unwrap();
        }
        core
    }

    #[tokio::test]
    async fn test_store_load_before_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::open(dir.path()).unwrap();

        let core = sample_core(1, 3);
        let content = core.new_content_since(None).remove(0);
        backend.store(&content).await.unwrap();

        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 3);
        assert_eq!(
            backend.known_state(core.id()).await.unwrap().unwrap(),
            core.known_state()
        );
    }

    #[tokio::test]
    async fn test_wal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let core = sample_core(1, 2);
        let content = core.new_content_since(None).remove(0);

        {
            let backend = FileSystemBackend::open(dir.path()).unwrap();
            backend.store(&content).await.unwrap();
        }

        // A new instance replays the WAL.
        let backend = FileSystemBackend::open(dir.path()).unwrap();
        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_compaction_moves_wal_into_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::open(dir.path()).unwrap();

        let core = sample_core(1, 3);
        backend
            .store(&core.new_content_since(None).remove(0))
            .await
            .unwrap();
        backend.compact().await.unwrap();

        assert_eq!(backend.block_count().await, 1);
        // Consumed WAL files are gone (only the fresh empty one remains).
        let remaining = wal_files(dir.path()).unwrap();
        assert_eq!(remaining.len(), 1);

        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 3);
    }

    #[tokio::test]
    async fn test_lookup_merges_across_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::open(dir.path()).unwrap();

        let secret = AgentSecret::from_seed(&[1; 32]);
        let session = SessionId::with_nonce(PrincipalId::Agent(AgentId::of(&secret)), [1; 8]);
        let mut core = CoValueCore::new(CoValueHeader::new(
            CoValueKind::Map,
            Ruleset::UnsafeAllowAll,
            None,
            1,
        ));
        core.make_transaction(
            &session,
            secret.signer(),
            0,
            vec![MapOp::set("a", serde_json::json!(0))],
            WritePrivacy::Trusting,
        )
        .unwrap();
        backend
            .store(&core.new_content_since(None).remove(0))
            .await
            .unwrap();
        backend.compact().await.unwrap();

        // Second batch into a second block.
        let known = core.known_state();
        core.make_transaction(
            &session,
            secret.signer(),
            1,
            vec![MapOp::set("b", serde_json::json!(1))],
            WritePrivacy::Trusting,
        )
        .unwrap();
        backend
            .store(&core.new_content_since(Some(&known)).remove(0))
            .await
            .unwrap();
        backend.compact().await.unwrap();

        assert_eq!(backend.block_count().await, 2);
        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 2);
        assert_eq!(
            chunk.known_state(*core.id()),
            core.known_state()
        );
    }

    #[tokio::test]
    async fn test_leveled_compaction_bounds_block_count() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSystemBackend::open(dir.path()).unwrap();

        // Ten compaction rounds, each with a distinct covalue, would
        // leave ten blocks at the top level; the level merge folds them.
        let mut ids = Vec::new();
        for seed in 1..=10u8 {
            let core = sample_core(seed, 1);
            ids.push(*core.id());
            backend
                .store(&core.new_content_since(None).remove(0))
                .await
                .unwrap();
            backend.compact().await.unwrap();
        }

        let max_top = 1usize << MAX_LEVELS;
        assert!(backend.block_count().await <= max_top + 1);

        // Every covalue is still readable.
        for id in &ids {
            let chunk = backend.load(id).await.unwrap();
            assert!(chunk.is_some(), "covalue {id} lost in compaction");
        }
    }
}
