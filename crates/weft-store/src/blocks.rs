//! Block files: sorted, trailer-indexed chunk storage.
//!
//! A block holds one encoded chunk per covalue, sorted by id, followed
//! by a JSON trailer index whose byte length is carried in the file
//! name. A reader seeks straight to the trailer and then to individual
//! chunks without ever loading the whole block.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use weft_core::CoId;

use crate::chunk::CoValueChunk;
use crate::error::{Result, StoreError};
use crate::wal::WalEntry;

/// Where one covalue's chunk lives inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailerEntry {
    pub id: CoId,
    pub start: u64,
    pub length: u64,
}

/// An opened block file with its parsed trailer cached.
#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    level: u32,
    trailer: Vec<TrailerEntry>,
}

/// Write a block of chunks at the given level; returns its path.
///
/// File name: `<firstID>-<lastID>-<hash>-L<level>-H<trailerByteLen>.jsonl`.
pub fn write_block(
    dir: &Path,
    level: u32,
    chunks: &BTreeMap<CoId, CoValueChunk>,
) -> Result<PathBuf> {
    let mut body = Vec::new();
    let mut trailer = Vec::with_capacity(chunks.len());

    for (id, chunk) in chunks {
        let entry = WalEntry {
            id: *id,
            header: chunk.header.clone(),
            session_entries: chunk.session_entries.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        trailer.push(TrailerEntry {
            id: *id,
            start: body.len() as u64,
            length: line.len() as u64,
        });
        body.extend_from_slice(&line);
    }

    let trailer_bytes = serde_json::to_vec(&trailer)?;
    let hash = &hex::encode(blake3::hash(&body).as_bytes())[..16];

    let first = chunks.keys().next().map(|id| id.to_string()).unwrap_or_default();
    let last = chunks.keys().last().map(|id| id.to_string()).unwrap_or_default();
    let name = format!("{first}-{last}-{hash}-L{level}-H{}.jsonl", trailer_bytes.len());
    let path = dir.join(name);

    let mut file = File::create(&path)?;
    file.write_all(&body)?;
    file.write_all(&trailer_bytes)?;
    file.sync_data()?;
    Ok(path)
}

/// Parse `-L<level>-H<trailerLen>.jsonl` off a block file name.
fn parse_block_name(name: &str) -> Option<(u32, u64)> {
    let stem = name.strip_suffix(".jsonl")?;
    let (rest, trailer_part) = stem.rsplit_once("-H")?;
    let trailer_len: u64 = trailer_part.parse().ok()?;
    let (_, level_part) = rest.rsplit_once("-L")?;
    let level: u32 = level_part.parse().ok()?;
    Some((level, trailer_len))
}

/// All block files in `dir`, in name order.
pub fn block_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with("wal-") && parse_block_name(n).is_some())
        })
        .collect();
    files.sort();
    Ok(files)
}

impl BlockFile {
    /// Open a block: a single seek to the trailer, parsed once and
    /// cached for every later lookup.
    pub fn open(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::Corrupt(format!("bad block path {}", path.display())))?;
        let (level, trailer_len) = parse_block_name(name)
            .ok_or_else(|| StoreError::Corrupt(format!("unparseable block name {name}")))?;

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if trailer_len > file_len {
            return Err(StoreError::Corrupt(format!(
                "trailer length {trailer_len} exceeds file size {file_len}"
            )));
        }
        file.seek(SeekFrom::End(-(trailer_len as i64)))?;
        let mut trailer_bytes = vec![0u8; trailer_len as usize];
        file.read_exact(&mut trailer_bytes)?;
        let trailer: Vec<TrailerEntry> = serde_json::from_slice(&trailer_bytes)?;

        Ok(Self {
            path: path.to_path_buf(),
            level,
            trailer,
        })
    }

    /// This block's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// This block's level.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Ids indexed by this block.
    pub fn ids(&self) -> impl Iterator<Item = &CoId> {
        self.trailer.iter().map(|e| &e.id)
    }

    /// Point lookup through the trailer.
    pub fn load_chunk(&self, id: &CoId) -> Result<Option<CoValueChunk>> {
        let Ok(pos) = self.trailer.binary_search_by(|e| e.id.cmp(id)) else {
            return Ok(None);
        };
        let entry = &self.trailer[pos];

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.start))?;
        let mut bytes = vec![0u8; entry.length as usize];
        file.read_exact(&mut bytes)?;

        let wal_entry: WalEntry = serde_json::from_slice(&bytes)?;
        let (_, chunk) = wal_entry.into_chunk();
        Ok(Some(chunk))
    }

    /// Read every chunk in the block (compaction path).
    pub fn load_all(&self) -> Result<BTreeMap<CoId, CoValueChunk>> {
        let mut chunks = BTreeMap::new();
        for entry in &self.trailer {
            if let Some(chunk) = self.load_chunk(&entry.id)? {
                chunks.insert(entry.id, chunk);
            }
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SessionEntry;
    use weft_core::{PrincipalId, SessionId, Signature, Transaction};

    fn chunk(id_byte: u8, txs: usize) -> (CoId, CoValueChunk) {
        let id = CoId::from_bytes([id_byte; 32]);
        let session =
            SessionId::with_nonce(PrincipalId::Account(id), [0; 8]);
        let mut session_entries = BTreeMap::new();
        session_entries.insert(
            session,
            vec![SessionEntry {
                after: 0,
                last_signature: Signature::from_bytes([1; 64]),
                transactions: (0..txs)
                    .map(|n| Transaction::trusting(n as i64, vec![serde_json::json!(n)]))
                    .collect(),
            }],
        );
        (
            id,
            CoValueChunk {
                header: None,
                session_entries,
            },
        )
    }

    #[test]
    fn test_write_open_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunks = BTreeMap::new();
        for byte in [1u8, 3, 7] {
            let (id, c) = chunk(byte, byte as usize);
            chunks.insert(id, c);
        }

        let path = write_block(dir.path(), 3, &chunks).unwrap();
        let block = BlockFile::open(&path).unwrap();
        assert_eq!(block.level(), 3);
        assert_eq!(block.ids().count(), 3);

        let loaded = block
            .load_chunk(&CoId::from_bytes([3; 32]))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.transaction_count(), 3);

        assert!(block
            .load_chunk(&CoId::from_bytes([9; 32]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_block_name_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunks = BTreeMap::new();
        let (id, c) = chunk(5, 1);
        chunks.insert(id, c);

        let path = write_block(dir.path(), 2, &chunks).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.contains("-L2-H"));

        let files = block_files(dir.path()).unwrap();
        assert_eq!(files, vec![path]);
    }

    #[test]
    fn test_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunks = BTreeMap::new();
        for byte in [2u8, 4] {
            let (id, c) = chunk(byte, 1);
            chunks.insert(id, c);
        }
        let path = write_block(dir.path(), 3, &chunks).unwrap();
        let block = BlockFile::open(&path).unwrap();
        assert_eq!(block.load_all().unwrap(), chunks);
    }
}
