//! Write-ahead log: append-only JSON-lines files.
//!
//! Every incoming content message is appended here before anything else;
//! durability depends only on this write succeeding. Compaction later
//! folds WAL entries into block files and deletes the consumed logs.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use weft_core::{CoId, CoValueHeader, NewContent, SessionId};

use crate::chunk::{CoValueChunk, SessionEntry};
use crate::error::Result;

/// One WAL line: a chunk tagged with its covalue id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    pub id: CoId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub session_entries: std::collections::BTreeMap<SessionId, Vec<SessionEntry>>,
}

impl WalEntry {
    /// Build a WAL line from an incoming content message.
    pub fn from_content(content: &NewContent) -> Self {
        let chunk = CoValueChunk::from_content(content);
        Self {
            id: content.id,
            header: chunk.header,
            session_entries: chunk.session_entries,
        }
    }

    /// The chunk this line carries.
    pub fn into_chunk(self) -> (CoId, CoValueChunk) {
        (
            self.id,
            CoValueChunk {
                header: self.header,
                session_entries: self.session_entries,
            },
        )
    }
}

/// Appender for one WAL file.
pub struct WalWriter {
    file: File,
    path: PathBuf,
}

impl WalWriter {
    /// Open a fresh WAL file in `dir` named `wal-<timestamp>-<rand>.jsonl`.
    pub fn create(dir: &Path) -> Result<Self> {
        use rand::Rng;
        let timestamp = now_millis();
        let rand: u32 = rand::thread_rng().gen();
        let path = dir.join(format!("wal-{timestamp}-{rand:08x}.jsonl"));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// This writer's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and sync it to disk.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// All WAL files in `dir`, oldest first.
pub fn wal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("wal-") && n.ends_with(".jsonl"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Read every parseable entry of one WAL file.
///
/// Corrupt lines (a torn final write after a crash) are logged and
/// skipped, never fabricated.
pub fn read_wal_file(path: &Path) -> Result<Vec<WalEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(path = %path.display(), line = line_no + 1, error = %e, "skipping corrupt WAL line");
            }
        }
    }
    Ok(entries)
}

pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}
