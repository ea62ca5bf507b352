//! SQLite storage engine.
//!
//! Equivalent semantics to the WAL+block engine over relational tables.
//! Every applied content message updates `sessions`, `transactions` and
//! `signatureAfter` inside one database transaction, so `lastIdx` always
//! reflects exactly what the transactions table holds, even across a
//! crash.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use weft_core::{
    CoId, CoValueHeader, NewContent, SessionId, Signature, Transaction,
    SIGNATURE_CHECKPOINT_BYTES,
};

use crate::chunk::{CoValueChunk, SessionEntry};
use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{StorageBackend, StoreOutcome};

/// SQLite-backed storage engine.
///
/// The connection sits behind a mutex and all work goes through
/// `spawn_blocking`, keeping the async runtime unblocked.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open a database file, running migrations as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (tests).
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Corrupt(format!("connection mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Corrupt(format!("spawn_blocking failed: {e}")))?
    }
}

fn store_in_tx(conn: &mut Connection, content: &NewContent) -> Result<StoreOutcome> {
    let tx = conn.transaction()?;
    let id = content.id.to_string();

    if let Some(header) = &content.header {
        tx.execute(
            "INSERT OR IGNORE INTO coValues (id, header) VALUES (?1, ?2)",
            params![id, serde_json::to_string(header)?],
        )?;
    }

    let mut outcome = StoreOutcome::default();

    for (session, entry) in &content.new {
        let session_str = session.to_string();

        let existing: Option<(i64, i64, i64)> = tx
            .query_row(
                "SELECT rowID, lastIdx, bytesSinceLastSignature
                 FROM sessions WHERE sessionID = ?1 AND coValue = ?2",
                params![session_str, id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let have = existing.map(|(_, last_idx, _)| last_idx).unwrap_or(0);
        if entry.after > have as u64 {
            warn!(id = %content.id, session = %session, after = entry.after, have, "content assumes transactions we do not hold");
            outcome.invalid_assumptions = true;
            continue;
        }

        let skip = (have as u64 - entry.after) as usize;
        if skip >= entry.new_transactions.len() {
            continue;
        }

        let (ses, mut bytes_since) = match existing {
            Some((ses, _, bytes)) => (ses, bytes),
            None => {
                tx.execute(
                    "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
                     VALUES (?1, ?2, 0, ?3, 0)",
                    params![id, session_str, entry.last_signature.to_string()],
                )?;
                (tx.last_insert_rowid(), 0)
            }
        };

        let mut idx = have;
        for transaction in &entry.new_transactions[skip..] {
            let encoded = serde_json::to_string(transaction)?;
            bytes_since += encoded.len() as i64;
            tx.execute(
                "INSERT INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)",
                params![ses, idx, encoded],
            )?;
            idx += 1;
        }

        if bytes_since >= SIGNATURE_CHECKPOINT_BYTES as i64 {
            tx.execute(
                "INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)",
                params![ses, idx - 1, entry.last_signature.to_string()],
            )?;
            bytes_since = 0;
        }

        tx.execute(
            "UPDATE sessions SET lastIdx = ?2, lastSignature = ?3, bytesSinceLastSignature = ?4
             WHERE rowID = ?1",
            params![ses, idx, entry.last_signature.to_string(), bytes_since],
        )?;
    }

    tx.commit()?;
    Ok(outcome)
}

fn load_chunk(conn: &Connection, id: &CoId) -> Result<Option<CoValueChunk>> {
    let id_str = id.to_string();

    let header: Option<String> = conn
        .query_row(
            "SELECT header FROM coValues WHERE id = ?1",
            params![id_str],
            |row| row.get(0),
        )
        .optional()?;
    let header: Option<CoValueHeader> = match header {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    let mut stmt = conn.prepare(
        "SELECT rowID, sessionID, lastIdx, lastSignature FROM sessions WHERE coValue = ?1",
    )?;
    let sessions: Vec<(i64, String, i64, String)> = stmt
        .query_map(params![id_str], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if header.is_none() && sessions.is_empty() {
        return Ok(None);
    }

    let mut session_entries = BTreeMap::new();
    for (ses, session_str, last_idx, signature_str) in sessions {
        let session: SessionId = session_str
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("bad session id in database: {e}")))?;
        let last_signature: Signature = signature_str
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("bad signature in database: {e}")))?;

        let mut stmt =
            conn.prepare("SELECT idx, tx FROM transactions WHERE ses = ?1 ORDER BY idx")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map(params![ses], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if rows.len() as i64 != last_idx {
            return Err(StoreError::Corrupt(format!(
                "session {session} claims {last_idx} transactions, found {}",
                rows.len()
            )));
        }

        let mut transactions = Vec::with_capacity(rows.len());
        for (_, encoded) in rows {
            let transaction: Transaction = serde_json::from_str(&encoded)?;
            transactions.push(transaction);
        }

        if !transactions.is_empty() {
            session_entries.insert(
                session,
                vec![SessionEntry {
                    after: 0,
                    last_signature,
                    transactions,
                }],
            );
        }
    }

    Ok(Some(CoValueChunk {
        header,
        session_entries,
    }))
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn load(&self, id: &CoId) -> Result<Option<CoValueChunk>> {
        let id = *id;
        self.with_conn(move |conn| load_chunk(conn, &id)).await
    }

    async fn store(&self, content: &NewContent) -> Result<StoreOutcome> {
        let content = content.clone();
        self.with_conn(move |conn| store_in_tx(conn, &content)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{
        AgentId, AgentSecret, CoValueCore, CoValueKind, MapOp, PrincipalId, Ruleset, SessionId,
        WritePrivacy,
    };

    fn sample() -> (CoValueCore, AgentSecret, SessionId) {
        let secret = AgentSecret::from_seed(&[1; 32]);
        let session = SessionId::with_nonce(PrincipalId::Agent(AgentId::of(&secret)), [1; 8]);
        let core = CoValueCore::new(CoValueHeader::new(
            CoValueKind::Map,
            Ruleset::UnsafeAllowAll,
            None,
            1,
        ));
        (core, secret, session)
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let backend = SqliteBackend::open_memory().unwrap();
        let (mut core, secret, session) = sample();
        for n in 0..3 {
            core.make_transaction(
                &session,
                secret.signer(),
                n,
                vec![MapOp::set(format!("k{n}"), serde_json::json!(n))],
                WritePrivacy::Trusting,
            )
            .unwrap();
        }

        backend
            .store(&core.new_content_since(None).remove(0))
            .await
            .unwrap();

        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert!(chunk.header.is_some());
        assert_eq!(chunk.transaction_count(), 3);
        assert_eq!(
            backend.known_state(core.id()).await.unwrap().unwrap(),
            core.known_state()
        );
    }

    #[tokio::test]
    async fn test_incremental_append() {
        let backend = SqliteBackend::open_memory().unwrap();
        let (mut core, secret, session) = sample();
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

        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_gap_is_invalid_assumptions() {
        let backend = SqliteBackend::open_memory().unwrap();
        let (mut core, secret, session) = sample();
        for n in 0..4 {
            core.make_transaction(
                &session,
                secret.signer(),
                n,
                vec![MapOp::set(format!("k{n}"), serde_json::json!(n))],
                WritePrivacy::Trusting,
            )
            .unwrap();
        }

        // Pretend the store already has 2 transactions; it has none.
        let mut assumed = weft_core::KnownState::empty(*core.id());
        assumed.header = true;
        assumed.sessions.insert(session.clone(), 2);
        let outcome = backend
            .store(&core.new_content_since(Some(&assumed)).remove(0))
            .await
            .unwrap();
        assert!(outcome.invalid_assumptions);

        // Nothing was stored for the session.
        assert!(backend.load(core.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_store_is_idempotent() {
        let backend = SqliteBackend::open_memory().unwrap();
        let (mut core, secret, session) = sample();
        core.make_transaction(
            &session,
            secret.signer(),
            0,
            vec![MapOp::set("a", serde_json::json!(0))],
            WritePrivacy::Trusting,
        )
        .unwrap();

        let content = core.new_content_since(None).remove(0);
        backend.store(&content).await.unwrap();
        let outcome = backend.store(&content).await.unwrap();
        assert!(!outcome.invalid_assumptions);

        let chunk = backend.load(core.id()).await.unwrap().unwrap();
        assert_eq!(chunk.transaction_count(), 1);
    }
}
