//! Schema migrations for the SQLite engine.
//!
//! Forward-only numbered migrations, gated by the `user_version` pragma.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database is at version {current}, newer than supported {CURRENT_VERSION}"
        )));
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let tx = conn.transaction()?;
        apply_migration(&tx, version)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per covalue: the immutable header, JSON-encoded.
        CREATE TABLE coValues (
            id TEXT PRIMARY KEY,
            header TEXT NOT NULL
        );

        -- One row per session log. lastIdx always reflects exactly the
        -- rows present in transactions for this ses.
        CREATE TABLE sessions (
            rowID INTEGER PRIMARY KEY,
            coValue TEXT NOT NULL,
            sessionID TEXT NOT NULL,
            lastIdx INTEGER NOT NULL,
            lastSignature TEXT NOT NULL,
            bytesSinceLastSignature INTEGER NOT NULL DEFAULT 0,
            UNIQUE (sessionID, coValue)
        );

        -- Transaction payloads, JSON-encoded.
        CREATE TABLE transactions (
            ses INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            tx TEXT NOT NULL,
            PRIMARY KEY (ses, idx)
        ) WITHOUT ROWID;

        -- Signature checkpoints within large sessions.
        CREATE TABLE signatureAfter (
            ses INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            signature TEXT NOT NULL,
            PRIMARY KEY (ses, idx)
        ) WITHOUT ROWID;

        CREATE INDEX idx_sessions_coValue ON sessions(coValue);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"coValues".to_string()));
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"transactions".to_string()));
        assert!(tables.contains(&"signatureAfter".to_string()));
    }

    #[test]
    fn test_migration_idempotent_and_versioned() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_newer_database_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(
            migrate(&mut conn),
            Err(StoreError::Migration(_))
        ));
    }
}
