// src/storage/database.rs
//! SQLite database shared by the job queue and the credential table.
//!
//! A single connection guarded by a mutex: every store operation is a short local
//! statement or transaction, so callers run them inline on the async task.

use crate::error::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL,
    state TEXT NOT NULL,
    attempts_made INTEGER NOT NULL DEFAULT 0,
    retry TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    run_at INTEGER NOT NULL,
    last_error TEXT,
    subject_key TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_claim ON jobs (state, priority, seq);
CREATE INDEX IF NOT EXISTS jobs_subject ON jobs (subject_key, seq);

CREATE TABLE IF NOT EXISTS credentials (
    id TEXT PRIMARY KEY NOT NULL,
    subject TEXT NOT NULL,
    holder TEXT NOT NULL,
    issuer TEXT NOT NULL,
    token TEXT NOT NULL,
    status TEXT NOT NULL,
    request_id TEXT NOT NULL UNIQUE,
    issued_at INTEGER NOT NULL,
    superseded_at INTEGER,
    superseded_by TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS credentials_one_active
    ON credentials (subject) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS credentials_holder ON credentials (holder, status);
";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let path = path.to_str().unwrap();
        Database::open(path).unwrap();
        // Re-opening runs the schema again without error.
        Database::open(path).unwrap();
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc.timestamp_millis_opt(Utc::now().timestamp_millis()).unwrap();
        assert_eq!(from_millis(to_millis(now)).unwrap(), now);
    }
}
