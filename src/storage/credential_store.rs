// src/storage/credential_store.rs
//! Credential storage for issued Verifiable Credentials.
//!
//! Records are never removed. At most one record per subject is `active`
//! (enforced by a partial unique index); a transfer supersedes the active record
//! and inserts its replacement in one transaction.

use crate::error::StoreError;
use crate::models::credential::{CredentialRecord, CredentialStatus};
use crate::models::did::Did;
use crate::storage::database::{from_millis, to_millis, Database};
use crate::utils::crypto::{format_address, parse_address};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;

const CREDENTIAL_COLUMNS: &str = "id, subject, holder, issuer, token, status, request_id, \
                                  issued_at, superseded_at, superseded_by";

struct RawCredential {
    id: String,
    subject: String,
    holder: String,
    issuer: String,
    token: String,
    status: String,
    request_id: String,
    issued_at: i64,
    superseded_at: Option<i64>,
    superseded_by: Option<String>,
}

impl RawCredential {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawCredential {
            id: row.get(0)?,
            subject: row.get(1)?,
            holder: row.get(2)?,
            issuer: row.get(3)?,
            token: row.get(4)?,
            status: row.get(5)?,
            request_id: row.get(6)?,
            issued_at: row.get(7)?,
            superseded_at: row.get(8)?,
            superseded_by: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<CredentialRecord, StoreError> {
        let corrupt = |what: &str, value: &str| StoreError::Corrupt(format!("{} {}", what, value));
        Ok(CredentialRecord {
            holder: parse_address(&self.holder).map_err(|_| corrupt("holder", &self.holder))?,
            issuer: self
                .issuer
                .parse::<Did>()
                .map_err(|_| corrupt("issuer", &self.issuer))?,
            status: CredentialStatus::parse(&self.status)
                .ok_or_else(|| corrupt("status", &self.status))?,
            issued_at: from_millis(self.issued_at)?,
            superseded_at: self.superseded_at.map(from_millis).transpose()?,
            id: self.id,
            subject: self.subject,
            token: self.token,
            request_id: self.request_id,
            superseded_by: self.superseded_by,
        })
    }
}

/// Durable store of issued credentials.
pub struct CredentialStore {
    db: Arc<Database>,
}

impl CredentialStore {
    pub fn new(db: Arc<Database>) -> Self {
        CredentialStore { db }
    }

    /// Stores a first-issuance credential as active.
    ///
    /// # Errors
    /// Fails if the subject already has an active credential or the request id was
    /// already used.
    pub fn insert_active(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        insert_record(&conn, record)
    }

    /// Supersedes `old_id` and stores `replacement` as active, atomically.
    ///
    /// # Returns
    /// `false` (and no change) if `old_id` is no longer the active credential.
    pub fn supersede_and_insert(
        &self,
        old_id: &str,
        replacement: &CredentialRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE credentials SET status = 'superseded', superseded_at = ?2, superseded_by = ?3
             WHERE id = ?1 AND status = 'active'",
            params![old_id, to_millis(now), replacement.id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        insert_record(&tx, replacement)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.query_one("id = ?1", id)
    }

    /// Credential issued by a given job, if any (redelivery check).
    pub fn find_by_request(&self, request_id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.query_one("request_id = ?1", request_id)
    }

    pub fn active_for_subject(&self, subject: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.query_one("subject = ?1 AND status = 'active'", subject)
    }

    /// Active credentials whose guardian is `holder`, oldest first.
    pub fn active_for_holder(&self, holder: Address) -> Result<Vec<CredentialRecord>, StoreError> {
        self.query_many(
            "holder = ?1 AND status = 'active' ORDER BY issued_at ASC, rowid ASC",
            &format_address(holder),
        )
    }

    /// Every credential ever issued for a subject, newest first.
    pub fn history(&self, subject: &str) -> Result<Vec<CredentialRecord>, StoreError> {
        self.query_many("subject = ?1 ORDER BY issued_at DESC, rowid DESC", subject)
    }

    fn query_one(&self, filter: &str, arg: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let conn = self.db.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM credentials WHERE {}", CREDENTIAL_COLUMNS, filter),
                params![arg],
                RawCredential::from_row,
            )
            .optional()?;
        raw.map(RawCredential::into_record).transpose()
    }

    fn query_many(&self, filter: &str, arg: &str) -> Result<Vec<CredentialRecord>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM credentials WHERE {}",
            CREDENTIAL_COLUMNS, filter
        ))?;
        let rows = stmt.query_map(params![arg], RawCredential::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

fn insert_record(conn: &Connection, record: &CredentialRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO credentials (id, subject, holder, issuer, token, status, request_id,
                                  issued_at, superseded_at, superseded_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id,
            record.subject,
            format_address(record.holder),
            record.issuer.to_string(),
            record.token,
            record.status.as_str(),
            record.request_id,
            to_millis(record.issued_at),
            record.superseded_at.map(to_millis),
            record.superseded_by,
        ],
    )?;
    Ok(())
}
