// src/storage/job_store.rs
//! Durable job table.
//!
//! Jobs survive restarts. A job is claimed by flipping it to `active` inside a
//! transaction, so one job is delivered to at most one worker at a time. A crash
//! leaves the job `active`; [`JobStore::recover_active`] puts such jobs back in
//! the waiting set on the next start (at-least-once delivery).

use crate::error::StoreError;
use crate::errors::classifier::ClassifiedError;
use crate::models::job::{Job, JobPayload, JobState, Priority, RetryPolicy};
use crate::storage::database::{from_millis, to_millis, Database};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

const JOB_COLUMNS: &str = "id, payload, priority, state, attempts_made, retry, progress, \
                           run_at, last_error, subject_key, created_at, updated_at";

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    NotCancellable(JobState),
}

/// Columns as read from SQLite, before JSON decoding.
struct RawJob {
    id: String,
    payload: String,
    priority: i64,
    state: String,
    attempts_made: i64,
    retry: String,
    progress: i64,
    run_at: i64,
    last_error: Option<String>,
    subject_key: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawJob {
            id: row.get(0)?,
            payload: row.get(1)?,
            priority: row.get(2)?,
            state: row.get(3)?,
            attempts_made: row.get(4)?,
            retry: row.get(5)?,
            progress: row.get(6)?,
            run_at: row.get(7)?,
            last_error: row.get(8)?,
            subject_key: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let state = JobState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job state {}", self.state)))?;
        let last_error = match self.last_error {
            Some(raw) => Some(serde_json::from_str::<ClassifiedError>(&raw)?),
            None => None,
        };
        Ok(Job {
            id: self.id,
            payload: serde_json::from_str::<JobPayload>(&self.payload)?,
            priority: Priority::from_value(self.priority),
            state,
            attempts_made: u32::try_from(self.attempts_made).unwrap_or(0),
            retry: serde_json::from_str::<RetryPolicy>(&self.retry)?,
            progress: u8::try_from(self.progress.clamp(0, 100)).unwrap_or(0),
            run_at: from_millis(self.run_at)?,
            last_error,
            subject_key: self.subject_key,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    pub fn new(db: Arc<Database>) -> Self {
        JobStore { db }
    }

    pub fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        let last_error = match &job.last_error {
            Some(err) => Some(serde_json::to_string(err)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO jobs (id, kind, payload, priority, state, attempts_made, retry, progress,
                               run_at, last_error, subject_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.payload.kind().as_str(),
                serde_json::to_string(&job.payload)?,
                job.priority.value(),
                job.state.as_str(),
                job.attempts_made,
                serde_json::to_string(&job.retry)?,
                job.progress,
                to_millis(job.run_at),
                last_error,
                job.subject_key,
                to_millis(job.created_at),
                to_millis(job.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.db.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    /// Claims the next runnable job and marks it active.
    ///
    /// Runnable: waiting or delayed with `run_at <= now`, and no earlier-enqueued job
    /// with the same subject key still pending or running. Ordered by priority, then
    /// enqueue order.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let raw = tx
            .query_row(
                &format!(
                    "SELECT {} FROM jobs j
                     WHERE j.state IN ('waiting', 'delayed') AND j.run_at <= ?1
                       AND (j.subject_key IS NULL OR NOT EXISTS (
                            SELECT 1 FROM jobs o
                            WHERE o.subject_key = j.subject_key AND o.seq < j.seq
                              AND o.state IN ('waiting', 'delayed', 'active')))
                     ORDER BY j.priority ASC, j.seq ASC
                     LIMIT 1",
                    JOB_COLUMNS
                ),
                params![to_millis(now)],
                RawJob::from_row,
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE jobs SET state = 'active', attempts_made = attempts_made + 1, updated_at = ?2
             WHERE id = ?1",
            params![raw.id, to_millis(now)],
        )?;
        tx.commit()?;

        let mut job = raw.into_job()?;
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.updated_at = now;
        Ok(Some(job))
    }

    pub fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE jobs SET state = 'completed', progress = 100, last_error = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, to_millis(now)],
        )?;
        Ok(())
    }

    /// Puts a failed job back in the queue to run at `run_at`.
    pub fn reschedule(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        error: &ClassifiedError,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        let state = if run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        conn.execute(
            "UPDATE jobs SET state = ?2, run_at = ?3, last_error = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                id,
                state.as_str(),
                to_millis(run_at),
                serde_json::to_string(error)?,
                to_millis(now)
            ],
        )?;
        Ok(())
    }

    /// Moves a job to the terminal failed state, retaining its last error.
    pub fn fail(&self, id: &str, error: &ClassifiedError, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE jobs SET state = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(error)?, to_millis(now)],
        )?;
        Ok(())
    }

    pub fn set_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE jobs SET progress = ?2 WHERE id = ?1 AND state = 'active'",
            params![id, progress.min(100)],
        )?;
        Ok(())
    }

    /// Cancels a job that has not started executing.
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE jobs SET state = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND state IN ('waiting', 'delayed')",
            params![id, to_millis(now)],
        )?;
        if updated > 0 {
            return Ok(CancelOutcome::Cancelled);
        }
        let state: Option<String> = conn
            .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        match state {
            None => Ok(CancelOutcome::NotFound),
            Some(raw) => {
                let state = JobState::parse(&raw)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown job state {}", raw)))?;
                Ok(CancelOutcome::NotCancellable(state))
            }
        }
    }

    /// Returns jobs left active by a previous process to the waiting set.
    pub fn recover_active(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let recovered = conn.execute(
            "UPDATE jobs SET state = 'waiting', run_at = ?1, updated_at = ?1 WHERE state = 'active'",
            params![to_millis(now)],
        )?;
        Ok(recovered)
    }

    /// Number of jobs per state.
    pub fn counts(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, count) = row?;
            counts.insert(state, count);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::classifier::{classify, Upstream, UpstreamError};
    use crate::models::job::{SyncProfileJob, TransferCredentialJob};
    use chrono::Duration;
    use ethers::types::Address;

    fn store() -> JobStore {
        JobStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn job(id: &str, payload: JobPayload, priority: Priority, now: DateTime<Utc>) -> Job {
        Job {
            id: id.to_string(),
            subject_key: payload.subject_key(),
            payload,
            priority,
            state: JobState::Waiting,
            attempts_made: 0,
            retry: RetryPolicy::default(),
            progress: 0,
            run_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sync_payload() -> JobPayload {
        JobPayload::SyncExternalProfile(SyncProfileJob {
            address: Address::repeat_byte(7),
            name: None,
            email: None,
            phone: None,
            wallet_verified: true,
            credential_count: 0,
            verified_at: Utc::now(),
        })
    }

    fn transfer_payload(subject: &str) -> JobPayload {
        JobPayload::TransferCredential(TransferCredentialJob {
            subject: subject.to_string(),
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            attestation: "0x".into(),
        })
    }

    #[test]
    fn test_claim_orders_by_priority_then_fifo() {
        let store = store();
        let now = Utc::now();
        store.insert(&job("low", sync_payload(), Priority::Low, now)).unwrap();
        store.insert(&job("normal-1", sync_payload(), Priority::Normal, now)).unwrap();
        store.insert(&job("normal-2", sync_payload(), Priority::Normal, now)).unwrap();
        store.insert(&job("high", sync_payload(), Priority::High, now)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| store.claim_next(now).unwrap())
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_claim_marks_active_and_counts_attempt() {
        let store = store();
        let now = Utc::now();
        store.insert(&job("a", sync_payload(), Priority::Normal, now)).unwrap();
        let claimed = store.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);
        assert!(store.claim_next(now).unwrap().is_none());

        let persisted = store.get("a").unwrap().unwrap();
        assert_eq!(persisted.state, JobState::Active);
        assert_eq!(persisted.attempts_made, 1);
    }

    #[test]
    fn test_same_subject_waits_for_earlier_job() {
        let store = store();
        let now = Utc::now();
        store.insert(&job("t1", transfer_payload("s"), Priority::Normal, now)).unwrap();
        store.insert(&job("t2", transfer_payload("s"), Priority::High, now)).unwrap();
        store.insert(&job("other", transfer_payload("x"), Priority::Low, now)).unwrap();

        assert_eq!(store.claim_next(now).unwrap().unwrap().id, "t1");
        // t2 is blocked behind the active t1; the other subject runs.
        assert_eq!(store.claim_next(now).unwrap().unwrap().id, "other");
        assert!(store.claim_next(now).unwrap().is_none());

        store.complete("t1", now).unwrap();
        assert_eq!(store.claim_next(now).unwrap().unwrap().id, "t2");
    }

    #[test]
    fn test_delayed_job_blocks_later_subject_job() {
        let store = store();
        let now = Utc::now();
        let error = classify(&UpstreamError::timeout(Upstream::Ledger));
        store.insert(&job("t1", transfer_payload("s"), Priority::Normal, now)).unwrap();
        store.insert(&job("t2", transfer_payload("s"), Priority::Normal, now)).unwrap();

        store.claim_next(now).unwrap().unwrap();
        store.reschedule("t1", now + Duration::seconds(30), &error, now).unwrap();
        assert_eq!(store.get("t1").unwrap().unwrap().state, JobState::Delayed);
        assert!(store.claim_next(now).unwrap().is_none());

        let later = now + Duration::seconds(31);
        assert_eq!(store.claim_next(later).unwrap().unwrap().id, "t1");
    }

    #[test]
    fn test_fail_retains_error_and_complete_clears_it() {
        let store = store();
        let now = Utc::now();
        let error = classify(&UpstreamError::timeout(Upstream::Backend));
        store.insert(&job("f", sync_payload(), Priority::Normal, now)).unwrap();
        store.insert(&job("c", sync_payload(), Priority::Normal, now)).unwrap();

        store.fail("f", &error, now).unwrap();
        let failed = store.get("f").unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.last_error, Some(error.clone()));

        store.reschedule("c", now, &error, now).unwrap();
        store.complete("c", now).unwrap();
        let completed = store.get("c").unwrap().unwrap();
        assert_eq!(completed.state, JobState::Completed);
        assert_eq!(completed.progress, 100);
        assert!(completed.last_error.is_none());
    }

    #[test]
    fn test_cancel_only_before_start() {
        let store = store();
        let now = Utc::now();
        store.insert(&job("w", sync_payload(), Priority::Normal, now)).unwrap();
        store.insert(&job("r", sync_payload(), Priority::Low, now)).unwrap();
        store.claim_next(now).unwrap();

        assert_eq!(
            store.cancel("r", now).unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            store.cancel("w", now).unwrap(),
            CancelOutcome::NotCancellable(JobState::Active)
        );
        assert_eq!(store.cancel("missing", now).unwrap(), CancelOutcome::NotFound);
        assert!(store.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn test_recover_active_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let path = path.to_str().unwrap();
        let now = Utc::now();
        {
            let store = JobStore::new(Arc::new(Database::open(path).unwrap()));
            store.insert(&job("crash", sync_payload(), Priority::Normal, now)).unwrap();
            store.claim_next(now).unwrap().unwrap();
        }
        let store = JobStore::new(Arc::new(Database::open(path).unwrap()));
        assert!(store.claim_next(now).unwrap().is_none());
        assert_eq!(store.recover_active(now).unwrap(), 1);
        let redelivered = store.claim_next(now).unwrap().unwrap();
        assert_eq!(redelivered.id, "crash");
        assert_eq!(redelivered.attempts_made, 2);
    }

    #[test]
    fn test_counts_by_state() {
        let store = store();
        let now = Utc::now();
        store.insert(&job("a", sync_payload(), Priority::Normal, now)).unwrap();
        store.insert(&job("b", sync_payload(), Priority::Normal, now)).unwrap();
        store.claim_next(now).unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts.get("active"), Some(&1));
        assert_eq!(counts.get("waiting"), Some(&1));
    }
}
