// src/queue/mod.rs
//! Credential lifecycle queue.
//!
//! Jobs are persisted in SQLite ([`JobStore`]) and executed by a fixed pool of
//! workers ([`worker::WorkerPool`]). Failures are classified; only retryable
//! ones are rescheduled, with the delay given by the job's backoff policy.

pub mod backoff;
pub mod handlers;
pub mod lock;
pub mod worker;

use crate::auth::protocol::JobScheduler;
use crate::error::QueueError;
use crate::models::job::{Job, JobId, JobPayload, JobState, JobStatus, Priority, RetryPolicy};
use crate::storage::job_store::{CancelOutcome, JobStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Queue facade shared by the API and the workers.
pub struct JobQueue {
    store: Arc<JobStore>,
    /// Wakes an idle worker when work arrives
    notify: Arc<Notify>,
    default_retry: RetryPolicy,
}

impl JobQueue {
    /// Creates a queue over `store`.
    ///
    /// # Arguments
    /// * `store` - Durable job table
    /// * `default_retry` - Policy applied when `enqueue` is given none
    pub fn new(store: Arc<JobStore>, default_retry: RetryPolicy) -> Self {
        JobQueue {
            store,
            notify: Arc::new(Notify::new()),
            default_retry,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Persists a new job and wakes a worker.
    ///
    /// # Returns
    /// The job id (UUID v4)
    pub fn enqueue(
        &self,
        payload: JobPayload,
        priority: Priority,
        retry: Option<RetryPolicy>,
    ) -> Result<JobId, QueueError> {
        let now = Utc::now();
        let mut retry = retry.unwrap_or(self.default_retry);
        retry.attempts = retry.attempts.max(1);

        let job = Job {
            id: Uuid::new_v4().to_string(),
            subject_key: payload.subject_key(),
            payload,
            priority,
            state: JobState::Waiting,
            attempts_made: 0,
            retry,
            progress: 0,
            run_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&job)?;
        log::info!(
            "enqueued {} job {} ({:?} priority)",
            job.payload.kind().as_str(),
            job.id,
            priority
        );
        self.notify.notify_one();
        Ok(job.id)
    }

    /// Current status of a job.
    pub fn status(&self, id: &str) -> Result<JobStatus, QueueError> {
        self.store
            .get(id)?
            .map(|job| job.status())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Cancels a job that has not started executing.
    pub fn cancel(&self, id: &str) -> Result<(), QueueError> {
        match self.store.cancel(id, Utc::now())? {
            CancelOutcome::Cancelled => {
                log::info!("cancelled job {}", id);
                Ok(())
            }
            CancelOutcome::NotFound => Err(QueueError::NotFound(id.to_string())),
            CancelOutcome::NotCancellable(state) => Err(QueueError::NotCancellable {
                id: id.to_string(),
                state: state.as_str().to_string(),
            }),
        }
    }

    /// Returns jobs interrupted by a previous crash to the waiting set.
    pub fn recover(&self) -> Result<usize, QueueError> {
        let recovered = self.store.recover_active(Utc::now())?;
        if recovered > 0 {
            log::warn!("requeued {} jobs interrupted by a previous shutdown", recovered);
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    /// Number of jobs per state.
    pub fn counts(&self) -> Result<BTreeMap<String, i64>, QueueError> {
        Ok(self.store.counts()?)
    }
}

impl JobScheduler for JobQueue {
    fn schedule(&self, payload: JobPayload, priority: Priority) -> Result<JobId, QueueError> {
        self.enqueue(payload, priority, None)
    }
}
