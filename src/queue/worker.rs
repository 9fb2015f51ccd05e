// src/queue/worker.rs
//! Fixed-size worker pool draining the job queue.

use crate::error::StoreError;
use crate::models::job::Job;
use crate::queue::backoff::{retry_delay, should_retry};
use crate::queue::handlers::{JobContext, JobHandler};
use crate::queue::lock::KeyedLocks;
use crate::queue::JobQueue;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// How often an idle worker looks for due jobs without being woken
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            workers: 4,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// One claim-execute-settle loop.
pub struct Worker {
    id: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    locks: Arc<KeyedLocks>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Worker {
            id,
            queue,
            handler,
            locks,
        }
    }

    /// Claims and runs at most one due job.
    ///
    /// # Returns
    /// `true` if a job was run, `false` if nothing was due
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let Some(job) = self.queue.store().claim_next(Utc::now())? else {
            return Ok(false);
        };
        self.execute(job).await?;
        Ok(true)
    }

    /// Runs one claimed job under its subject lock and records the outcome.
    ///
    /// # Process Flow
    /// 1. Takes the subject lock, if the job has a subject key
    /// 2. Runs the handler
    /// 3. On success marks the job completed
    /// 4. On a retryable failure with attempts left, reschedules it after the backoff delay
    /// 5. Otherwise marks it failed, keeping the classified error
    async fn execute(&self, job: Job) -> Result<(), StoreError> {
        let _subject_lock = match &job.subject_key {
            Some(key) => Some(self.locks.acquire(key).await),
            None => None,
        };
        log::debug!(
            "worker {} running {} job {} (attempt {}/{})",
            self.id,
            job.payload.kind().as_str(),
            job.id,
            job.attempts_made,
            job.retry.attempts
        );

        let outcome = self
            .handler
            .handle(&JobContext::new(&job, self.queue.store()))
            .await;
        let now = Utc::now();
        let store = self.queue.store();

        match outcome {
            Ok(()) => {
                store.complete(&job.id, now)?;
                log::info!("job {} completed", job.id);
            }
            Err(error) if error.retryable && should_retry(&job.retry, job.attempts_made) => {
                let delay = retry_delay(&job.retry, job.attempts_made);
                store.reschedule(&job.id, now + delay, &error, now)?;
                log::warn!(
                    "job {} attempt {}/{} failed, retrying in {} ms: {}",
                    job.id,
                    job.attempts_made,
                    job.retry.attempts,
                    delay.num_milliseconds(),
                    error
                );
            }
            Err(error) => {
                store.fail(&job.id, &error, now)?;
                log::error!(
                    "job {} failed after {} attempt(s): {}",
                    job.id,
                    job.attempts_made,
                    error
                );
            }
        }

        // Settling a subject job may unblock the next one for that subject.
        if job.subject_key.is_some() {
            self.queue.notifier().notify_one();
        }
        Ok(())
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, poll_interval: Duration) {
        let notify = self.queue.notifier();
        log::info!("worker {} started", self.id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => log::error!("worker {} could not reach the job store: {}", self.id, e),
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("worker {} stopped", self.id);
    }
}

/// Running set of workers.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.workers` workers sharing one lock table.
    pub fn start(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let locks = Arc::new(KeyedLocks::new());
        log::info!("starting {} queue workers", config.workers);

        let handles = (0..config.workers)
            .map(|id| {
                let worker = Worker::new(id, queue.clone(), handler.clone(), locks.clone());
                tokio::spawn(worker.run(receiver.clone(), config.poll_interval))
            })
            .collect();
        WorkerPool { shutdown, handles }
    }

    /// Signals every worker to stop and waits for in-flight jobs to settle.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            log::debug!("all workers already stopped");
        }
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                log::error!("worker task ended abnormally: {}", e);
            }
        }
    }
}
