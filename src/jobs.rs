//! Job queue and worker pool (§4.C): long-running pipeline stages
//! (ingest, embed, extract_concepts, cluster, summarize, suggest) run
//! as durable background jobs rather than blocking a request.
//!
//! State machine `Pending -> Processing -> Success|Failure`, with a
//! `Retry` transition on a retryable failure, grounded on the teacher's
//! saga step-retry loop (`saga.rs::execute_step_with_retry`): same
//! exponential backoff formula (`100ms * 2^(attempt-1)`), generalized
//! from one in-process saga run to jobs persisted in [`SqliteStore`]
//! and polled by a worker pool.

use crate::error::{AppError, OracleError, Result};
use crate::store::SqliteStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{Job, JobError, JobKind, JobProgress, JobState};

/// Exponential backoff before the next retry of an `attempt`-th failed
/// run, identical to the teacher's saga step retry delay.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    Duration::from_millis(100 * 2u64.pow(attempt.saturating_sub(1)))
}

/// One unit of background work a worker can execute. Implementations
/// live alongside their pipeline stage (ingest, embedding, ...); the
/// queue itself knows nothing about what a job *does*, only how to
/// route it by [`JobKind`] and track its lifecycle.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;
    async fn run(&self, job: &Job) -> Result<serde_json::Value>;
}

pub struct NewJob {
    pub kind: JobKind,
    pub owner_username: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// Enqueue `job` as `Pending` with a fresh id. Call sites are expected
/// to enqueue right after admission control (usage quota, §4.L) passes.
pub async fn enqueue(store: &SqliteStore, job: NewJob) -> Result<Job> {
    let now = Utc::now();
    let record = Job {
        id: uuid::Uuid::new_v4().to_string(),
        kind: job.kind,
        owner_username: job.owner_username,
        payload: job.payload,
        state: JobState::Pending,
        progress: JobProgress { percent: 0, message: "queued".to_string() },
        attempt: 0,
        max_attempts: job.max_attempts,
        result: None,
        error: None,
        created_at: now,
        updated_at: now,
    };
    store.create_job(&record).await?;
    info!(job_id = %record.id, kind = ?record.kind, "job enqueued");
    Ok(record)
}

/// Polling worker pool (§4.C): `concurrency` tasks each loop
/// claim-run-settle against the shared store, backing off when the
/// queue is empty rather than busy-spinning.
pub struct WorkerPool {
    store: Arc<SqliteStore>,
    handlers: Vec<Arc<dyn JobHandler>>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(store: Arc<SqliteStore>, handlers: Vec<Arc<dyn JobHandler>>, concurrency: usize) -> Self {
        Self { store, handlers, concurrency, poll_interval: Duration::from_millis(200) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn handler_for(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.iter().find(|h| h.kind() == kind).cloned()
    }

    /// Spawn `concurrency` worker tasks, each looping
    /// claim-next-pending -> dispatch -> settle until `shutdown` fires.
    /// Mirrors the daemon's long-running background-task role
    /// (`agency-daemon.rs`), generalized from one API process to a pool
    /// of queue workers.
    pub fn spawn(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(self.concurrency);

        for worker_id in 0..self.concurrency {
            let pool = self.clone();
            let permits = permits.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        debug!(worker_id, "worker shutting down");
                        return;
                    }
                    let _permit = permits.acquire().await.expect("semaphore never closed");
                    match pool.tick().await {
                        Ok(true) => continue,
                        Ok(false) => {
                            tokio::select! {
                                _ = tokio::time::sleep(pool.poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(e) => {
                            error!(worker_id, error = %e, "worker tick failed");
                            tokio::time::sleep(pool.poll_interval).await;
                        }
                    }
                }
            }));
        }

        handles
    }

    /// Claim and run exactly one job; `Ok(true)` if a job was found
    /// (whatever the outcome), `Ok(false)` if the queue was empty.
    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.store.claim_next_pending_job().await? else { return Ok(false) };
        self.run_claimed(job).await?;
        Ok(true)
    }

    async fn run_claimed(&self, mut job: Job) -> Result<()> {
        job.attempt += 1;
        let Some(handler) = self.handler_for(job.kind) else {
            job.state = JobState::Failure;
            job.error = Some(JobError { kind: "internal".to_string(), message: format!("no handler registered for job kind {:?}", job.kind) });
            job.updated_at = Utc::now();
            self.store.update_job(&job).await?;
            return Ok(());
        };

        job.progress = JobProgress { percent: 10, message: "running".to_string() };
        self.store.update_job(&job).await?;

        match handler.run(&job).await {
            Ok(result) => {
                job.state = JobState::Success;
                job.progress = JobProgress { percent: 100, message: "done".to_string() };
                job.result = Some(result);
                job.error = None;
                job.updated_at = Utc::now();
                self.store.update_job(&job).await?;
                info!(job_id = %job.id, attempt = job.attempt, "job succeeded");
            }
            Err(err) => self.settle_failure(job, err).await?,
        }
        Ok(())
    }

    async fn settle_failure(&self, mut job: Job, err: AppError) -> Result<()> {
        let retryable = err.is_retryable() && job.attempt < job.max_attempts;
        job.error = Some(JobError { kind: err.category().to_string(), message: err.to_string() });
        job.updated_at = Utc::now();

        if retryable {
            job.state = JobState::Retry;
            job.progress = JobProgress { percent: 0, message: format!("retrying (attempt {}/{})", job.attempt, job.max_attempts) };
            self.store.update_job(&job).await?;
            warn!(job_id = %job.id, attempt = job.attempt, error = %err, "job failed, scheduling retry");

            let delay = backoff_for_attempt(job.attempt);
            let store = (*self.store).clone();
            let job_id = job.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = store.reset_job_to_pending(&job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to requeue job after backoff");
                }
            });
        } else {
            job.state = JobState::Failure;
            job.progress = JobProgress { percent: 0, message: "failed".to_string() };
            self.store.update_job(&job).await?;
            error!(job_id = %job.id, attempt = job.attempt, error = %err, "job failed permanently");
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("concurrency", &self.concurrency).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn test_store() -> Arc<SqliteStore> {
        let config = StoreConfig {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 5,
            image_store_path: "./data/images".to_string(),
            max_upload_bytes: 100 * 1024 * 1024,
        };
        Arc::new(SqliteStore::new(&config).await.unwrap())
    }

    struct AlwaysSucceeds(JobKind, Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl JobHandler for AlwaysSucceeds {
        fn kind(&self) -> JobKind {
            self.0
        }
        async fn run(&self, _job: &Job) -> Result<serde_json::Value> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct AlwaysFailsRetryable;

    #[async_trait::async_trait]
    impl JobHandler for AlwaysFailsRetryable {
        fn kind(&self) -> JobKind {
            JobKind::Embed
        }
        async fn run(&self, _job: &Job) -> Result<serde_json::Value> {
            Err(AppError::Oracle(OracleError::Timeout))
        }
    }

    #[tokio::test]
    async fn backoff_doubles_each_attempt() {
        assert_eq!(backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff_for_attempt(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn tick_runs_one_pending_job_to_success() {
        let store = test_store().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(AlwaysSucceeds(JobKind::Ingest, calls.clone()));
        let pool = WorkerPool::new(store.clone(), vec![handler], 1);

        let job = enqueue(&store, NewJob { kind: JobKind::Ingest, owner_username: "alice".to_string(), payload: serde_json::json!({}), max_attempts: 3 })
            .await
            .unwrap();

        assert!(pool.tick().await.unwrap());
        assert!(!pool.tick().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let refreshed = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, JobState::Success);
        assert_eq!(refreshed.result.unwrap(), serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn empty_queue_tick_returns_false() {
        let store = test_store().await;
        let pool = WorkerPool::new(store, vec![], 1);
        assert!(!pool.tick().await.unwrap());
    }

    #[tokio::test]
    async fn retryable_failure_transitions_to_retry_not_failure() {
        let store = test_store().await;
        let handler = Arc::new(AlwaysFailsRetryable);
        let pool = WorkerPool::new(store.clone(), vec![handler], 1);

        let job = enqueue(&store, NewJob { kind: JobKind::Embed, owner_username: "alice".to_string(), payload: serde_json::json!({}), max_attempts: 3 })
            .await
            .unwrap();

        pool.tick().await.unwrap();
        let refreshed = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, JobState::Retry);
        assert_eq!(refreshed.attempt, 1);
    }

    #[tokio::test]
    async fn unknown_job_kind_fails_without_panicking() {
        let store = test_store().await;
        let pool = WorkerPool::new(store.clone(), vec![], 1);
        let job = enqueue(&store, NewJob { kind: JobKind::Suggest, owner_username: "alice".to_string(), payload: serde_json::json!({}), max_attempts: 3 })
            .await
            .unwrap();
        pool.tick().await.unwrap();
        let refreshed = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, JobState::Failure);
    }
}
