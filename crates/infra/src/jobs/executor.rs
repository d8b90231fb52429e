//! Job executor with retry and backoff logic.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus, RetryPolicy, TaskOutcome, TaskResult};

/// Runs the body of a task invocation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> TaskResult;
}

#[async_trait]
impl<H: TaskHandler + ?Sized> TaskHandler for Arc<H> {
    async fn handle(&self, job: &Job) -> TaskResult {
        (**self).handle(job).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobExecutorError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "credentials-worker".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            error!(error = %e, "job executor task ended abnormally");
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_skipped: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, job: &Job) {
        self.jobs_processed += 1;
        match &job.status {
            JobStatus::Succeeded if job.note.is_some() => self.jobs_skipped += 1,
            JobStatus::Succeeded => self.jobs_succeeded += 1,
            JobStatus::RetryScheduled { .. } => self.jobs_retried += 1,
            JobStatus::Failed { .. } => self.jobs_failed += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}

/// Background job executor.
///
/// Claims ready invocations from a store, runs them through the handler and
/// turns failures into follow-up invocations or dead letters.
pub struct JobExecutor<S: JobStore, H: TaskHandler> {
    store: S,
    handler: H,
    policy: RetryPolicy,
}

impl<S, H> JobExecutor<S, H>
where
    S: JobStore + 'static,
    H: TaskHandler + 'static,
{
    pub fn new(store: S, handler: H) -> Self {
        Self {
            store,
            handler,
            policy: RetryPolicy::credentials(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute a claimed invocation and persist its outcome.
    ///
    /// Returns the final status of the invocation.
    pub async fn execute_one(&self, job: &mut Job) -> Result<JobStatus, JobExecutorError> {
        if !matches!(job.status, JobStatus::Running) {
            job.mark_running();
            self.store.update(job)?;
        }

        info!(
            job_id = %job.id,
            task = job.kind.name(),
            retries = job.retries,
            "running task"
        );

        match self.handler.handle(job).await {
            Ok(TaskOutcome::Completed) => {
                job.mark_succeeded(None);
                self.store.update(job)?;
                debug!(job_id = %job.id, task = job.kind.name(), "task succeeded");
            }
            Ok(TaskOutcome::Skipped { reason }) => {
                info!(job_id = %job.id, task = job.kind.name(), reason = %reason, "task skipped");
                job.mark_succeeded(Some(reason));
                self.store.update(job)?;
            }
            Err(err) if self.policy.should_retry(job.retries) => {
                let countdown = self.policy.countdown(job.retries, err.is_rate_limited());
                let next = job.retry_after(countdown);
                let next_id = self.store.enqueue(next)?;

                warn!(
                    job_id = %job.id,
                    next_job_id = %next_id,
                    task = job.kind.name(),
                    retries = job.retries,
                    countdown_secs = countdown.as_secs(),
                    reason = %err,
                    "task failed, retry scheduled"
                );

                job.mark_retry_scheduled(next_id, countdown, err.reason().to_string());
                self.store.update(job)?;
            }
            Err(err) => {
                let message = format!("{}. Reason: {}", job.kind.failure_prefix(), err.reason());
                error!(
                    job_id = %job.id,
                    task = job.kind.name(),
                    retries = job.retries,
                    error = %message,
                    "task retries exhausted, dead-lettering"
                );

                job.mark_failed(message.clone());
                self.store.dead_letter(job.clone(), message)?;
            }
        }

        Ok(job.status.clone())
    }

    /// Claim and execute the next invocation ready now, if any.
    pub async fn run_next(&self) -> Result<Option<Job>, JobExecutorError> {
        let Some(mut job) = self.store.claim_next(Utc::now())? else {
            return Ok(None);
        };
        self.execute_one(&mut job).await?;
        Ok(Some(job))
    }

    /// Process invocations, waiting out retry etas, until nothing is pending
    /// or running or `shutdown` is notified.
    pub async fn run_until_drained(
        &self,
        config: &JobExecutorConfig,
        shutdown: &Notify,
    ) -> Result<ExecutorStats, JobExecutorError> {
        let started = Instant::now();
        let mut stats = ExecutorStats::default();

        loop {
            if let Some(job) = self.run_next().await? {
                stats.record(&job);
                continue;
            }

            if !self.store.has_unfinished()? {
                break;
            }

            let wait = self
                .store
                .next_scheduled_at()?
                .and_then(|eta| (eta - Utc::now()).to_std().ok())
                .unwrap_or_default()
                .max(config.poll_interval);

            debug!(executor = %config.name, wait_ms = wait.as_millis() as u64, "waiting for scheduled retries");

            tokio::select! {
                _ = shutdown.notified() => {
                    info!(executor = %config.name, "drain interrupted by shutdown");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        stats.uptime_secs = started.elapsed().as_secs();
        info!(
            executor = %config.name,
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            skipped = stats.jobs_skipped,
            retried = stats.jobs_retried,
            failed = stats.jobs_failed,
            "job queue drained"
        );
        Ok(stats)
    }

    /// Spawn the executor as a background tokio task.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle
    where
        S: Send,
        H: Send,
    {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let join = tokio::spawn(executor_loop(self, config, shutdown.clone(), stats.clone()));

        JobExecutorHandle {
            shutdown,
            join,
            stats,
        }
    }
}

async fn executor_loop<S, H>(
    executor: JobExecutor<S, H>,
    config: JobExecutorConfig,
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<ExecutorStats>>,
) where
    S: JobStore + 'static,
    H: TaskHandler + 'static,
{
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        let claimed = executor.store.claim_next(Utc::now());
        match claimed {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    job_id = %job.id,
                    task = job.kind.name(),
                    "claimed job"
                );

                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .current_running += 1;

                let result = executor.execute_one(&mut job).await;

                {
                    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                    s.current_running = s.current_running.saturating_sub(1);
                    s.record(&job);
                }

                if let Err(e) = result {
                    error!(
                        executor = %config.name,
                        job_id = %job.id,
                        error = %e,
                        "failed to persist job outcome"
                    );
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
            }
        }

        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
