//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Enqueue a new invocation.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest pending invocation whose eta is at or before `now`,
    /// marking it running. Returns None if nothing is ready.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// List invocations, optionally filtered by status variant.
    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// List invocations of the task with this name.
    fn list_by_task(&self, task: &str, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Record a failed invocation and file it in the dead-letter queue.
    /// The invocation stays readable through `get` with its final status.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Enqueue a fresh invocation of a dead-lettered task with a full retry budget.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// True while some invocation is pending or running.
    fn has_unfinished(&self) -> Result<bool, JobStoreError> {
        let stats = self.stats()?;
        Ok(stats.pending + stats.running > 0)
    }

    /// Earliest eta among pending invocations.
    fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        // Oldest ready invocation first; ids are v7 so they break ties in creation order.
        let next = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending) && j.is_ready_at(now))
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                status.as_ref().is_none_or(|s| {
                    std::mem::discriminant(&j.status) == std::mem::discriminant(s)
                })
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id.0));
        result.truncate(limit);
        Ok(result)
    }

    fn list_by_task(&self, task: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.kind.name() == task)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id.0));
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        jobs.insert(job.id, job.clone());
        dls.insert(job.id, DeadLetterEntry::new(job, reason));

        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dls.values().cloned().collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        let entry = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = Job::new(entry.job.kind);
        job.retry_of = Some(job_id);

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut dls = self.dead_letters.write().map_err(poisoned)?;
        dls.remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let dls = self.dead_letters.read().map_err(poisoned)?;

        let mut stats = JobStats::default();

        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::RetryScheduled { .. } => stats.retry_scheduled += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
            }
        }
        stats.dead_lettered = dls.len();

        Ok(stats)
    }

    fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending))
            .map(|j| j.scheduled_at.unwrap_or(j.created_at))
            .min())
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now)
    }

    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn list_by_task(&self, task: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_task(task, limit)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(job_id)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete_dead_letter(job_id)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }

    fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        (**self).next_scheduled_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::TaskKind;

    fn job(username: &str) -> Job {
        Job::new(TaskKind::award_program_certificates(username))
    }

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();

        let job_id = store.enqueue(job("ada")).unwrap();

        let claimed = store.claim_next(Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));

        // No more jobs
        assert!(store.claim_next(Utc::now()).unwrap().is_none());
    }

    #[test]
    fn scheduled_jobs_wait_for_their_eta() {
        let store = InMemoryJobStore::new();
        let eta = Utc::now() + chrono::Duration::seconds(30);
        store.enqueue(job("ada").scheduled_at(eta)).unwrap();

        assert!(store.claim_next(Utc::now()).unwrap().is_none());
        assert_eq!(store.next_scheduled_at().unwrap(), Some(eta));
        assert!(store.claim_next(eta).unwrap().is_some());
    }

    #[test]
    fn claims_in_fifo_order() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job("ada")).unwrap();
        let second = store.enqueue(job("grace")).unwrap();

        assert_eq!(store.claim_next(Utc::now()).unwrap().unwrap().id, first);
        assert_eq!(store.claim_next(Utc::now()).unwrap().unwrap().id, second);
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let store = InMemoryJobStore::new();
        let j = job("ada");
        store.enqueue(j.clone()).unwrap();

        assert!(matches!(
            store.enqueue(j),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn dead_letter_flow() {
        let store = InMemoryJobStore::new();

        let j = job("ada");
        let job_id = j.id;
        store.enqueue(j).unwrap();

        let mut claimed = store.claim_next(Utc::now()).unwrap().unwrap();
        claimed.retries = 11;
        claimed.mark_failed("boom".to_string());

        store.dead_letter(claimed, "boom".to_string()).unwrap();

        let stored = store.get(job_id).unwrap().unwrap();
        assert!(matches!(stored.status, JobStatus::Failed { .. }));
        let stats = store.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_lettered, 1);

        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job.id, job_id);

        let retried = store.retry_dead_letter(job_id).unwrap();
        assert!(matches!(retried.status, JobStatus::Pending));
        assert_eq!(retried.retries, 0);
        assert_eq!(retried.retry_of, Some(job_id));

        assert!(store.list_dead_letters(10).unwrap().is_empty());
        assert!(matches!(
            store.delete_dead_letter(job_id),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn list_by_task_filters_on_name() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("ada")).unwrap();
        let key = credsync_core::CourseRunKey::parse("course-v1:edX+DemoX+1T").unwrap();
        store
            .enqueue(Job::new(TaskKind::revoke_program_certificates("ada", key)))
            .unwrap();

        assert_eq!(store.list_by_task("award_program_certificates", 10).unwrap().len(), 1);
        assert_eq!(store.list_by_task("revoke_program_certificates", 10).unwrap().len(), 1);
        assert!(store.list_by_task("send_grade_to_credentials", 10).unwrap().is_empty());
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();

        for i in 0..5 {
            store.enqueue(job(&format!("user{i}"))).unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 5);
        assert!(store.has_unfinished().unwrap());

        store.claim_next(Utc::now()).unwrap();
        store.claim_next(Utc::now()).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);

        let pending = store.list_by_status(Some(JobStatus::Pending), 10).unwrap();
        assert_eq!(pending.len(), 3);
    }
}
