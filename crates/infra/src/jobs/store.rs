//! Job storage: the contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use backtestq_core::{Job, JobId, JobStatus, Lease, LeaseToken, NewJob};

use super::types::{AnalysisUpdate, Completion, Failure, JobStats, RetryUpdate};

/// Durable table of job records and the sole arbiter of ownership.
///
/// Every mutation of an `in_progress` row takes the [`Lease`] handed out by
/// [`claim_next_pending`](JobStore::claim_next_pending). Writes against a row
/// that is absorbing, or that is no longer held under that lease, fail with a
/// conflict (see [`JobStoreError::is_conflict`]) and leave the row unchanged.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` row (the submitter's only write).
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically move the oldest `pending` row to `in_progress` under a fresh
    /// lease. Concurrent callers never receive the same row; `None` means the
    /// queue is empty.
    async fn claim_next_pending(&self) -> Result<Option<Job>, JobStoreError>;

    /// Heartbeat: refresh `updated_at` of an owned row.
    async fn touch(&self, lease: &Lease) -> Result<(), JobStoreError>;

    /// Record another attempt: new input, `retry_count + 1`, cleared error.
    async fn persist_retry(&self, lease: &Lease, update: RetryUpdate) -> Result<(), JobStoreError>;

    async fn persist_completed(&self, lease: &Lease, completion: Completion) -> Result<(), JobStoreError>;

    async fn persist_failed(&self, lease: &Lease, failure: Failure) -> Result<(), JobStoreError>;

    /// Return `in_progress` rows not touched since `cutoff` to `pending`.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError>;

    /// Write the secondary analysis block of a `completed` row.
    async fn persist_analysis(&self, job_id: JobId, update: AnalysisUpdate) -> Result<(), JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Mutation attempted on an absorbing row.
    #[error("job {job_id} is already {status}")]
    AlreadyFinalized { job_id: JobId, status: JobStatus },
    /// The row is no longer `in_progress` under the caller's lease.
    #[error("job {0} is not owned by this lease")]
    LeaseLost(JobId),
    /// Claim lost a lock race; poll again.
    #[error("claim conflict: {0}")]
    ClaimConflict(String),
    #[error("invariant violated for job {job_id}: {reason}")]
    Invariant { job_id: JobId, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Persistence conflicts signal that two orchestrators touched one job.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            JobStoreError::AlreadyFinalized { .. } | JobStoreError::LeaseLost(_)
        )
    }
}

/// Classify a rejected guarded write against the row as currently stored.
pub(crate) fn ownership_error(job_id: JobId, status: JobStatus, lease: Option<LeaseToken>, expected: LeaseToken) -> Option<JobStoreError> {
    if status.is_absorbing() {
        return Some(JobStoreError::AlreadyFinalized { job_id, status });
    }
    if status != JobStatus::InProgress || lease != Some(expected) {
        return Some(JobStoreError::LeaseLost(job_id));
    }
    None
}

/// In-memory job store for tests/dev.
///
/// A single write lock makes every operation atomic, which gives claim the same
/// exclusivity the Postgres `SKIP LOCKED` query provides.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".into()))
    }

    /// Run `f` against a row the lease still owns.
    fn with_owned<F>(&self, lease: &Lease, f: F) -> Result<(), JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobStoreError>,
    {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&lease.job_id).ok_or(JobStoreError::NotFound(lease.job_id))?;
        if let Some(err) = ownership_error(job.id, job.status, job.lease, lease.token) {
            return Err(err);
        }
        f(job)
    }

    /// Overwrite `updated_at`, for staleness tests.
    pub fn backdate(&self, job_id: JobId, updated_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.updated_at = updated_at;
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, Job::pending(job, Utc::now()));
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn claim_next_pending(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();

        // Oldest pending row first.
        let next = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.status = JobStatus::InProgress;
        job.lease = Some(LeaseToken::new());
        job.started_at = job.started_at.or(Some(now));
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn touch(&self, lease: &Lease) -> Result<(), JobStoreError> {
        self.with_owned(lease, |job| {
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn persist_retry(&self, lease: &Lease, update: RetryUpdate) -> Result<(), JobStoreError> {
        self.with_owned(lease, |job| {
            if update.retry_count != job.retry_count + 1 || update.retry_count > job.max_retries {
                return Err(JobStoreError::Invariant {
                    job_id: job.id,
                    reason: format!(
                        "retry_count {} -> {} (max {})",
                        job.retry_count, update.retry_count, job.max_retries
                    ),
                });
            }
            job.input = update.input;
            job.retry_count = update.retry_count;
            job.error_message = None;
            job.history.push(update.record);
            job.updated_at = Utc::now();
            if update.requeue {
                job.status = JobStatus::Pending;
                job.lease = None;
            }
            Ok(())
        })
    }

    async fn persist_completed(&self, lease: &Lease, completion: Completion) -> Result<(), JobStoreError> {
        self.with_owned(lease, |job| {
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.output = Some(completion.output);
            job.artifacts = completion.artifacts;
            job.error_message = None;
            job.lease = None;
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })
    }

    async fn persist_failed(&self, lease: &Lease, failure: Failure) -> Result<(), JobStoreError> {
        self.with_owned(lease, |job| {
            if failure.retry_count < job.retry_count || failure.retry_count > job.max_retries {
                return Err(JobStoreError::Invariant {
                    job_id: job.id,
                    reason: format!(
                        "retry_count {} -> {} (max {})",
                        job.retry_count, failure.retry_count, job.max_retries
                    ),
                });
            }
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.error_message = Some(failure.error_message);
            job.retry_count = failure.retry_count;
            job.history.push(failure.record);
            job.lease = None;
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();
        let mut requeued = Vec::new();
        for job in jobs.values_mut() {
            if job.status == JobStatus::InProgress && job.updated_at < cutoff {
                job.status = JobStatus::Pending;
                job.lease = None;
                job.updated_at = now;
                requeued.push(job.id);
            }
        }
        requeued.sort();
        Ok(requeued)
    }

    async fn persist_analysis(&self, job_id: JobId, update: AnalysisUpdate) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Completed {
            return Err(JobStoreError::Invariant {
                job_id,
                reason: format!("analysis written while job is {}", job.status),
            });
        }
        update.apply_to(&mut job.analysis, Utc::now());
        Ok(())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::InProgress => stats.in_progress += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
