//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use casesync_core::{JobId, SyncType, WorkerRunId};

use super::types::{JobStatus, JobTransition, NewSyncJob, SyncJob};

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted(JobId),
    /// A non-terminal job with the same dedup key already exists.
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, EnqueueOutcome::Inserted(_))
    }

    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Inserted(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }
}

/// Result of a batch enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

impl EnqueueSummary {
    pub fn add(&mut self, outcome: EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Inserted(_) => self.inserted += 1,
            EnqueueOutcome::Duplicate(_) => self.duplicates += 1,
        }
    }
}

/// Durable sync queue.
///
/// `claim` is the only way a job moves to `claimed`; concurrent callers never
/// receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job unless its dedup key is already live.
    async fn enqueue(&self, job: NewSyncJob) -> Result<EnqueueOutcome, JobStoreError>;

    /// Enqueue several jobs; duplicates are dropped silently.
    async fn enqueue_many(&self, jobs: Vec<NewSyncJob>) -> Result<EnqueueSummary, JobStoreError> {
        let mut summary = EnqueueSummary::default();
        for job in jobs {
            summary.add(self.enqueue(job).await?);
        }
        Ok(summary)
    }

    /// Atomically claim up to `limit` claimable jobs (priority desc, scheduled_at asc).
    async fn claim(
        &self,
        limit: usize,
        worker_id: WorkerRunId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, JobStoreError>;

    /// Record the result of running a claimed job.
    async fn transition(
        &self,
        job_id: JobId,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<SyncJob>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Most recently created jobs, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<SyncJob>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid job row {id}: {reason}")]
    InvalidRow { id: JobId, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts by status and sync type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub queued: usize,
    /// Queued but held back by an active backoff.
    pub backing_off: usize,
    pub claimed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub queued_by_type: HashMap<SyncType, usize>,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

impl JobStats {
    pub fn observe_queued_at(&mut self, scheduled_at: DateTime<Utc>) {
        if self.oldest_queued_at.is_none_or(|oldest| scheduled_at < oldest) {
            self.oldest_queued_at = Some(scheduled_at);
        }
    }

    /// Add `count` jobs sharing a status and sync type.
    pub fn record(&mut self, status: JobStatus, sync_type: SyncType, backing_off: bool, count: usize) {
        match status {
            JobStatus::Queued => {
                self.queued += count;
                *self.queued_by_type.entry(sync_type).or_default() += count;
                if backing_off {
                    self.backing_off += count;
                }
            }
            JobStatus::Claimed => self.claimed += count,
            JobStatus::Success => self.success += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Skipped => self.skipped += count,
        }
    }
}

/// In-memory job store for tests/dev.
///
/// A single lock guards the table, so `claim` is atomic with respect to every
/// other operation.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, SyncJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully-formed row, bypassing dedup. For seeding fixtures.
    pub fn put(&self, job: SyncJob) -> Result<(), JobStoreError> {
        self.lock()?.insert(job.id, job);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, SyncJob>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewSyncJob) -> Result<EnqueueOutcome, JobStoreError> {
        let mut jobs = self.lock()?;
        let live_duplicate = jobs
            .values()
            .find(|j| !j.status.is_terminal() && j.dedup_key == job.dedup_key);
        if let Some(existing) = live_duplicate {
            return Ok(EnqueueOutcome::Duplicate(existing.id));
        }

        let row = SyncJob::from_new(job, Utc::now());
        let id = row.id;
        jobs.insert(id, row);
        Ok(EnqueueOutcome::Inserted(id))
    }

    async fn claim(
        &self,
        limit: usize,
        worker_id: WorkerRunId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, JobStoreError> {
        let mut jobs = self.lock()?;

        let mut candidates: Vec<(i32, DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| (j.priority, j.scheduled_at, j.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_claimed(worker_id, now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        job_id: JobId,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.apply(&transition, now);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<SyncJob>, JobStoreError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.lock()?;
        let now = Utc::now();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            let backing_off = job.backoff_until.is_some_and(|until| until > now);
            stats.record(job.status, job.sync_type(), backing_off, 1);
            if job.status == JobStatus::Queued {
                stats.observe_queued_at(job.scheduled_at);
            }
        }
        Ok(stats)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncJob>, JobStoreError> {
        let jobs = self.lock()?;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn enqueue(&self, job: NewSyncJob) -> Result<EnqueueOutcome, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn enqueue_many(&self, jobs: Vec<NewSyncJob>) -> Result<EnqueueSummary, JobStoreError> {
        (**self).enqueue_many(jobs).await
    }

    async fn claim(
        &self,
        limit: usize,
        worker_id: WorkerRunId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, JobStoreError> {
        (**self).claim(limit, worker_id, now).await
    }

    async fn transition(
        &self,
        job_id: JobId,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).transition(job_id, transition, now).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<SyncJob>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncJob>, JobStoreError> {
        (**self).recent(limit).await
    }
}
