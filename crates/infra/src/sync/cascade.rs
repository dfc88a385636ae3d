//! Follow-up general syncs derived from detected progress changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use casesync_core::{JobId, SyncType};

use crate::cases::{CaseRecord, CaseRepository, CaseStoreError};
use crate::config::SyncSettings;
use crate::jobs::{
    CaseSyncPayload, DedupKey, EnqueueOutcome, JobPayload, JobStore, JobStoreError, NewSyncJob,
};

/// Priority of cascaded general syncs; above scheduled progress syncs.
pub const CASCADE_PRIORITY: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOutcome {
    /// The last general sync is recent enough.
    NotDue,
    Enqueued(JobId),
    /// A live general job for this case and hour already exists.
    AlreadyQueued(JobId),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CascadeError {
    #[error("failed to enqueue general sync: {0}")]
    Enqueue(#[from] JobStoreError),
    #[error("failed to update next general sync: {0}")]
    Case(#[from] CaseStoreError),
    #[error("next general sync is past the representable date range")]
    OutOfRange,
}

#[derive(Clone)]
pub struct CascadeScheduler {
    jobs: Arc<dyn JobStore>,
    cases: Arc<dyn CaseRepository>,
}

impl CascadeScheduler {
    pub fn new(jobs: Arc<dyn JobStore>, cases: Arc<dyn CaseRepository>) -> Self {
        Self { jobs, cases }
    }

    /// Queue a general sync for `case` unless one ran within `generalBackoffHours`.
    pub async fn schedule_general(
        &self,
        case: &CaseRecord,
        settings: &SyncSettings,
        now: DateTime<Utc>,
    ) -> Result<CascadeOutcome, CascadeError> {
        let backoff = settings.general_backoff();
        if !case.general_sync_due(now, backoff) {
            return Ok(CascadeOutcome::NotDue);
        }
        let next_general = now.checked_add_signed(backoff).ok_or(CascadeError::OutOfRange)?;

        let job = NewSyncJob {
            tenant_id: case.tenant_id,
            case_id: Some(case.id),
            payload: JobPayload::General(CaseSyncPayload::auto()),
            priority: CASCADE_PRIORITY,
            scheduled_at: now,
            dedup_key: DedupKey::hourly(SyncType::General, case.id, now),
        };
        let outcome = self.jobs.enqueue(job).await?;
        self.cases.set_next_general_sync_at(case.id, next_general).await?;

        Ok(match outcome {
            EnqueueOutcome::Inserted(id) => {
                tracing::info!(case_id = %case.id, job_id = %id, "cascaded general sync");
                CascadeOutcome::Enqueued(id)
            }
            EnqueueOutcome::Duplicate(id) => CascadeOutcome::AlreadyQueued(id),
        })
    }
}

impl core::fmt::Debug for CascadeScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CascadeScheduler").finish_non_exhaustive()
    }
}
