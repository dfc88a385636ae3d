//! Per-job failure taxonomy.

use chrono::{DateTime, Utc};

use casesync_core::CaseId;

use crate::external::{ExternalCallError, RenewalError};
use crate::jobs::JobStatus;

/// Why a single job did not succeed. Never aborts sibling jobs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    #[error("missing case reference")]
    MissingCaseReference,
    #[error("missing token id")]
    MissingTokenReference,
    #[error("case not found: {0}")]
    CaseNotFound(CaseId),
    #[error("case lookup failed: {0}")]
    CaseLoad(String),
    #[error("sync disabled for case")]
    SyncDisabledForCase,
    #[error("cooldown active until {0}")]
    CooldownActive(DateTime<Utc>),
    #[error("missing link")]
    LinkMissingNoFallback,
    #[error(transparent)]
    ExternalCall(#[from] ExternalCallError),
    #[error(transparent)]
    Renewal(#[from] RenewalError),
}

impl JobFailure {
    /// Retryable failures are requeued with backoff until attempts run out.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobFailure::ExternalCall(_) | JobFailure::Renewal(_))
    }

    /// Status recorded when the failure is not (or no longer) retried.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            JobFailure::SyncDisabledForCase | JobFailure::CooldownActive(_) => JobStatus::Skipped,
            _ => JobStatus::Failed,
        }
    }
}
