//! Local legal-case records, as far as the sync engine reads and stamps them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use casesync_core::{CaseId, TenantId};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryCaseRepository;
pub use postgres::PostgresCaseRepository;

/// Sync-relevant view of a legal case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseRecord {
    pub id: CaseId,
    pub tenant_id: Option<TenantId>,
    pub case_number: Option<String>,
    pub court_name: Option<String>,
    pub status: Option<String>,
    /// A final judgment (or its date) has been recorded.
    pub has_final_result: bool,
    pub sync_enabled: bool,
    /// Auto progress syncs are skipped until this instant.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Court-side encrypted case number.
    pub enc_token: Option<String>,
    /// Court session token (WMONID) the case was linked under.
    pub session_token: Option<String>,
    pub last_general_sync_at: Option<DateTime<Utc>>,
    pub next_general_sync_at: Option<DateTime<Utc>>,
    pub next_progress_sync_at: Option<DateTime<Utc>>,
}

impl CaseRecord {
    /// A sync-enabled, unlinked case with no schedule.
    pub fn new(id: CaseId, case_number: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id: None,
            case_number: Some(case_number.into()),
            court_name: None,
            status: None,
            has_final_result: false,
            sync_enabled: true,
            cooldown_until: None,
            enc_token: None,
            session_token: None,
            last_general_sync_at: None,
            next_general_sync_at: None,
            next_progress_sync_at: None,
        }
    }

    pub fn linked(mut self, enc_token: impl Into<String>, session_token: impl Into<String>) -> Self {
        self.enc_token = Some(enc_token.into());
        self.session_token = Some(session_token.into());
        self
    }

    /// Both court-link tokens are present and non-empty.
    pub fn is_linked(&self) -> bool {
        let present = |t: &Option<String>| t.as_deref().is_some_and(|t| !t.is_empty());
        present(&self.enc_token) && present(&self.session_token)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// No general sync yet, or the last one is older than `backoff`.
    pub fn general_sync_due(&self, now: DateTime<Utc>, backoff: chrono::Duration) -> bool {
        self.last_general_sync_at.is_none_or(|last| now - last >= backoff)
    }
}

/// Fields written back after a successful external sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStamp {
    pub cooldown_until: Option<DateTime<Utc>>,
    pub general_synced_at: Option<DateTime<Utc>>,
}

impl SyncStamp {
    pub fn is_empty(&self) -> bool {
        self.cooldown_until.is_none() && self.general_synced_at.is_none()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CaseStoreError {
    #[error("case not found: {0}")]
    NotFound(CaseId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CaseRepository: Send + Sync {
    async fn find(&self, case_id: CaseId) -> Result<Option<CaseRecord>, CaseStoreError>;

    /// Sync-enabled cases with a case number whose next progress sync is
    /// unset or due, up to `limit`.
    async fn progress_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CaseRecord>, CaseStoreError>;

    async fn set_next_progress_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError>;

    async fn set_next_general_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError>;

    async fn record_sync_success(&self, case_id: CaseId, stamp: SyncStamp) -> Result<(), CaseStoreError>;
}
