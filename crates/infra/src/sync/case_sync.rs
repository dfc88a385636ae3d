//! Progress/general/full sync jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use casesync_core::{SyncType, TriggerSource};

use crate::cases::{CaseRecord, CaseRepository, SyncStamp};
use crate::config::SyncSettings;
use crate::external::{CourtSyncClient, CourtSyncRequest};
use crate::jobs::{CaseSyncPayload, SyncJob};

use super::failure::JobFailure;
use super::rate_limit::RateLimiter;

/// Result of a successful case sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseSyncSuccess {
    /// The case as loaded before the call.
    pub case: CaseRecord,
    pub effective_sync_type: SyncType,
    pub trigger_source: TriggerSource,
    pub progress_changed: bool,
}

impl CaseSyncSuccess {
    /// An automatic progress sync that saw a change earns a follow-up general sync.
    pub fn wants_cascade(&self) -> bool {
        self.effective_sync_type == SyncType::Progress
            && self.progress_changed
            && !self.trigger_source.is_manual()
    }
}

/// Sync type actually sent to the court endpoint.
///
/// An unlinked case can only be synced in full, and only when the job allows it.
pub fn effective_sync_type(
    requested: SyncType,
    case: &CaseRecord,
    payload: &CaseSyncPayload,
) -> Result<SyncType, JobFailure> {
    if requested == SyncType::Full || case.is_linked() {
        return Ok(requested);
    }
    if payload.allow_full_fallback {
        return Ok(SyncType::Full);
    }
    Err(JobFailure::LinkMissingNoFallback)
}

#[derive(Clone)]
pub struct CaseSyncHandler {
    cases: Arc<dyn CaseRepository>,
    client: Arc<dyn CourtSyncClient>,
}

impl CaseSyncHandler {
    pub fn new(cases: Arc<dyn CaseRepository>, client: Arc<dyn CourtSyncClient>) -> Self {
        Self { cases, client }
    }

    pub async fn handle(
        &self,
        job: &SyncJob,
        payload: &CaseSyncPayload,
        settings: &SyncSettings,
        limiter: &RateLimiter,
    ) -> Result<CaseSyncSuccess, JobFailure> {
        let case_id = job.case_id.ok_or(JobFailure::MissingCaseReference)?;
        let case = match self.cases.find(case_id).await {
            Ok(Some(case)) => case,
            Ok(None) => return Err(JobFailure::CaseNotFound(case_id)),
            Err(e) => return Err(JobFailure::CaseLoad(e.to_string())),
        };

        if !case.sync_enabled {
            return Err(JobFailure::SyncDisabledForCase);
        }

        let trigger_source = payload.trigger_source;
        if job.sync_type() == SyncType::Progress && !trigger_source.is_manual() {
            if let Some(until) = case.cooldown_until.filter(|until| *until > Utc::now()) {
                return Err(JobFailure::CooldownActive(until));
            }
        }

        let effective = effective_sync_type(job.sync_type(), &case, payload)?;
        if effective != job.sync_type() {
            tracing::info!(case_id = %case_id, requested = %job.sync_type(), "case not linked, upgrading to full sync");
        }

        limiter.wait().await;
        tokio::time::sleep(settings.request_jitter_ms.sample()).await;

        let request = CourtSyncRequest {
            legal_case_id: case.id,
            case_number: case.case_number.clone(),
            court_name: case.court_name.clone(),
            force_refresh: trigger_source.is_manual(),
            sync_type: effective,
            trigger_source,
            party_name: payload.party_name.clone(),
        };
        let response = self.client.sync_case(&request).await?;

        self.stamp(&case, effective, trigger_source, settings, Utc::now()).await;

        Ok(CaseSyncSuccess {
            case,
            effective_sync_type: effective,
            trigger_source,
            progress_changed: response.progress_changed,
        })
    }

    /// Record cooldown and general-sync time. Not transactional with the load above.
    async fn stamp(
        &self,
        case: &CaseRecord,
        effective: SyncType,
        trigger_source: TriggerSource,
        settings: &SyncSettings,
        now: DateTime<Utc>,
    ) {
        let cooldown_minutes = if trigger_source.is_manual() {
            settings.manual_cooldown_minutes
        } else {
            settings.auto_cooldown_minutes
        };
        let stamp = SyncStamp {
            cooldown_until: (cooldown_minutes > 0)
                .then(|| now.checked_add_signed(chrono::Duration::minutes(i64::from(cooldown_minutes))))
                .flatten(),
            general_synced_at: matches!(effective, SyncType::General | SyncType::Full).then_some(now),
        };
        if stamp.is_empty() {
            return;
        }

        if let Err(err) = self.cases.record_sync_success(case.id, stamp).await {
            tracing::warn!(case_id = %case.id, error = %err, "failed to stamp case after sync");
        }
    }
}

impl core::fmt::Debug for CaseSyncHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CaseSyncHandler").finish_non_exhaustive()
    }
}
