//! Sync job model: status, typed payloads, dedup keys, and transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use casesync_core::{CaseId, DomainError, JobId, SyncType, TenantId, TokenId, TriggerSource, WorkerRunId};

/// Attempts after which a failing job is marked `failed` for good.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Persisted job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly behind a backoff).
    Queued,
    /// Picked up by a dispatcher run.
    Claimed,
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Claimed,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Skipped,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("job status", s))
    }
}

/// Payload of a progress/general/full job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseSyncPayload {
    pub trigger_source: TriggerSource,
    /// Party name forwarded to the court lookup (disambiguates same-number cases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_name: Option<String>,
    /// Permit upgrading to a full sync when the case has no court link.
    #[serde(default)]
    pub allow_full_fallback: bool,
}

impl CaseSyncPayload {
    pub fn new(trigger_source: TriggerSource) -> Self {
        Self {
            trigger_source,
            party_name: None,
            allow_full_fallback: false,
        }
    }

    pub fn auto() -> Self {
        Self::new(TriggerSource::Auto)
    }

    pub fn manual() -> Self {
        Self::new(TriggerSource::Manual)
    }

    pub fn with_party_name(mut self, party_name: impl Into<String>) -> Self {
        self.party_name = Some(party_name.into());
        self
    }

    pub fn with_full_fallback(mut self) -> Self {
        self.allow_full_fallback = true;
        self
    }
}

/// Payload of a session-token renewal job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRenewalPayload {
    pub trigger_source: TriggerSource,
    #[serde(default, alias = "wmonidId", skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
}

impl TokenRenewalPayload {
    pub fn for_token(token_id: TokenId) -> Self {
        Self {
            trigger_source: TriggerSource::Auto,
            token_id: Some(token_id),
        }
    }
}

/// Job payload, one variant per sync type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "syncType", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    Progress(CaseSyncPayload),
    General(CaseSyncPayload),
    Full(CaseSyncPayload),
    TokenRenewal(TokenRenewalPayload),
}

impl JobPayload {
    /// Build a case-sync payload for `sync_type`; renewal payloads are rejected.
    pub fn case_sync(sync_type: SyncType, payload: CaseSyncPayload) -> Result<Self, DomainError> {
        match sync_type {
            SyncType::Progress => Ok(JobPayload::Progress(payload)),
            SyncType::General => Ok(JobPayload::General(payload)),
            SyncType::Full => Ok(JobPayload::Full(payload)),
            SyncType::TokenRenewal => Err(DomainError::validation(
                "token renewal jobs take a token renewal payload",
            )),
        }
    }

    pub fn sync_type(&self) -> SyncType {
        match self {
            JobPayload::Progress(_) => SyncType::Progress,
            JobPayload::General(_) => SyncType::General,
            JobPayload::Full(_) => SyncType::Full,
            JobPayload::TokenRenewal(_) => SyncType::TokenRenewal,
        }
    }

    pub fn trigger_source(&self) -> TriggerSource {
        match self {
            JobPayload::Progress(p) | JobPayload::General(p) | JobPayload::Full(p) => {
                p.trigger_source
            }
            JobPayload::TokenRenewal(p) => p.trigger_source,
        }
    }

    pub fn as_case_sync(&self) -> Option<&CaseSyncPayload> {
        match self {
            JobPayload::Progress(p) | JobPayload::General(p) | JobPayload::Full(p) => Some(p),
            JobPayload::TokenRenewal(_) => None,
        }
    }

    /// The variant body as stored in the `payload` column.
    pub fn to_stored_json(&self) -> serde_json::Value {
        let body = match self {
            JobPayload::Progress(p) | JobPayload::General(p) | JobPayload::Full(p) => {
                serde_json::to_value(p)
            }
            JobPayload::TokenRenewal(p) => serde_json::to_value(p),
        };
        body.unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild a payload from its stored column values.
    ///
    /// Rows written before trigger sources were recorded get one inferred from
    /// the priority.
    pub fn from_stored(
        sync_type: SyncType,
        stored: serde_json::Value,
        priority: i32,
    ) -> Result<Self, DomainError> {
        let mut body = match stored {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(DomainError::validation(format!(
                    "job payload must be an object, got {other}"
                )));
            }
        };
        if !body.contains_key("triggerSource") {
            body.insert(
                "triggerSource".to_string(),
                serde_json::Value::String(TriggerSource::from_priority(priority).as_str().into()),
            );
        }
        let body = serde_json::Value::Object(body);
        let invalid = |e: serde_json::Error| DomainError::validation(format!("job payload: {e}"));

        match sync_type {
            SyncType::TokenRenewal => Ok(JobPayload::TokenRenewal(
                serde_json::from_value(body).map_err(invalid)?,
            )),
            case_type => JobPayload::case_sync(case_type, serde_json::from_value(body).map_err(invalid)?),
        }
    }
}

/// Idempotency key: at most one non-terminal job may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// `<sync_type>:<subject>:<YYYYMMDDHH>`: one key per subject per UTC hour.
    pub fn hourly(sync_type: SyncType, subject: impl core::fmt::Display, at: DateTime<Utc>) -> Self {
        Self(format!("{}:{}:{}", sync_type.as_str(), subject, at.format("%Y%m%d%H")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncJob {
    pub tenant_id: Option<TenantId>,
    pub case_id: Option<CaseId>,
    pub payload: JobPayload,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub dedup_key: DedupKey,
}

impl NewSyncJob {
    /// A case sync job due at `now`, keyed on the case and the current hour.
    pub fn case_sync(
        case_id: CaseId,
        sync_type: SyncType,
        payload: CaseSyncPayload,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let priority = payload.trigger_source.default_priority();
        Ok(Self {
            tenant_id: None,
            case_id: Some(case_id),
            payload: JobPayload::case_sync(sync_type, payload)?,
            priority,
            scheduled_at: now,
            dedup_key: DedupKey::hourly(sync_type, case_id, now),
        })
    }

    /// A renewal job for `token_id` due at `now`.
    pub fn token_renewal(token_id: TokenId, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: None,
            case_id: None,
            payload: JobPayload::TokenRenewal(TokenRenewalPayload::for_token(token_id)),
            priority: 5,
            scheduled_at: now,
            dedup_key: DedupKey::hourly(SyncType::TokenRenewal, token_id, now),
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    pub fn with_dedup_key(mut self, key: DedupKey) -> Self {
        self.dedup_key = key;
        self
    }

    pub fn sync_type(&self) -> SyncType {
        self.payload.sync_type()
    }
}

/// A persisted sync job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncJob {
    pub id: JobId,
    pub tenant_id: Option<TenantId>,
    /// Absent only for global jobs such as token renewal.
    pub case_id: Option<CaseId>,
    #[serde(flatten)]
    pub payload: JobPayload,
    /// Higher runs first.
    pub priority: i32,
    /// Incremented on every claim.
    pub attempts: u32,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    /// Not claimable before this instant.
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub worker_id: Option<WorkerRunId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dedup_key: DedupKey,
    pub created_at: DateTime<Utc>,
}

impl SyncJob {
    /// Materialise a queued row from an enqueue request.
    pub fn from_new(new: NewSyncJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            case_id: new.case_id,
            payload: new.payload,
            priority: new.priority,
            attempts: 0,
            status: JobStatus::Queued,
            scheduled_at: new.scheduled_at,
            backoff_until: None,
            last_error: None,
            worker_id: None,
            claimed_at: None,
            finished_at: None,
            dedup_key: new.dedup_key,
            created_at: now,
        }
    }

    pub fn sync_type(&self) -> SyncType {
        self.payload.sync_type()
    }

    pub fn trigger_source(&self) -> TriggerSource {
        self.payload.trigger_source()
    }

    /// Whether a claim at `now` may pick this job up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && self.scheduled_at <= now
            && self.backoff_until.is_none_or(|until| until <= now)
    }

    pub fn mark_claimed(&mut self, worker_id: WorkerRunId, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.attempts += 1;
        self.worker_id = Some(worker_id);
        self.claimed_at = Some(now);
    }

    pub fn apply(&mut self, transition: &JobTransition, now: DateTime<Utc>) {
        self.status = transition.status();
        match transition {
            JobTransition::Succeeded => {
                self.backoff_until = None;
                self.last_error = None;
                self.finished_at = Some(now);
            }
            JobTransition::Retry {
                backoff_until,
                error,
            } => {
                self.backoff_until = Some(*backoff_until);
                self.scheduled_at = *backoff_until;
                self.last_error = Some(error.clone());
            }
            JobTransition::Failed { error } => {
                self.last_error = Some(error.clone());
                self.finished_at = Some(now);
            }
            JobTransition::Skipped { reason } => {
                self.last_error = Some(reason.clone());
                self.finished_at = Some(now);
            }
        }
    }
}

/// Status change recorded after a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTransition {
    /// Terminal success; clears backoff and error.
    Succeeded,
    /// Back to `queued`, not claimable before `backoff_until`.
    Retry {
        backoff_until: DateTime<Utc>,
        error: String,
    },
    Failed { error: String },
    Skipped { reason: String },
}

impl JobTransition {
    pub fn status(&self) -> JobStatus {
        match self {
            JobTransition::Succeeded => JobStatus::Success,
            JobTransition::Retry { .. } => JobStatus::Queued,
            JobTransition::Failed { .. } => JobStatus::Failed,
            JobTransition::Skipped { .. } => JobStatus::Skipped,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobTransition::Succeeded => None,
            JobTransition::Retry { error, .. } | JobTransition::Failed { error } => Some(error),
            JobTransition::Skipped { reason } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn dedup_key_buckets_by_hour() {
        let case_id = CaseId::new();
        let a = DedupKey::hourly(SyncType::General, case_id, at(9, 1));
        let b = DedupKey::hourly(SyncType::General, case_id, at(9, 59));
        let c = DedupKey::hourly(SyncType::General, case_id, at(10, 0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), format!("general:{case_id}:2025031409"));
    }

    #[test]
    fn stored_payload_without_trigger_source_uses_priority() {
        let payload = JobPayload::from_stored(
            SyncType::Progress,
            serde_json::json!({ "partyName": "Kim" }),
            10,
        )
        .unwrap();
        let case = payload.as_case_sync().unwrap();
        assert_eq!(case.trigger_source, TriggerSource::Manual);
        assert_eq!(case.party_name.as_deref(), Some("Kim"));
        assert!(!case.allow_full_fallback);

        let payload = JobPayload::from_stored(SyncType::General, serde_json::Value::Null, 1).unwrap();
        assert_eq!(payload.trigger_source(), TriggerSource::Auto);
        assert_eq!(payload.sync_type(), SyncType::General);
    }

    #[test]
    fn stored_renewal_payload_accepts_legacy_key() {
        let token_id = TokenId::new();
        let payload = JobPayload::from_stored(
            SyncType::TokenRenewal,
            serde_json::json!({ "wmonidId": token_id.to_string(), "userId": "ignored" }),
            5,
        )
        .unwrap();
        assert_eq!(
            payload,
            JobPayload::TokenRenewal(TokenRenewalPayload {
                trigger_source: TriggerSource::Auto,
                token_id: Some(token_id),
            })
        );
    }

    #[test]
    fn stored_json_round_trips_through_from_stored() {
        let payload = JobPayload::Full(CaseSyncPayload::manual().with_full_fallback());
        let stored = payload.to_stored_json();
        assert_eq!(stored["triggerSource"], "manual");
        let back = JobPayload::from_stored(SyncType::Full, stored, 0).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn claimability_respects_schedule_and_backoff() {
        let now = at(12, 0);
        let mut job = SyncJob::from_new(
            NewSyncJob::case_sync(CaseId::new(), SyncType::Progress, CaseSyncPayload::auto(), now)
                .unwrap(),
            now,
        );
        assert!(job.is_claimable(now));

        job.backoff_until = Some(now + Duration::minutes(5));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + Duration::minutes(5)));

        job.backoff_until = None;
        job.scheduled_at = now + Duration::seconds(1);
        assert!(!job.is_claimable(now));

        job.scheduled_at = now;
        job.mark_claimed(WorkerRunId::random(), now);
        assert!(!job.is_claimable(now));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn retry_transition_requeues_behind_backoff() {
        let now = at(12, 0);
        let mut job = SyncJob::from_new(NewSyncJob::token_renewal(TokenId::new(), now), now);
        job.mark_claimed(WorkerRunId::random(), now);

        let until = now + Duration::minutes(5);
        job.apply(
            &JobTransition::Retry {
                backoff_until: until,
                error: "court timeout".into(),
            },
            now,
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.backoff_until, Some(until));
        assert_eq!(job.scheduled_at, until);
        assert_eq!(job.finished_at, None);

        job.apply(&JobTransition::Succeeded, until);
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.backoff_until, None);
        assert_eq!(job.last_error, None);
        assert_eq!(job.finished_at, Some(until));
    }

    #[test]
    fn renewal_payload_cannot_be_built_as_case_sync() {
        assert!(JobPayload::case_sync(SyncType::TokenRenewal, CaseSyncPayload::auto()).is_err());
    }
}
