//! Periodic scheduler: queues progress syncs for active cases and renewal jobs
//! for expiring session tokens.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use casesync_core::{CaseId, SyncType};

use crate::cases::{CaseRecord, CaseRepository, CaseStoreError};
use crate::config::{SettingsError, SettingsProvider, SyncSettings};
use crate::jobs::{CaseSyncPayload, DedupKey, JobPayload, JobStore, JobStoreError, NewSyncJob};
use crate::tokens::SessionTokenRepository;

use super::auth::CronSecret;
use super::log::{LogWriter, SyncLogEntry};

/// Priority of scheduled progress syncs.
pub const PROGRESS_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Progress jobs inserted this run.
    pub scheduled_jobs: usize,
    /// Cases given their first staggered progress time.
    pub initialized_cases: usize,
    pub token_jobs: usize,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("candidate query failed: {0}")]
    Cases(#[from] CaseStoreError),
    #[error("enqueue failed: {0}")]
    Enqueue(#[from] JobStoreError),
}

/// Stable per-case offset in `[0, range)` minutes, from the leading 32 bits of
/// `sha256(case_id)`.
pub fn stagger_offset_minutes(case_id: CaseId, range: i64) -> i64 {
    if range <= 0 {
        return 0;
    }
    let digest = Sha256::digest(case_id.to_string().as_bytes());
    let lead = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    i64::from(lead) % range
}

/// First progress time for a case that has none: the current hour, floored to
/// the interval, plus the case's stagger offset; pushed one interval forward
/// unless strictly after `now`. `None` past the representable date range.
pub fn initial_progress_at(case_id: CaseId, now: DateTime<Utc>, interval_minutes: i64) -> Option<DateTime<Utc>> {
    let interval = interval_minutes.clamp(1, crate::config::MAX_SCHEDULE_HOURS * 60);
    let hour_start = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let floored_minute = (i64::from(now.minute()) / interval) * interval;
    let base = hour_start.checked_add_signed(Duration::minutes(floored_minute))?;

    let candidate = base.checked_add_signed(Duration::minutes(stagger_offset_minutes(case_id, interval)))?;
    if candidate <= now {
        candidate.checked_add_signed(Duration::minutes(interval))
    } else {
        Some(candidate)
    }
}

/// Next progress time after a scheduled sync: one interval plus up to
/// `progressJitterMinutes` of jitter. `None` past the representable date range.
pub fn next_progress_at(now: DateTime<Utc>, settings: &SyncSettings) -> Option<DateTime<Utc>> {
    let jitter = match settings.progress_jitter_minutes {
        0 => 0,
        max => rand::rng().random_range(0..i64::from(max)),
    };
    now.checked_add_signed(settings.progress_interval())?
        .checked_add_signed(Duration::minutes(jitter))
}

/// Whether the active-case rule admits `case` at `now`.
pub fn is_active(case: &CaseRecord, settings: &SyncSettings, now: DateTime<Utc>) -> bool {
    let rule = &settings.active_case_rule;
    rule.admits_status(case.status.as_deref())
        && !(rule.exclude_final_result && case.has_final_result)
        && (!rule.require_linked || case.is_linked())
        && !case.in_cooldown(now)
}

#[derive(Clone)]
pub struct Scheduler {
    secret: CronSecret,
    settings: Arc<dyn SettingsProvider>,
    jobs: Arc<dyn JobStore>,
    cases: Arc<dyn CaseRepository>,
    tokens: Arc<dyn SessionTokenRepository>,
    log: LogWriter,
}

impl Scheduler {
    pub fn new(
        secret: CronSecret,
        settings: Arc<dyn SettingsProvider>,
        jobs: Arc<dyn JobStore>,
        cases: Arc<dyn CaseRepository>,
        tokens: Arc<dyn SessionTokenRepository>,
        log: LogWriter,
    ) -> Self {
        Self {
            secret,
            settings,
            jobs,
            cases,
            tokens,
            log,
        }
    }

    /// Verify the caller, then run one scheduling pass.
    pub async fn run(&self, presented_secret: Option<&str>) -> Result<SchedulerReport, SchedulerError> {
        if !self.secret.verify(presented_secret) {
            return Err(SchedulerError::Unauthorized);
        }
        self.run_authorized(Utc::now()).await
    }

    pub async fn run_authorized(&self, now: DateTime<Utc>) -> Result<SchedulerReport, SchedulerError> {
        let started = Instant::now();
        let settings = self.settings.load().await?;
        if !settings.auto_sync_enabled {
            return Ok(SchedulerReport {
                success: true,
                message: Some("auto sync disabled".to_string()),
                duration_ms: elapsed_ms(started),
                ..Default::default()
            });
        }

        let batch = settings.scheduler_batch_size.max(1) as usize;
        let interval_minutes = settings.progress_interval_minutes();

        let candidates = self.cases.progress_candidates(now, batch.saturating_mul(2)).await?;
        let candidate_count = candidates.len();
        let selected: Vec<CaseRecord> = candidates
            .into_iter()
            .filter(|case| is_active(case, &settings, now))
            .take(batch)
            .collect();

        let mut initialized = 0;
        let mut jobs = Vec::new();
        for case in &selected {
            let Some(due_at) = case.next_progress_sync_at else {
                let Some(first) = initial_progress_at(case.id, now, interval_minutes) else {
                    tracing::warn!(case_id = %case.id, "first progress sync out of range; case left unscheduled");
                    continue;
                };
                self.set_next_progress(case.id, first).await;
                initialized += 1;
                continue;
            };
            if due_at > now {
                continue;
            }

            jobs.push(NewSyncJob {
                tenant_id: case.tenant_id,
                case_id: Some(case.id),
                payload: JobPayload::Progress(CaseSyncPayload::auto()),
                priority: PROGRESS_PRIORITY,
                scheduled_at: now,
                dedup_key: DedupKey::hourly(SyncType::Progress, case.id, now),
            });
            match next_progress_at(now, &settings) {
                Some(next) => self.set_next_progress(case.id, next).await,
                None => tracing::warn!(case_id = %case.id, "next progress sync out of range; not rescheduled"),
            }
        }

        let summary = self.jobs.enqueue_many(jobs).await?;
        let token_jobs = self.schedule_token_renewals(&settings, now).await?;

        let report = SchedulerReport {
            success: true,
            message: None,
            scheduled_jobs: summary.inserted,
            initialized_cases: initialized,
            token_jobs,
            duration_ms: elapsed_ms(started),
        };

        tracing::info!(
            candidates = candidate_count,
            selected = selected.len(),
            scheduled = report.scheduled_jobs,
            duplicates = summary.duplicates,
            initialized,
            token_jobs,
            "scheduler run complete"
        );
        self.log
            .record(SyncLogEntry::scheduler(
                u32::try_from(report.scheduled_jobs).unwrap_or(u32::MAX),
                report.duration_ms,
                serde_json::json!({
                    "candidates": candidate_count,
                    "selected": selected.len(),
                    "initialized": initialized,
                    "duplicates": summary.duplicates,
                    "tokenJobs": token_jobs,
                }),
            ))
            .await;

        Ok(report)
    }

    async fn set_next_progress(&self, case_id: CaseId, at: DateTime<Utc>) {
        if let Err(err) = self.cases.set_next_progress_sync_at(case_id, at).await {
            tracing::warn!(case_id = %case_id, error = %err, "failed to set next progress sync");
        }
    }

    async fn schedule_token_renewals(
        &self,
        settings: &SyncSettings,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let renewal = &settings.token_renewal;
        if !renewal.auto_rotate_enabled {
            return Ok(0);
        }

        let horizon = now
            .checked_add_signed(settings.renewal_horizon())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let tokens = match self.tokens.expiring(horizon).await {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(error = %err, "session token query failed");
                return Ok(0);
            }
        };

        let jobs = tokens
            .into_iter()
            .map(|token| NewSyncJob::token_renewal(token.id, now))
            .collect();
        Ok(self.jobs.enqueue_many(jobs).await?.inserted)
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
