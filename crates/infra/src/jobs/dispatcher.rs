//! One dispatcher invocation: authorize, load settings, claim a batch, and run
//! it through a bounded pool of workers sharing one rate limiter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use casesync_core::WorkerRunId;

use crate::config::{SettingsError, SettingsProvider, SyncSettings};
use crate::sync::{
    CascadeScheduler, CaseSyncHandler, CaseSyncSuccess, CronSecret, JobFailure, JobLogDetails,
    LogAction, LogStatus, LogWriter, RateLimiter, RenewalHandler, SyncLogEntry,
};

use super::backoff::RetryPolicy;
use super::store::{JobStore, JobStoreError};
use super::types::{JobPayload, JobStatus, JobTransition, SyncJob};

/// Invocation-level failure. Per-job failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("failed to claim jobs: {0}")]
    Claim(#[from] JobStoreError),
}

/// Summary of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub success: bool,
    pub processed: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_run_id: Option<WorkerRunId>,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DispatchReport {
    fn idle(message: &str, started: Instant) -> Self {
        Self {
            success: true,
            message: Some(message.to_string()),
            duration_ms: elapsed_ms(started),
            ..Default::default()
        }
    }

    fn count(&mut self, outcome: JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Retried,
    Failed,
    Skipped,
}

/// Drains the sync queue one batch per [`Dispatcher::run`].
///
/// Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct Dispatcher {
    secret: CronSecret,
    settings: Arc<dyn SettingsProvider>,
    jobs: Arc<dyn JobStore>,
    case_sync: CaseSyncHandler,
    renewal: RenewalHandler,
    cascade: CascadeScheduler,
    log: LogWriter,
}

/// State shared by the workers of one invocation.
struct Cycle {
    dispatcher: Dispatcher,
    settings: SyncSettings,
    policy: RetryPolicy,
    limiter: RateLimiter,
    batch: Vec<SyncJob>,
    cursor: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        secret: CronSecret,
        settings: Arc<dyn SettingsProvider>,
        jobs: Arc<dyn JobStore>,
        case_sync: CaseSyncHandler,
        renewal: RenewalHandler,
        cascade: CascadeScheduler,
        log: LogWriter,
    ) -> Self {
        Self {
            secret,
            settings,
            jobs,
            case_sync,
            renewal,
            cascade,
            log,
        }
    }

    /// Verify the caller's secret, then run one cycle.
    ///
    /// A rejected caller causes no side effects.
    pub async fn run(&self, presented_secret: Option<&str>) -> Result<DispatchReport, DispatchError> {
        if !self.secret.verify(presented_secret) {
            return Err(DispatchError::Unauthorized);
        }
        self.run_authorized().await
    }

    pub async fn run_authorized(&self) -> Result<DispatchReport, DispatchError> {
        let started = Instant::now();
        let settings = self.settings.load().await?;
        if !settings.auto_sync_enabled {
            return Ok(DispatchReport::idle("auto sync disabled", started));
        }

        let worker_run_id = WorkerRunId::random();
        let batch = self
            .jobs
            .claim(settings.batch_size(), worker_run_id, Utc::now())
            .await?;
        if batch.is_empty() {
            return Ok(DispatchReport::idle("no jobs", started));
        }

        let workers = settings.concurrency().min(batch.len());
        info!(
            worker_run_id = %worker_run_id,
            claimed = batch.len(),
            workers,
            "dispatching sync jobs"
        );

        let cycle = Arc::new(Cycle {
            dispatcher: self.clone(),
            policy: RetryPolicy::from_settings(&settings),
            limiter: RateLimiter::from_settings(&settings),
            settings,
            batch,
            cursor: AtomicUsize::new(0),
        });

        let mut report = DispatchReport {
            success: true,
            worker_run_id: Some(worker_run_id),
            ..Default::default()
        };

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let cycle = Arc::clone(&cycle);
            pool.spawn(cycle.work());
        }
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(outcomes) => outcomes.into_iter().for_each(|o| report.count(o)),
                Err(e) => error!(worker_run_id = %worker_run_id, error = %e, "sync worker aborted"),
            }
        }

        report.duration_ms = elapsed_ms(started);
        info!(
            worker_run_id = %worker_run_id,
            processed = report.processed,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "dispatch complete"
        );
        Ok(report)
    }
}

impl Cycle {
    /// Pull jobs off the shared cursor until the batch is exhausted.
    ///
    /// Each job runs in its own task so a panic settles that job and the
    /// worker moves on.
    async fn work(self: Arc<Self>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(job) = self.batch.get(index) else {
                break;
            };
            let cycle = Arc::clone(&self);
            let outcome = match tokio::spawn(async move { cycle.execute(&cycle.batch[index]).await }).await {
                Ok(outcome) => outcome,
                Err(e) => self.abandon(job, &e.to_string()).await,
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Settle a job whose execution aborted: terminal failure, logged.
    async fn abandon(&self, job: &SyncJob, reason: &str) -> JobOutcome {
        let d = &self.dispatcher;
        let error = format!("job execution aborted: {reason}");
        error!(job_id = %job.id, error = %error, "sync job aborted");

        if let Err(e) = d
            .jobs
            .transition(job.id, JobTransition::Failed { error: error.clone() }, Utc::now())
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to record job transition");
        }

        let details = JobLogDetails {
            job_id: Some(job.id),
            case_id: job.case_id,
            trigger_source: Some(job.trigger_source()),
            attempts: job.attempts,
            error: Some(error),
            ..Default::default()
        };
        d.log
            .record(SyncLogEntry::job(
                LogAction::for_sync_type(job.sync_type()),
                LogStatus::Failed,
                0,
                &details,
            ))
            .await;
        JobOutcome::Failed
    }

    async fn execute(&self, job: &SyncJob) -> JobOutcome {
        let started = Instant::now();
        let d = &self.dispatcher;

        let mut details = JobLogDetails {
            job_id: Some(job.id),
            case_id: job.case_id,
            trigger_source: Some(job.trigger_source()),
            attempts: job.attempts,
            ..Default::default()
        };

        let result: Result<Option<CaseSyncSuccess>, JobFailure> = match &job.payload {
            JobPayload::TokenRenewal(payload) => {
                details.token_id = payload.token_id;
                d.renewal.handle(payload).await.map(|_| None)
            }
            JobPayload::Progress(payload) | JobPayload::General(payload) | JobPayload::Full(payload) => d
                .case_sync
                .handle(job, payload, &self.settings, &self.limiter)
                .await
                .map(Some),
        };

        let now = Utc::now();
        let (transition, outcome, status) = match &result {
            Ok(_) => (JobTransition::Succeeded, JobOutcome::Succeeded, LogStatus::Success),
            Err(failure) if failure.is_retryable() && self.policy.should_retry(job.attempts) => (
                JobTransition::Retry {
                    backoff_until: self.policy.backoff_until(job.attempts, now),
                    error: failure.to_string(),
                },
                JobOutcome::Retried,
                LogStatus::Retry,
            ),
            Err(failure) => match failure.terminal_status() {
                JobStatus::Skipped => (
                    JobTransition::Skipped {
                        reason: failure.to_string(),
                    },
                    JobOutcome::Skipped,
                    LogStatus::Skipped,
                ),
                _ => (
                    JobTransition::Failed {
                        error: failure.to_string(),
                    },
                    JobOutcome::Failed,
                    LogStatus::Failed,
                ),
            },
        };

        match &result {
            Ok(Some(success)) => {
                details.effective_sync_type = Some(success.effective_sync_type);
                details.progress_changed = Some(success.progress_changed);
            }
            Ok(None) => {}
            Err(failure) => {
                details.error = Some(failure.to_string());
                debug!(job_id = %job.id, attempts = job.attempts, error = %failure, "sync job did not succeed");
            }
        }

        if let Err(e) = d.jobs.transition(job.id, transition, now).await {
            error!(job_id = %job.id, error = %e, "failed to record job transition");
        }

        d.log
            .record(SyncLogEntry::job(
                LogAction::for_sync_type(job.sync_type()),
                status,
                elapsed_ms(started),
                &details,
            ))
            .await;

        if let Ok(Some(success)) = &result {
            if success.wants_cascade() {
                if let Err(e) = d
                    .cascade
                    .schedule_general(&success.case, &self.settings, Utc::now())
                    .await
                {
                    warn!(job_id = %job.id, case_id = %success.case.id, error = %e, "cascade failed");
                }
            }
        }

        outcome
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("secret", &self.secret)
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
