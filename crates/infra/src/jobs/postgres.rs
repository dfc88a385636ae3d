//! Postgres-backed sync queue.
//!
//! ## Claim atomicity
//!
//! `claim` is a single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)`
//! statement: rows locked by a concurrent claimer are skipped rather than
//! waited on, so two dispatcher runs never receive the same job.
//!
//! ## Deduplication
//!
//! A partial unique index on `dedup_key` over non-terminal rows backs
//! `ON CONFLICT DO NOTHING`; a conflicting enqueue reports
//! [`EnqueueOutcome::Duplicate`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use casesync_core::{CaseId, JobId, SyncType, TenantId, WorkerRunId};

use crate::db::{describe_sqlx_error, is_unique_violation};

use super::store::{EnqueueOutcome, JobStats, JobStore, JobStoreError};
use super::types::{DedupKey, JobPayload, JobStatus, JobTransition, NewSyncJob, SyncJob};

const JOB_COLUMNS: &str = r#"
    id, tenant_id, case_id, sync_type, payload, priority, attempts, status,
    scheduled_at, backoff_until, last_error, worker_id, claimed_at, finished_at,
    dedup_key, created_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Id of the non-terminal job holding `dedup_key`, if it is still live.
    async fn live_job_for(&self, dedup_key: &DedupKey) -> Result<Option<EnqueueOutcome>, JobStoreError> {
        let existing: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM sync_jobs
            WHERE dedup_key = $1 AND status IN ('queued', 'claimed')
            LIMIT 1
            "#,
        )
        .bind(dedup_key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(existing.map(|id| EnqueueOutcome::Duplicate(JobId::from_uuid(id))))
    }

    /// One insert attempt. `None`: the key conflicted but its holder finished
    /// before the lookup.
    async fn try_enqueue(&self, job: &NewSyncJob) -> Result<Option<EnqueueOutcome>, JobStoreError> {
        let id = JobId::new();
        let now = Utc::now();

        let inserted: Result<Option<uuid::Uuid>, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO sync_jobs (
                id, tenant_id, case_id, sync_type, payload, priority, attempts,
                status, scheduled_at, dedup_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, 'queued', $7, $8, $9, $9)
            ON CONFLICT (dedup_key) WHERE status IN ('queued', 'claimed') DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(job.tenant_id.map(uuid::Uuid::from))
        .bind(job.case_id.map(uuid::Uuid::from))
        .bind(job.sync_type().as_str())
        .bind(job.payload.to_stored_json())
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(job.dedup_key.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await;

        match inserted {
            Ok(Some(_)) => Ok(Some(EnqueueOutcome::Inserted(id))),
            Ok(None) => self.live_job_for(&job.dedup_key).await,
            // Lost a race against a concurrent insert of the same key.
            Err(e) if is_unique_violation(&e) => self.live_job_for(&job.dedup_key).await,
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }
}

/// Attempts an enqueue made before giving up on a key whose holder keeps
/// finishing between conflict and lookup.
const ENQUEUE_ATTEMPTS: usize = 2;

async fn enqueue_with_retry<F, Fut>(dedup_key: &DedupKey, mut attempt: F) -> Result<EnqueueOutcome, JobStoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<EnqueueOutcome>, JobStoreError>>,
{
    for _ in 0..ENQUEUE_ATTEMPTS {
        if let Some(outcome) = attempt().await? {
            return Ok(outcome);
        }
        tracing::debug!(dedup_key = %dedup_key, "dedup holder finished mid-enqueue; retrying insert");
    }
    Err(JobStoreError::Storage(format!(
        "dedup key {dedup_key} kept conflicting without a live holder"
    )))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(sync_type = %job.sync_type(), dedup_key = %job.dedup_key), err)]
    async fn enqueue(&self, job: NewSyncJob) -> Result<EnqueueOutcome, JobStoreError> {
        enqueue_with_retry(&job.dedup_key, || self.try_enqueue(&job)).await
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn claim(
        &self,
        limit: usize,
        worker_id: WorkerRunId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE sync_jobs
            SET status = 'claimed',
                attempts = attempts + 1,
                worker_id = $2,
                claimed_at = $3,
                updated_at = $3
            WHERE id IN (
                SELECT id FROM sync_jobs
                WHERE status = 'queued'
                  AND scheduled_at <= $3
                  AND (backoff_until IS NULL OR backoff_until <= $3)
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(worker_id.as_uuid())
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let mut jobs = decode_rows(rows)?;
        // RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
                .then(a.id.cmp(&b.id))
        });
        tracing::debug!(claimed = jobs.len(), "claimed sync jobs");
        Ok(jobs)
    }

    #[instrument(skip(self, transition), fields(job_id = %job_id, status = %transition.status()), err)]
    async fn transition(
        &self,
        job_id: JobId,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let backoff_until = match &transition {
            JobTransition::Retry { backoff_until, .. } => Some(*backoff_until),
            _ => None,
        };
        let finished_at = transition.status().is_terminal().then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = $2,
                backoff_until = CASE
                    WHEN $2 = 'success' THEN NULL
                    WHEN $2 = 'queued' THEN $3
                    ELSE backoff_until
                END,
                scheduled_at = COALESCE($3, scheduled_at),
                last_error = $4,
                finished_at = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(transition.status().as_str())
        .bind(backoff_until)
        .bind(transition.error())
        .bind(finished_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<SyncJob>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status,
                   sync_type,
                   (backoff_until IS NOT NULL AND backoff_until > now()) AS backing_off,
                   COUNT(*) AS count,
                   MIN(scheduled_at) AS oldest
            FROM sync_jobs
            GROUP BY 1, 2, 3
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let sync_type: String =
                row.try_get("sync_type").map_err(|e| map_sqlx_error("stats", e))?;
            let backing_off: bool =
                row.try_get("backing_off").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let oldest: Option<DateTime<Utc>> =
                row.try_get("oldest").map_err(|e| map_sqlx_error("stats", e))?;

            let status: JobStatus = status
                .parse()
                .map_err(|e| JobStoreError::Storage(format!("stats: {e}")))?;
            let sync_type: SyncType = sync_type
                .parse()
                .map_err(|e| JobStoreError::Storage(format!("stats: {e}")))?;
            stats.record(status, sync_type, backing_off, count.max(0) as usize);
            if let (JobStatus::Queued, Some(oldest)) = (status, oldest) {
                stats.observe_queued_at(oldest);
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn recent(&self, limit: usize) -> Result<Vec<SyncJob>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY created_at DESC, id DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("recent", e))?;

        decode_rows(rows)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(describe_sqlx_error(operation, err))
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<SyncJob>, JobStoreError> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<SyncJob, JobStoreError> {
    let row = SyncJobRow::from_row(row).map_err(|e| map_sqlx_error("decode job row", e))?;
    SyncJob::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct SyncJobRow {
    id: uuid::Uuid,
    tenant_id: Option<uuid::Uuid>,
    case_id: Option<uuid::Uuid>,
    sync_type: String,
    payload: serde_json::Value,
    priority: i32,
    attempts: i32,
    status: String,
    scheduled_at: DateTime<Utc>,
    backoff_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    worker_id: Option<uuid::Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    dedup_key: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SyncJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SyncJobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            case_id: row.try_get("case_id")?,
            sync_type: row.try_get("sync_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            backoff_until: row.try_get("backoff_until")?,
            last_error: row.try_get("last_error")?,
            worker_id: row.try_get("worker_id")?,
            claimed_at: row.try_get("claimed_at")?,
            finished_at: row.try_get("finished_at")?,
            dedup_key: row.try_get("dedup_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = JobStoreError;

    fn try_from(row: SyncJobRow) -> Result<Self, Self::Error> {
        let id = JobId::from_uuid(row.id);
        let invalid = |reason: String| JobStoreError::InvalidRow { id, reason };

        let sync_type: SyncType = row.sync_type.parse().map_err(|e| invalid(format!("{e}")))?;
        let status: JobStatus = row.status.parse().map_err(|e| invalid(format!("{e}")))?;
        let payload = JobPayload::from_stored(sync_type, row.payload, row.priority)
            .map_err(|e| invalid(format!("{e}")))?;

        Ok(SyncJob {
            id,
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            case_id: row.case_id.map(CaseId::from_uuid),
            payload,
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            status,
            scheduled_at: row.scheduled_at,
            backoff_until: row.backoff_until,
            last_error: row.last_error,
            worker_id: row.worker_id.map(WorkerRunId::from_uuid),
            claimed_at: row.claimed_at,
            finished_at: row.finished_at,
            dedup_key: DedupKey::new(row.dedup_key),
            created_at: row.created_at,
        })
    }
}
