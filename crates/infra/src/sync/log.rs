//! Append-only sync audit log.
//!
//! One record per job execution attempt and per scheduler run. Sink failures
//! never reach the caller: [`LogWriter`] reports them through `tracing` and
//! moves on.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use casesync_core::{CaseId, JobId, SyncType, TokenId, TriggerSource};

use crate::db::describe_sqlx_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    SyncProgress,
    SyncGeneral,
    SyncFull,
    TokenRenewal,
    Scheduler,
}

impl LogAction {
    pub fn for_sync_type(sync_type: SyncType) -> Self {
        match sync_type {
            SyncType::Progress => LogAction::SyncProgress,
            SyncType::General => LogAction::SyncGeneral,
            SyncType::Full => LogAction::SyncFull,
            SyncType::TokenRenewal => LogAction::TokenRenewal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::SyncProgress => "sync_progress",
            LogAction::SyncGeneral => "sync_general",
            LogAction::SyncFull => "sync_full",
            LogAction::TokenRenewal => "token_renewal",
            LogAction::Scheduler => "scheduler",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
    Skipped,
    /// Failed and requeued behind a backoff.
    Retry,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
            LogStatus::Skipped => "skipped",
            LogStatus::Retry => "retry",
        }
    }
}

/// Per-job metadata stored in a record's `details`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogDetails {
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<CaseId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_source: Option<TriggerSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_sync_type: Option<SyncType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_changed: Option<bool>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub action: LogAction,
    pub status: LogStatus,
    pub cases_synced: u32,
    pub cases_failed: u32,
    pub duration_ms: u64,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SyncLogEntry {
    /// Record for one job attempt; counts one case synced on success, one failed otherwise.
    pub fn job(action: LogAction, status: LogStatus, duration_ms: u64, details: &JobLogDetails) -> Self {
        let success = status == LogStatus::Success;
        Self {
            action,
            status,
            cases_synced: u32::from(success),
            cases_failed: u32::from(!success),
            duration_ms,
            details: serde_json::to_value(details).unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
        }
    }

    pub fn scheduler(scheduled: u32, duration_ms: u64, details: serde_json::Value) -> Self {
        Self {
            action: LogAction::Scheduler,
            status: LogStatus::Success,
            cases_synced: scheduled,
            cases_failed: 0,
            duration_ms,
            details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LogSinkError {
    #[error("log storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait SyncLogSink: Send + Sync {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), LogSinkError>;
}

/// Best-effort front for a [`SyncLogSink`].
#[derive(Clone)]
pub struct LogWriter {
    sink: Arc<dyn SyncLogSink>,
}

impl LogWriter {
    pub fn new(sink: Arc<dyn SyncLogSink>) -> Self {
        Self { sink }
    }

    /// Append `entry`; a sink error is logged and dropped.
    pub async fn record(&self, entry: SyncLogEntry) {
        if let Err(err) = self.sink.append(&entry).await {
            tracing::warn!(
                action = entry.action.as_str(),
                status = entry.status.as_str(),
                error = %err,
                "failed to write sync log entry"
            );
        }
    }
}

impl core::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct InMemorySyncLog {
    entries: Mutex<Vec<SyncLogEntry>>,
}

impl InMemorySyncLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<SyncLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SyncLogSink for InMemorySyncLog {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), LogSinkError> {
        self.entries
            .lock()
            .map_err(|_| LogSinkError::Storage("log lock poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }
}

/// Writes to `sync_logs`.
#[derive(Debug, Clone)]
pub struct PostgresSyncLog {
    pool: PgPool,
}

impl PostgresSyncLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncLogSink for PostgresSyncLog {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), LogSinkError> {
        sqlx::query(
            r#"
            INSERT INTO sync_logs (action, status, cases_synced, cases_failed, duration_ms, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.action.as_str())
        .bind(entry.status.as_str())
        .bind(entry.cases_synced as i32)
        .bind(entry.cases_failed as i32)
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LogSinkError::Storage(describe_sqlx_error("append_log", e)))?;
        Ok(())
    }
}
