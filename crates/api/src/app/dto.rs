use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use casesync_core::{CaseId, JobId, TenantId};
use casesync_infra::config::SyncSettings;
use casesync_infra::jobs::{JobStats, SyncJob};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobRequest {
    pub case_id: Option<CaseId>,
    pub tenant_id: Option<TenantId>,
    pub sync_type: String,
    pub priority: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub payload: Option<serde_json::Value>,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub secret: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobResponse {
    pub inserted: bool,
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    pub stats: JobStats,
    pub recent: Vec<SyncJob>,
    pub settings: SyncSettings,
}
