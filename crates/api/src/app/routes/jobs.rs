use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use casesync_core::SyncType;
use casesync_infra::jobs::{DedupKey, EnqueueOutcome, JobPayload, NewSyncJob};

use crate::app::{dto, errors};
use crate::app::routes::common::{presented_secret, SecretQuery};
use crate::app::services::AppServices;

const DEFAULT_RECENT: usize = 20;
const MAX_RECENT: usize = 200;

/// Enqueue one job; idempotent on the dedup key while a live job holds it.
pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<SecretQuery>,
    headers: HeaderMap,
    Json(body): Json<dto::EnqueueJobRequest>,
) -> axum::response::Response {
    if !services.secret.verify(presented_secret(&query, &headers).as_deref()) {
        return errors::unauthorized();
    }

    let job = match new_job(body) {
        Ok(job) => job,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    match services.jobs.enqueue(job).await {
        Ok(EnqueueOutcome::Inserted(job_id)) => (
            StatusCode::CREATED,
            Json(dto::EnqueueJobResponse {
                inserted: true,
                job_id,
            }),
        )
            .into_response(),
        Ok(EnqueueOutcome::Duplicate(job_id)) => (
            StatusCode::OK,
            Json(dto::EnqueueJobResponse {
                inserted: false,
                job_id,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "enqueue failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

/// Queue counts, the latest jobs, and the settings in effect.
pub async fn queue_status(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::RecentQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    let secret = SecretQuery {
        secret: query.secret,
    };
    if !services.secret.verify(presented_secret(&secret, &headers).as_deref()) {
        return errors::unauthorized();
    }

    let limit = query.limit.unwrap_or(DEFAULT_RECENT).min(MAX_RECENT);
    let stats = match services.jobs.stats().await {
        Ok(stats) => stats,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    };
    let recent = match services.jobs.recent(limit).await {
        Ok(recent) => recent,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    };
    let settings = match services.settings.load().await {
        Ok(settings) => settings,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "settings_error", e.to_string()),
    };

    Json(dto::QueueStatusResponse {
        stats,
        recent,
        settings,
    })
    .into_response()
}

fn new_job(body: dto::EnqueueJobRequest) -> Result<NewSyncJob, String> {
    let sync_type: SyncType = body.sync_type.parse().map_err(|e: casesync_core::DomainError| e.to_string())?;
    let payload = JobPayload::from_stored(
        sync_type,
        body.payload.unwrap_or(serde_json::Value::Null),
        body.priority.unwrap_or(0),
    )
    .map_err(|e| e.to_string())?;
    let priority = body
        .priority
        .unwrap_or_else(|| payload.trigger_source().default_priority());

    let now = Utc::now();
    let dedup_key = match body.dedup_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => DedupKey::new(key),
        None => derived_dedup_key(sync_type, body.case_id, &payload, now),
    };

    Ok(NewSyncJob {
        tenant_id: body.tenant_id,
        case_id: body.case_id,
        payload,
        priority,
        scheduled_at: body.scheduled_at.unwrap_or(now),
        dedup_key,
    })
}

/// `type:subject:hour`, where the subject is the case, else the token, else `none`.
fn derived_dedup_key(
    sync_type: SyncType,
    case_id: Option<casesync_core::CaseId>,
    payload: &JobPayload,
    now: chrono::DateTime<Utc>,
) -> DedupKey {
    let token_id = match payload {
        JobPayload::TokenRenewal(p) => p.token_id,
        _ => None,
    };
    match (case_id, token_id) {
        (Some(case_id), _) => DedupKey::hourly(sync_type, case_id, now),
        (None, Some(token_id)) => DedupKey::hourly(sync_type, token_id, now),
        (None, None) => DedupKey::hourly(sync_type, "none", now),
    }
}
