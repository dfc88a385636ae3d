use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};

use casesync_infra::jobs::DispatchError;
use casesync_infra::sync::SchedulerError;

use crate::app::errors;
use crate::app::routes::common::{presented_secret, SecretQuery};
use crate::app::services::AppServices;

/// Drain one batch of the sync queue.
pub async fn sync_worker(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<SecretQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    let secret = presented_secret(&query, &headers);
    match services.dispatcher.run(secret.as_deref()).await {
        Ok(report) => Json(report).into_response(),
        Err(DispatchError::Unauthorized) => errors::unauthorized(),
        Err(e) => {
            tracing::error!(error = %e, "sync worker invocation failed");
            errors::trigger_failed(e)
        }
    }
}

/// Enqueue due progress syncs and token renewals.
pub async fn sync_scheduler(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<SecretQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    let secret = presented_secret(&query, &headers);
    match services.scheduler.run(secret.as_deref()).await {
        Ok(report) => Json(report).into_response(),
        Err(SchedulerError::Unauthorized) => errors::unauthorized(),
        Err(e) => {
            tracing::error!(error = %e, "sync scheduler invocation failed");
            errors::trigger_failed(e)
        }
    }
}
