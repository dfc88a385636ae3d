use axum::{
    routing::{get, post},
    Router,
};

pub mod common;
pub mod cron;
pub mod jobs;
pub mod system;

/// Router for all secret-protected endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/cron/sync-worker", get(cron::sync_worker).post(cron::sync_worker))
        .route("/cron/sync-scheduler", get(cron::sync_scheduler).post(cron::sync_scheduler))
        .route("/jobs", post(jobs::enqueue))
        .route("/queue/status", get(jobs::queue_status))
}
