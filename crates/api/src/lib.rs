//! HTTP API: trigger endpoints for the sync engine, job enqueue, and queue status.

pub mod app;
pub mod config;
