//! Infrastructure layer: job queue, case and token repositories, court clients,
//! and the dispatcher/scheduler that drive background case syncs.

pub mod cases;
pub mod config;
pub mod db;
pub mod external;
pub mod jobs;
pub mod sync;
pub mod tokens;

#[cfg(test)]
mod integration_tests;
