//! Sync engine components: handlers, rate limiting, cascade, audit log, and
//! the periodic scheduler. The dispatcher that drives them lives in
//! [`crate::jobs::dispatcher`].

pub mod auth;
pub mod cascade;
pub mod case_sync;
pub mod failure;
pub mod log;
pub mod rate_limit;
pub mod renewal;
pub mod scheduler;

pub use auth::CronSecret;
pub use cascade::{CascadeError, CascadeOutcome, CascadeScheduler};
pub use case_sync::{CaseSyncHandler, CaseSyncSuccess};
pub use failure::JobFailure;
pub use log::{
    InMemorySyncLog, JobLogDetails, LogAction, LogSinkError, LogStatus, LogWriter, PostgresSyncLog,
    SyncLogEntry, SyncLogSink,
};
pub use rate_limit::RateLimiter;
pub use renewal::RenewalHandler;
pub use scheduler::{Scheduler, SchedulerError, SchedulerReport};
