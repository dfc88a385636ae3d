//! Persisted sync queue and the dispatcher that drains it.
//!
//! ## Components
//!
//! - `SyncJob`: queued unit of work with a typed payload per sync type
//! - `JobStore`: persistence with atomic claim (in-memory or Postgres)
//! - `RetryPolicy`: exponential backoff with jitter
//! - `Dispatcher`: one claim-and-run cycle over a bounded worker pool

pub mod backoff;
pub mod dispatcher;
pub mod postgres;
pub mod store;
pub mod types;

pub use backoff::RetryPolicy;
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher};
pub use postgres::PostgresJobStore;
pub use store::{EnqueueOutcome, EnqueueSummary, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    CaseSyncPayload, DedupKey, JobPayload, JobStatus, JobTransition, NewSyncJob, SyncJob,
    TokenRenewalPayload, DEFAULT_MAX_ATTEMPTS,
};
