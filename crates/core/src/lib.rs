//! `casesync-core` — domain primitives shared by the sync engine and its adapters.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod sync;

pub use error::DomainError;
pub use id::{CaseId, JobId, TenantId, TokenId, WorkerRunId};
pub use sync::{SyncType, TriggerSource};
