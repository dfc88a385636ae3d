//! Clients for the external court-records system.
//!
//! Both collaborators sit behind traits so the engine can run against stubs.

pub mod court;
pub mod renewal;

pub use court::{CourtSyncClient, CourtSyncRequest, CourtSyncResponse, ExternalCallError, HttpCourtSyncClient};
pub use renewal::{HttpTokenRenewalService, RenewalError, RenewedToken, TokenRenewalService};
