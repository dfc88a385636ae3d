//! Session-token renewal jobs.

use std::sync::Arc;

use crate::external::{RenewedToken, TokenRenewalService};
use crate::jobs::TokenRenewalPayload;
use crate::tokens::SessionTokenRepository;

use super::failure::JobFailure;

/// Runs `token_renewal` jobs against the renewal service and records the
/// outcome on the token row.
#[derive(Clone)]
pub struct RenewalHandler {
    service: Arc<dyn TokenRenewalService>,
    tokens: Arc<dyn SessionTokenRepository>,
}

impl RenewalHandler {
    pub fn new(service: Arc<dyn TokenRenewalService>, tokens: Arc<dyn SessionTokenRepository>) -> Self {
        Self { service, tokens }
    }

    pub async fn handle(&self, payload: &TokenRenewalPayload) -> Result<RenewedToken, JobFailure> {
        let token_id = payload.token_id.ok_or(JobFailure::MissingTokenReference)?;
        let renewed = self.service.renew(token_id).await?;
        tracing::info!(token_id = %token_id, expires_at = ?renewed.expires_at, "session token renewed");

        // A different id means the old token was replaced.
        let expires_at = renewed.expires_at.filter(|_| renewed.token_id == token_id);
        match self.tokens.mark_renewed(token_id, expires_at).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(token_id = %token_id, "renewed token not found in token store"),
            Err(e) => tracing::warn!(token_id = %token_id, error = %e, "failed to record token renewal"),
        }
        Ok(renewed)
    }
}

impl core::fmt::Debug for RenewalHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RenewalHandler").finish_non_exhaustive()
    }
}
