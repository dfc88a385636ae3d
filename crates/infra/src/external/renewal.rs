//! Session-token (WMONID) renewal service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use casesync_core::TokenId;

/// A token the service renewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewedToken {
    pub token_id: TokenId,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalError {
    #[error("session token renewal failed")]
    NotRenewed,
    #[error("network error: {0}")]
    Network(String),
    #[error("renewal endpoint returned HTTP {0}")]
    Status(u16),
    #[error("malformed renewal response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait TokenRenewalService: Send + Sync {
    async fn renew(&self, token_id: TokenId) -> Result<RenewedToken, RenewalError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewRequest {
    token_id: TokenId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RenewResponse {
    renewed: bool,
    expires_at: Option<DateTime<Utc>>,
}

/// `POST {tokenId}` to the renewal endpoint; expects `{renewed, expiresAt?}`.
#[derive(Debug, Clone)]
pub struct HttpTokenRenewalService {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenRenewalService {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenRenewalService for HttpTokenRenewalService {
    async fn renew(&self, token_id: TokenId) -> Result<RenewedToken, RenewalError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&RenewRequest { token_id })
            .send()
            .await
            .map_err(|e| RenewalError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(RenewalError::Status(resp.status().as_u16()));
        }

        let body: RenewResponse = resp
            .json()
            .await
            .map_err(|e| RenewalError::Decode(e.to_string()))?;
        if !body.renewed {
            return Err(RenewalError::NotRenewed);
        }

        Ok(RenewedToken {
            token_id,
            expires_at: body.expires_at,
        })
    }
}
