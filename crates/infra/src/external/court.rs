//! Per-case sync endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use casesync_core::{CaseId, SyncType, TriggerSource};

/// Body of one external sync call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourtSyncRequest {
    pub legal_case_id: CaseId,
    pub case_number: Option<String>,
    pub court_name: Option<String>,
    /// Set for manual triggers; the endpoint skips its own freshness checks.
    pub force_refresh: bool,
    pub sync_type: SyncType,
    pub trigger_source: TriggerSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CourtSyncResponse {
    pub success: bool,
    /// The endpoint decided nothing needed fetching; counts as success.
    pub skipped: bool,
    pub error: Option<String>,
    pub progress_changed: bool,
}

impl CourtSyncResponse {
    pub fn changed() -> Self {
        Self {
            success: true,
            progress_changed: true,
            ..Self::default()
        }
    }

    pub fn unchanged() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.success || self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExternalCallError {
    #[error("network error: {0}")]
    Network(String),
    #[error("sync endpoint returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// 2xx response that reported neither success nor skip.
    #[error("{0}")]
    Rejected(String),
    #[error("malformed sync response: {0}")]
    Decode(String),
}

/// The external per-case sync operation.
#[async_trait]
pub trait CourtSyncClient: Send + Sync {
    /// Run one sync; `Ok` only when the response counts as success.
    async fn sync_case(&self, request: &CourtSyncRequest) -> Result<CourtSyncResponse, ExternalCallError>;
}

/// `POST`s requests as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpCourtSyncClient {
    client: reqwest::Client,
    url: String,
}

impl HttpCourtSyncClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CourtSyncClient for HttpCourtSyncClient {
    async fn sync_case(&self, request: &CourtSyncRequest) -> Result<CourtSyncResponse, ExternalCallError> {
        let resp = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| ExternalCallError::Network(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExternalCallError::Network(e.to_string()))?;
        let body: Option<CourtSyncResponse> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let message = body
                .and_then(|b| b.error)
                .unwrap_or_else(|| "Sync failed".to_string());
            return Err(ExternalCallError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = body.ok_or_else(|| ExternalCallError::Decode(text))?;
        if !body.is_ok() {
            return Err(ExternalCallError::Rejected(
                body.error.unwrap_or_else(|| "Sync failed".to_string()),
            ));
        }
        Ok(body)
    }
}
