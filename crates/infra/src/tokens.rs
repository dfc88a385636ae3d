//! Court session tokens (WMONIDs) tracked for renewal.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::instrument;

use casesync_core::{DomainError, TokenId};

use crate::db::describe_sqlx_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTokenStatus {
    Active,
    /// Close to expiry; still usable.
    Expiring,
    Expired,
    Revoked,
}

impl SessionTokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionTokenStatus::Active => "active",
            SessionTokenStatus::Expiring => "expiring",
            SessionTokenStatus::Expired => "expired",
            SessionTokenStatus::Revoked => "revoked",
        }
    }

    /// Only live tokens are worth renewing.
    pub fn is_renewable(&self) -> bool {
        matches!(self, SessionTokenStatus::Active | SessionTokenStatus::Expiring)
    }
}

impl core::str::FromStr for SessionTokenStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionTokenStatus::Active),
            "expiring" => Ok(SessionTokenStatus::Expiring),
            "expired" => Ok(SessionTokenStatus::Expired),
            "revoked" => Ok(SessionTokenStatus::Revoked),
            other => Err(DomainError::unknown_variant("session token status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub id: TokenId,
    pub status: SessionTokenStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait SessionTokenRepository: Send + Sync {
    /// Renewable tokens expiring at or before `before`.
    async fn expiring(&self, before: DateTime<Utc>) -> Result<Vec<SessionToken>, TokenStoreError>;

    /// Record a successful renewal of `token_id`.
    ///
    /// `Some(expiry)` keeps the token active until the new expiry; `None` means
    /// the token was replaced and is now `expired`. Returns `false` when the
    /// token is unknown.
    async fn mark_renewed(
        &self,
        token_id: TokenId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, TokenStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionTokenRepository {
    tokens: RwLock<HashMap<TokenId, SessionToken>>,
}

impl InMemorySessionTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: SessionToken) -> Result<(), TokenStoreError> {
        self.tokens
            .write()
            .map_err(|_| TokenStoreError::Storage("token table lock poisoned".into()))?
            .insert(token.id, token);
        Ok(())
    }
}

#[async_trait]
impl SessionTokenRepository for InMemorySessionTokenRepository {
    async fn expiring(&self, before: DateTime<Utc>) -> Result<Vec<SessionToken>, TokenStoreError> {
        let tokens = self
            .tokens
            .read()
            .map_err(|_| TokenStoreError::Storage("token table lock poisoned".into()))?;
        let mut due: Vec<_> = tokens
            .values()
            .filter(|t| t.status.is_renewable() && t.expires_at <= before)
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.expires_at, t.id));
        Ok(due)
    }

    async fn mark_renewed(
        &self,
        token_id: TokenId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, TokenStoreError> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| TokenStoreError::Storage("token table lock poisoned".into()))?;
        let Some(token) = tokens.get_mut(&token_id) else {
            return Ok(false);
        };
        match expires_at {
            Some(expires_at) => {
                token.status = SessionTokenStatus::Active;
                token.expires_at = expires_at;
            }
            None => token.status = SessionTokenStatus::Expired,
        }
        Ok(true)
    }
}

#[async_trait]
impl<R: SessionTokenRepository + ?Sized> SessionTokenRepository for Arc<R> {
    async fn expiring(&self, before: DateTime<Utc>) -> Result<Vec<SessionToken>, TokenStoreError> {
        (**self).expiring(before).await
    }

    async fn mark_renewed(
        &self,
        token_id: TokenId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, TokenStoreError> {
        (**self).mark_renewed(token_id, expires_at).await
    }
}

#[derive(Debug, Clone)]
pub struct PostgresSessionTokenRepository {
    pool: PgPool,
}

impl PostgresSessionTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionTokenRepository for PostgresSessionTokenRepository {
    #[instrument(skip(self), err)]
    async fn expiring(&self, before: DateTime<Utc>) -> Result<Vec<SessionToken>, TokenStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, expires_at
            FROM session_tokens
            WHERE expires_at <= $1 AND status IN ('active', 'expiring')
            ORDER BY expires_at ASC
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TokenStoreError::Storage(describe_sqlx_error("expiring", e)))?;

        rows.iter()
            .map(|row| -> Result<SessionToken, TokenStoreError> {
                let decode = |e: sqlx::Error| TokenStoreError::Storage(describe_sqlx_error("expiring", e));
                let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
                let status: String = row.try_get("status").map_err(decode)?;
                let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(decode)?;
                Ok(SessionToken {
                    id: TokenId::from_uuid(id),
                    status: status
                        .parse()
                        .map_err(|e: DomainError| TokenStoreError::Storage(e.to_string()))?,
                    expires_at,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_renewed(
        &self,
        token_id: TokenId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, TokenStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE session_tokens
            SET status = CASE WHEN $2::timestamptz IS NULL THEN 'expired' ELSE 'active' END,
                expires_at = COALESCE($2, expires_at)
            WHERE id = $1
            "#,
        )
        .bind(token_id.as_uuid())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenStoreError::Storage(describe_sqlx_error("mark_renewed", e)))?;

        Ok(result.rows_affected() > 0)
    }
}
