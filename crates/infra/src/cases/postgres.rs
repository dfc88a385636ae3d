//! Postgres-backed case repository over `legal_cases`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use casesync_core::{CaseId, TenantId};

use crate::db::describe_sqlx_error;

use super::{CaseRecord, CaseRepository, CaseStoreError, SyncStamp};

const CASE_COLUMNS: &str = r#"
    id, tenant_id, case_number, court_name, status, has_final_result, sync_enabled,
    cooldown_until, enc_token, session_token, last_general_sync_at,
    next_general_sync_at, next_progress_sync_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresCaseRepository {
    pool: Arc<PgPool>,
}

impl PostgresCaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn set_timestamp(
        &self,
        operation: &str,
        column: &str,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError> {
        let sql = format!("UPDATE legal_cases SET {column} = $2, updated_at = now() WHERE id = $1");
        let result = sqlx::query(&sql)
            .bind(case_id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(CaseStoreError::NotFound(case_id));
        }
        Ok(())
    }
}

#[async_trait]
impl CaseRepository for PostgresCaseRepository {
    #[instrument(skip(self), err)]
    async fn find(&self, case_id: CaseId) -> Result<Option<CaseRecord>, CaseStoreError> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM legal_cases WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(case_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        match row {
            Some(row) => {
                let row = CaseRow::from_row(&row).map_err(|e| map_sqlx_error("find", e))?;
                Ok(Some(row.into()))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn progress_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CaseRecord>, CaseStoreError> {
        let sql = format!(
            r#"
            SELECT {CASE_COLUMNS}
            FROM legal_cases
            WHERE sync_enabled
              AND case_number IS NOT NULL
              AND (next_progress_sync_at IS NULL OR next_progress_sync_at <= $1)
            ORDER BY next_progress_sync_at ASC NULLS FIRST, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("progress_candidates", e))?;

        let mut cases = Vec::with_capacity(rows.len());
        for row in rows {
            let row = CaseRow::from_row(&row).map_err(|e| map_sqlx_error("progress_candidates", e))?;
            cases.push(row.into());
        }
        Ok(cases)
    }

    #[instrument(skip(self), err)]
    async fn set_next_progress_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError> {
        self.set_timestamp("set_next_progress_sync_at", "next_progress_sync_at", case_id, at)
            .await
    }

    #[instrument(skip(self), err)]
    async fn set_next_general_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError> {
        self.set_timestamp("set_next_general_sync_at", "next_general_sync_at", case_id, at)
            .await
    }

    #[instrument(skip(self), err)]
    async fn record_sync_success(&self, case_id: CaseId, stamp: SyncStamp) -> Result<(), CaseStoreError> {
        if stamp.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE legal_cases
            SET cooldown_until = COALESCE($2, cooldown_until),
                last_general_sync_at = COALESCE($3, last_general_sync_at),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(case_id.as_uuid())
        .bind(stamp.cooldown_until)
        .bind(stamp.general_synced_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_sync_success", e))?;

        if result.rows_affected() == 0 {
            return Err(CaseStoreError::NotFound(case_id));
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CaseStoreError {
    CaseStoreError::Storage(describe_sqlx_error(operation, err))
}

// SQLx row types

#[derive(Debug)]
struct CaseRow {
    id: uuid::Uuid,
    tenant_id: Option<uuid::Uuid>,
    case_number: Option<String>,
    court_name: Option<String>,
    status: Option<String>,
    has_final_result: bool,
    sync_enabled: bool,
    cooldown_until: Option<DateTime<Utc>>,
    enc_token: Option<String>,
    session_token: Option<String>,
    last_general_sync_at: Option<DateTime<Utc>>,
    next_general_sync_at: Option<DateTime<Utc>>,
    next_progress_sync_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CaseRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(CaseRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            case_number: row.try_get("case_number")?,
            court_name: row.try_get("court_name")?,
            status: row.try_get("status")?,
            has_final_result: row.try_get("has_final_result")?,
            sync_enabled: row.try_get("sync_enabled")?,
            cooldown_until: row.try_get("cooldown_until")?,
            enc_token: row.try_get("enc_token")?,
            session_token: row.try_get("session_token")?,
            last_general_sync_at: row.try_get("last_general_sync_at")?,
            next_general_sync_at: row.try_get("next_general_sync_at")?,
            next_progress_sync_at: row.try_get("next_progress_sync_at")?,
        })
    }
}

impl From<CaseRow> for CaseRecord {
    fn from(row: CaseRow) -> Self {
        CaseRecord {
            id: CaseId::from_uuid(row.id),
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            case_number: row.case_number,
            court_name: row.court_name,
            status: row.status,
            has_final_result: row.has_final_result,
            sync_enabled: row.sync_enabled,
            cooldown_until: row.cooldown_until,
            enc_token: row.enc_token,
            session_token: row.session_token,
            last_general_sync_at: row.last_general_sync_at,
            next_general_sync_at: row.next_general_sync_at,
            next_progress_sync_at: row.next_progress_sync_at,
        }
    }
}
