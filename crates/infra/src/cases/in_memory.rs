use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use casesync_core::CaseId;

use super::{CaseRecord, CaseRepository, CaseStoreError, SyncStamp};

/// In-memory case table for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCaseRepository {
    cases: RwLock<HashMap<CaseId, CaseRecord>>,
}

impl InMemoryCaseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, case: CaseRecord) -> Result<(), CaseStoreError> {
        let mut cases = self.cases.write().map_err(|_| poisoned())?;
        cases.insert(case.id, case);
        Ok(())
    }

    /// Current copy of a case; `None` if absent.
    pub fn snapshot(&self, case_id: CaseId) -> Option<CaseRecord> {
        self.cases.read().ok()?.get(&case_id).cloned()
    }

    fn update(
        &self,
        case_id: CaseId,
        f: impl FnOnce(&mut CaseRecord),
    ) -> Result<(), CaseStoreError> {
        let mut cases = self.cases.write().map_err(|_| poisoned())?;
        let case = cases.get_mut(&case_id).ok_or(CaseStoreError::NotFound(case_id))?;
        f(case);
        Ok(())
    }
}

fn poisoned() -> CaseStoreError {
    CaseStoreError::Storage("case table lock poisoned".to_string())
}

#[async_trait]
impl CaseRepository for InMemoryCaseRepository {
    async fn find(&self, case_id: CaseId) -> Result<Option<CaseRecord>, CaseStoreError> {
        let cases = self.cases.read().map_err(|_| poisoned())?;
        Ok(cases.get(&case_id).cloned())
    }

    async fn progress_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CaseRecord>, CaseStoreError> {
        let cases = self.cases.read().map_err(|_| poisoned())?;
        let mut due: Vec<CaseRecord> = cases
            .values()
            .filter(|c| {
                c.sync_enabled
                    && c.case_number.is_some()
                    && c.next_progress_sync_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.next_progress_sync_at, c.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn set_next_progress_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError> {
        self.update(case_id, |c| c.next_progress_sync_at = Some(at))
    }

    async fn set_next_general_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError> {
        self.update(case_id, |c| c.next_general_sync_at = Some(at))
    }

    async fn record_sync_success(&self, case_id: CaseId, stamp: SyncStamp) -> Result<(), CaseStoreError> {
        self.update(case_id, |c| {
            if let Some(until) = stamp.cooldown_until {
                c.cooldown_until = Some(until);
            }
            if let Some(at) = stamp.general_synced_at {
                c.last_general_sync_at = Some(at);
            }
        })
    }
}

#[async_trait]
impl<R: CaseRepository + ?Sized> CaseRepository for Arc<R> {
    async fn find(&self, case_id: CaseId) -> Result<Option<CaseRecord>, CaseStoreError> {
        (**self).find(case_id).await
    }

    async fn progress_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CaseRecord>, CaseStoreError> {
        (**self).progress_candidates(now, limit).await
    }

    async fn set_next_progress_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError> {
        (**self).set_next_progress_sync_at(case_id, at).await
    }

    async fn set_next_general_sync_at(
        &self,
        case_id: CaseId,
        at: DateTime<Utc>,
    ) -> Result<(), CaseStoreError> {
        (**self).set_next_general_sync_at(case_id, at).await
    }

    async fn record_sync_success(&self, case_id: CaseId, stamp: SyncStamp) -> Result<(), CaseStoreError> {
        (**self).record_sync_success(case_id, stamp).await
    }
}
