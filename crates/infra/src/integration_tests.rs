//! End-to-end runs of the scheduler and dispatcher over the in-memory stores.
//!
//! Verifies:
//! - A detected progress change cascades into exactly one general sync
//! - A renewed session token is not queued for renewal again
//! - Scheduled progress jobs are drained and the case is rescheduled
//! - Policy failures are terminal on the first attempt
//! - The per-minute cap is shared by every worker of an invocation

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use casesync_core::{CaseId, SyncType, TokenId, TriggerSource};

    use crate::cases::{CaseRecord, CaseRepository, InMemoryCaseRepository};
    use crate::config::{JitterRange, StaticSettings, SyncSettings};
    use crate::external::{
        CourtSyncClient, CourtSyncRequest, CourtSyncResponse, ExternalCallError, RenewalError,
        RenewedToken, TokenRenewalService,
    };
    use crate::jobs::{
        CaseSyncPayload, DedupKey, Dispatcher, InMemoryJobStore, JobPayload, JobStatus, JobStore,
        NewSyncJob,
    };
    use crate::sync::{
        CascadeScheduler, CaseSyncHandler, CronSecret, InMemorySyncLog, LogAction, LogStatus,
        LogWriter, RenewalHandler, Scheduler,
    };
    use crate::tokens::{
        InMemorySessionTokenRepository, SessionToken, SessionTokenRepository, SessionTokenStatus,
    };

    const SECRET: &str = "integration-secret";

    /// Court stub reporting a progress change on every progress sync.
    #[derive(Default)]
    struct ChangingCourt {
        requests: Mutex<Vec<CourtSyncRequest>>,
    }

    impl ChangingCourt {
        fn requests(&self) -> Vec<CourtSyncRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CourtSyncClient for ChangingCourt {
        async fn sync_case(&self, request: &CourtSyncRequest) -> Result<CourtSyncResponse, ExternalCallError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(match request.sync_type {
                SyncType::Progress => CourtSyncResponse::changed(),
                _ => CourtSyncResponse::unchanged(),
            })
        }
    }

    struct AlwaysRenews;

    #[async_trait]
    impl TokenRenewalService for AlwaysRenews {
        async fn renew(&self, token_id: TokenId) -> Result<RenewedToken, RenewalError> {
            Ok(RenewedToken {
                token_id,
                expires_at: Some(Utc::now() + Duration::days(30)),
            })
        }
    }

    struct Engine {
        jobs: Arc<InMemoryJobStore>,
        cases: Arc<InMemoryCaseRepository>,
        tokens: Arc<InMemorySessionTokenRepository>,
        court: Arc<ChangingCourt>,
        log: Arc<InMemorySyncLog>,
        dispatcher: Dispatcher,
        scheduler: Scheduler,
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            request_jitter_ms: JitterRange::none(),
            backoff_jitter_ms: JitterRange::none(),
            rate_limit_per_minute: None,
            ..Default::default()
        }
    }

    fn engine(settings: SyncSettings) -> Engine {
        let jobs = InMemoryJobStore::arc();
        let cases = InMemoryCaseRepository::arc();
        let tokens = Arc::new(InMemorySessionTokenRepository::new());
        let court = Arc::new(ChangingCourt::default());
        let log = Arc::new(InMemorySyncLog::new());
        let provider = Arc::new(StaticSettings(settings));

        let dispatcher = Dispatcher::new(
            CronSecret::new(SECRET),
            provider.clone(),
            jobs.clone(),
            CaseSyncHandler::new(cases.clone(), court.clone()),
            RenewalHandler::new(Arc::new(AlwaysRenews), tokens.clone()),
            CascadeScheduler::new(jobs.clone(), cases.clone()),
            LogWriter::new(log.clone()),
        );
        let scheduler = Scheduler::new(
            CronSecret::new(SECRET),
            provider,
            jobs.clone(),
            cases.clone(),
            tokens.clone(),
            LogWriter::new(log.clone()),
        );

        Engine {
            jobs,
            cases,
            tokens,
            court,
            log,
            dispatcher,
            scheduler,
        }
    }

    fn linked_case() -> CaseRecord {
        CaseRecord::new(CaseId::new(), "2023나56789").linked("enc-token", "wmonid-1")
    }

    #[tokio::test]
    async fn progress_change_cascades_into_one_general_sync() {
        let e = engine(settings());
        let mut case = linked_case();
        case.last_general_sync_at = Some(Utc::now() - Duration::hours(48));
        e.cases.insert(case.clone()).unwrap();
        e.jobs
            .enqueue(NewSyncJob::case_sync(case.id, SyncType::Progress, CaseSyncPayload::auto(), Utc::now()).unwrap())
            .await
            .unwrap();

        let started = Utc::now();
        let report = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let general: Vec<_> = e
            .jobs
            .recent(10)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.sync_type() == SyncType::General)
            .collect();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].status, JobStatus::Queued);
        assert_eq!(general[0].priority, 1);
        assert_eq!(general[0].trigger_source(), TriggerSource::Auto);
        assert_eq!(general[0].case_id, Some(case.id));

        let stored = e.cases.snapshot(case.id).unwrap();
        let next = stored.next_general_sync_at.unwrap();
        assert!(next >= started + Duration::hours(24));
        assert!(next <= Utc::now() + Duration::hours(24));
        assert!(stored.in_cooldown(Utc::now()));

        // Draining the cascaded job stamps the general sync without cascading again.
        let second = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(second.succeeded, 1);
        assert!(e.cases.snapshot(case.id).unwrap().last_general_sync_at.unwrap() >= started);
        assert_eq!(e.jobs.stats().await.unwrap().queued, 0);
        assert_eq!(e.court.requests().len(), 2);

        let actions: Vec<_> = e.log.entries().iter().map(|l| l.action).collect();
        assert_eq!(actions, vec![LogAction::SyncProgress, LogAction::SyncGeneral]);
    }

    #[tokio::test]
    async fn never_general_synced_case_cascades_on_first_progress_change() {
        let e = engine(settings());
        let case = linked_case();
        assert!(case.last_general_sync_at.is_none());
        e.cases.insert(case.clone()).unwrap();
        e.jobs
            .enqueue(NewSyncJob::case_sync(case.id, SyncType::Progress, CaseSyncPayload::auto(), Utc::now()).unwrap())
            .await
            .unwrap();

        let report = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let queued: Vec<_> = e
            .jobs
            .recent(10)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].sync_type(), SyncType::General);
        assert_eq!(queued[0].priority, 1);
        assert_eq!(queued[0].case_id, Some(case.id));
        let JobPayload::General(payload) = &queued[0].payload else {
            panic!("expected a general payload, got {:?}", queued[0].payload);
        };
        assert_eq!(payload.trigger_source, TriggerSource::Auto);
        assert!(e.cases.snapshot(case.id).unwrap().next_general_sync_at.is_some());
    }

    #[tokio::test]
    async fn recent_general_sync_suppresses_the_cascade() {
        let e = engine(settings());
        let mut case = linked_case();
        case.last_general_sync_at = Some(Utc::now() - Duration::hours(2));
        e.cases.insert(case.clone()).unwrap();
        e.jobs
            .enqueue(NewSyncJob::case_sync(case.id, SyncType::Progress, CaseSyncPayload::auto(), Utc::now()).unwrap())
            .await
            .unwrap();

        e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(e.jobs.stats().await.unwrap().queued, 0);
        assert!(e.cases.snapshot(case.id).unwrap().next_general_sync_at.is_none());
    }

    #[tokio::test]
    async fn manual_progress_change_does_not_cascade() {
        let e = engine(settings());
        let case = linked_case();
        e.cases.insert(case.clone()).unwrap();
        e.jobs
            .enqueue(NewSyncJob::case_sync(case.id, SyncType::Progress, CaseSyncPayload::manual(), Utc::now()).unwrap())
            .await
            .unwrap();

        e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(e.jobs.stats().await.unwrap().queued, 0);
        assert!(e.court.requests()[0].force_refresh);
    }

    #[tokio::test]
    async fn job_without_case_reference_fails_on_first_attempt() {
        let e = engine(settings());
        let now = Utc::now();
        let id = e
            .jobs
            .enqueue(NewSyncJob {
                tenant_id: None,
                case_id: None,
                payload: JobPayload::Progress(CaseSyncPayload::auto()),
                priority: 0,
                scheduled_at: now,
                dedup_key: DedupKey::new("progress:orphan"),
            })
            .await
            .unwrap()
            .job_id();

        let report = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);

        let job = e.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("missing case reference"));
        assert!(e.court.requests().is_empty());
    }

    #[tokio::test]
    async fn unlinked_case_fails_with_missing_link() {
        let e = engine(settings());
        let case = CaseRecord::new(CaseId::new(), "2023가소1");
        e.cases.insert(case.clone()).unwrap();
        let id = e
            .jobs
            .enqueue(NewSyncJob::case_sync(case.id, SyncType::Progress, CaseSyncPayload::auto(), Utc::now()).unwrap())
            .await
            .unwrap()
            .job_id();

        e.dispatcher.run(Some(SECRET)).await.unwrap();
        let job = e.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("missing link"));
        assert_eq!(e.log.entries()[0].status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn cooldown_skips_auto_progress_sync() {
        let e = engine(settings());
        let mut case = linked_case();
        case.cooldown_until = Some(Utc::now() + Duration::minutes(40));
        e.cases.insert(case.clone()).unwrap();
        let id = e
            .jobs
            .enqueue(NewSyncJob::case_sync(case.id, SyncType::Progress, CaseSyncPayload::auto(), Utc::now()).unwrap())
            .await
            .unwrap()
            .job_id();

        let report = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.skipped, 1);
        let job = e.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Skipped);
        assert!(job.last_error.unwrap().starts_with("cooldown active"));
        assert!(e.court.requests().is_empty());
    }

    #[tokio::test]
    async fn scheduled_progress_jobs_are_drained_and_rescheduled() {
        let e = engine(settings());
        let mut due = linked_case();
        due.next_progress_sync_at = Some(Utc::now() - Duration::minutes(5));
        let fresh = linked_case();
        e.cases.insert(due.clone()).unwrap();
        e.cases.insert(fresh.clone()).unwrap();

        let now = Utc::now();
        let scheduled = e.scheduler.run(Some(SECRET)).await.unwrap();
        assert_eq!(scheduled.scheduled_jobs, 1);
        assert_eq!(scheduled.initialized_cases, 1);
        assert!(e.cases.snapshot(fresh.id).unwrap().next_progress_sync_at.unwrap() > now);
        assert!(e.cases.snapshot(due.id).unwrap().next_progress_sync_at.unwrap() > now);

        // A second pass in the same hour finds nothing due.
        let again = e.scheduler.run(Some(SECRET)).await.unwrap();
        assert_eq!(again.scheduled_jobs, 0);

        let report = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(e.court.requests()[0].legal_case_id, due.id);
        assert!(!e.court.requests()[0].force_refresh);
    }

    #[tokio::test]
    async fn expiring_tokens_are_renewed_through_the_queue() {
        let e = engine(settings());
        let token = SessionToken {
            id: TokenId::new(),
            status: SessionTokenStatus::Active,
            expires_at: Utc::now() + Duration::days(1),
        };
        e.tokens.insert(token.clone()).unwrap();

        let scheduled = e.scheduler.run(Some(SECRET)).await.unwrap();
        assert_eq!(scheduled.token_jobs, 1);

        let report = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let renewal = e
            .log
            .entries()
            .into_iter()
            .find(|l| l.action == LogAction::TokenRenewal)
            .unwrap();
        assert_eq!(renewal.status, LogStatus::Success);
    }

    #[tokio::test]
    async fn renewed_token_is_not_queued_again() {
        let e = engine(settings());
        let now = Utc::now();
        let token = SessionToken {
            id: TokenId::new(),
            status: SessionTokenStatus::Active,
            expires_at: now + Duration::hours(24),
        };
        e.tokens.insert(token.clone()).unwrap();

        let mut renewals = 0;
        for hour in 0..5 {
            let scheduled = e.scheduler.run_authorized(now + Duration::hours(hour)).await.unwrap();
            renewals += scheduled.token_jobs;
            e.dispatcher.run(Some(SECRET)).await.unwrap();
        }

        assert_eq!(renewals, 1);
        let horizon = now + Duration::days(3);
        assert!(e.tokens.expiring(horizon).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_shared_across_workers() {
        let e = engine(SyncSettings {
            rate_limit_per_minute: Some(2),
            worker_concurrency: 3,
            ..settings()
        });
        for _ in 0..3 {
            let case = linked_case();
            e.cases.insert(case.clone()).unwrap();
            e.jobs
                .enqueue(NewSyncJob::case_sync(case.id, SyncType::General, CaseSyncPayload::auto(), Utc::now()).unwrap())
                .await
                .unwrap();
        }

        let started = tokio::time::Instant::now();
        let report = e.dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert!(started.elapsed() >= std::time::Duration::from_secs(60));
    }

    #[tokio::test]
    async fn stamping_failure_does_not_fail_the_job() {
        // The case disappears between the sync and the stamp; the job still succeeds.
        struct VanishingCases(Arc<InMemoryCaseRepository>);

        #[async_trait]
        impl CaseRepository for VanishingCases {
            async fn find(&self, case_id: CaseId) -> Result<Option<CaseRecord>, crate::cases::CaseStoreError> {
                self.0.find(case_id).await
            }
            async fn progress_candidates(
                &self,
                now: chrono::DateTime<Utc>,
                limit: usize,
            ) -> Result<Vec<CaseRecord>, crate::cases::CaseStoreError> {
                self.0.progress_candidates(now, limit).await
            }
            async fn set_next_progress_sync_at(
                &self,
                case_id: CaseId,
                _at: chrono::DateTime<Utc>,
            ) -> Result<(), crate::cases::CaseStoreError> {
                Err(crate::cases::CaseStoreError::NotFound(case_id))
            }
            async fn set_next_general_sync_at(
                &self,
                case_id: CaseId,
                _at: chrono::DateTime<Utc>,
            ) -> Result<(), crate::cases::CaseStoreError> {
                Err(crate::cases::CaseStoreError::NotFound(case_id))
            }
            async fn record_sync_success(
                &self,
                case_id: CaseId,
                _stamp: crate::cases::SyncStamp,
            ) -> Result<(), crate::cases::CaseStoreError> {
                Err(crate::cases::CaseStoreError::NotFound(case_id))
            }
        }

        let inner = InMemoryCaseRepository::arc();
        let case = linked_case();
        inner.insert(case.clone()).unwrap();
        let cases: Arc<dyn CaseRepository> = Arc::new(VanishingCases(inner));
        let jobs = InMemoryJobStore::arc();
        let log = Arc::new(InMemorySyncLog::new());
        let dispatcher = Dispatcher::new(
            CronSecret::new(SECRET),
            Arc::new(StaticSettings(settings())),
            jobs.clone(),
            CaseSyncHandler::new(cases.clone(), Arc::new(ChangingCourt::default())),
            RenewalHandler::new(Arc::new(AlwaysRenews), Arc::new(InMemorySessionTokenRepository::new())),
            CascadeScheduler::new(jobs.clone(), cases),
            LogWriter::new(log.clone()),
        );
        let id = jobs
            .enqueue(NewSyncJob::case_sync(case.id, SyncType::Progress, CaseSyncPayload::auto(), Utc::now()).unwrap())
            .await
            .unwrap()
            .job_id();

        let report = dispatcher.run(Some(SECRET)).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(jobs.get(id).await.unwrap().unwrap().status, JobStatus::Success);
        assert_eq!(log.entries()[0].cases_synced, 1);
    }
}
