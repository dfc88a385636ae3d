//! Service wiring: stores, external clients, dispatcher and scheduler.

use std::sync::Arc;

use anyhow::Context;

use casesync_infra::{
    cases::{CaseRepository, InMemoryCaseRepository, PostgresCaseRepository},
    config::{PostgresSettingsProvider, SettingsProvider, StaticSettings},
    db,
    external::{CourtSyncClient, HttpCourtSyncClient, HttpTokenRenewalService, TokenRenewalService},
    jobs::{Dispatcher, InMemoryJobStore, JobStore, PostgresJobStore},
    sync::{
        CascadeScheduler, CaseSyncHandler, CronSecret, InMemorySyncLog, LogWriter, PostgresSyncLog,
        RenewalHandler, Scheduler, SyncLogSink,
    },
    tokens::{InMemorySessionTokenRepository, PostgresSessionTokenRepository, SessionTokenRepository},
};

use crate::config::ServerConfig;

/// Everything the routes need, shared behind an `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub secret: CronSecret,
    pub settings: Arc<dyn SettingsProvider>,
    pub jobs: Arc<dyn JobStore>,
    pub dispatcher: Dispatcher,
    pub scheduler: Scheduler,
}

/// Storage and external collaborators the engine runs against.
pub struct Backends {
    pub settings: Arc<dyn SettingsProvider>,
    pub jobs: Arc<dyn JobStore>,
    pub cases: Arc<dyn CaseRepository>,
    pub tokens: Arc<dyn SessionTokenRepository>,
    pub log: Arc<dyn SyncLogSink>,
    pub court: Arc<dyn CourtSyncClient>,
    pub renewal: Arc<dyn TokenRenewalService>,
}

impl AppServices {
    pub fn new(secret: CronSecret, backends: Backends) -> Self {
        let log = LogWriter::new(backends.log);
        let dispatcher = Dispatcher::new(
            secret.clone(),
            backends.settings.clone(),
            backends.jobs.clone(),
            CaseSyncHandler::new(backends.cases.clone(), backends.court),
            RenewalHandler::new(backends.renewal, backends.tokens.clone()),
            CascadeScheduler::new(backends.jobs.clone(), backends.cases.clone()),
            log.clone(),
        );
        let scheduler = Scheduler::new(
            secret.clone(),
            backends.settings.clone(),
            backends.jobs.clone(),
            backends.cases,
            backends.tokens,
            log,
        );

        Self {
            secret,
            settings: backends.settings,
            jobs: backends.jobs,
            dispatcher,
            scheduler,
        }
    }
}

impl core::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppServices").finish_non_exhaustive()
    }
}

/// In-memory services when `DATABASE_URL` is unset, Postgres otherwise.
pub async fn build_services(config: &ServerConfig) -> anyhow::Result<AppServices> {
    let court: Arc<dyn CourtSyncClient> = Arc::new(HttpCourtSyncClient::new(&config.court_sync_url));
    let renewal: Arc<dyn TokenRenewalService> =
        Arc::new(HttpTokenRenewalService::new(&config.token_renewal_url));

    let backends = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url, config.db_max_connections)
                .await
                .context("failed to connect to Postgres")?;
            db::run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            tracing::info!("using Postgres-backed stores");

            if config.sync_settings.is_some() {
                tracing::warn!("SYNC_SETTINGS_JSON is ignored when DATABASE_URL is set");
            }

            Backends {
                settings: Arc::new(PostgresSettingsProvider::new(pool.clone())),
                jobs: Arc::new(PostgresJobStore::new(pool.clone())),
                cases: Arc::new(PostgresCaseRepository::new(pool.clone())),
                tokens: Arc::new(PostgresSessionTokenRepository::new(pool.clone())),
                log: Arc::new(PostgresSyncLog::new(pool)),
                court,
                renewal,
            }
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            in_memory_backends(config, court, renewal)
        }
    };

    Ok(AppServices::new(CronSecret::new(&config.cron_secret), backends))
}

pub fn in_memory_backends(
    config: &ServerConfig,
    court: Arc<dyn CourtSyncClient>,
    renewal: Arc<dyn TokenRenewalService>,
) -> Backends {
    Backends {
        settings: Arc::new(StaticSettings(config.sync_settings.clone().unwrap_or_default())),
        jobs: InMemoryJobStore::arc(),
        cases: InMemoryCaseRepository::arc(),
        tokens: Arc::new(InMemorySessionTokenRepository::new()),
        log: Arc::new(InMemorySyncLog::new()),
        court,
        renewal,
    }
}
