//! Process configuration read from the environment (and `.env`).

use anyhow::Context;

use casesync_infra::config::SyncSettings;

const DEV_CRON_SECRET: &str = "dev-cron-secret";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cron_secret: String,
    /// Absent: run on in-memory stores.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub court_sync_url: String,
    pub token_renewal_url: String,
    /// Inline settings for in-memory mode; Postgres mode reads `sync_settings`.
    pub sync_settings: Option<SyncSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cron_secret: DEV_CRON_SECRET.to_string(),
            database_url: None,
            db_max_connections: 10,
            court_sync_url: "http://localhost:3000/api/admin/scourt/sync".to_string(),
            token_renewal_url: "http://localhost:3000/api/admin/scourt/wmonid/renew".to_string(),
            sync_settings: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let port = match env("PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid PORT: {raw}"))?,
            None => defaults.port,
        };
        let db_max_connections = match env("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid DATABASE_MAX_CONNECTIONS: {raw}"))?,
            None => defaults.db_max_connections,
        };
        let cron_secret = env("CRON_SECRET").unwrap_or_else(|| {
            tracing::warn!("CRON_SECRET not set; using insecure dev default");
            defaults.cron_secret.clone()
        });
        let sync_settings = match env("SYNC_SETTINGS_JSON") {
            Some(raw) => {
                let doc: serde_json::Value =
                    serde_json::from_str(&raw).context("SYNC_SETTINGS_JSON is not valid JSON")?;
                Some(SyncSettings::from_json(doc)?)
            }
            None => None,
        };

        Ok(Self {
            host: env("HOST").unwrap_or(defaults.host),
            port,
            cron_secret,
            database_url: env("DATABASE_URL"),
            db_max_connections,
            court_sync_url: env("COURT_SYNC_URL").unwrap_or(defaults.court_sync_url),
            token_renewal_url: env("TOKEN_RENEWAL_URL").unwrap_or(defaults.token_renewal_url),
            sync_settings,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Non-empty environment variable.
fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
