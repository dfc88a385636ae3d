//! Sync settings: the tunables every engine component reads.
//!
//! Settings are loaded once per dispatcher/scheduler invocation through a
//! [`SettingsProvider`] and passed down explicitly; nothing in the engine reads
//! process-global state.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

/// Key of the settings row in `sync_settings`.
pub const SETTINGS_KEY: &str = "court_sync";

/// Upper bound on any settings-derived scheduling span (ten years).
pub const MAX_SCHEDULE_HOURS: i64 = 10 * 365 * 24;

/// Inclusive millisecond range a random delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min: u64,
    pub max: u64,
}

impl JitterRange {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// Zero-width range (no jitter). Handy in tests.
    pub const fn none() -> Self {
        Self { min: 0, max: 0 }
    }

    /// Draw a uniform value from `[min, max]`; a degenerate range yields `min`.
    pub fn sample_ms(&self) -> u64 {
        if self.max <= self.min {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }

    pub fn sample(&self) -> Duration {
        Duration::from_millis(self.sample_ms())
    }
}

/// Which cases the periodic scheduler considers active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActiveCaseRule {
    /// When non-empty, only these case statuses are scheduled.
    pub status_allow_list: Vec<String>,
    /// Consulted only when the allow list is empty.
    pub status_block_list: Vec<String>,
    pub exclude_final_result: bool,
    /// Require both court-link tokens before scheduling.
    pub require_linked: bool,
}

impl Default for ActiveCaseRule {
    fn default() -> Self {
        Self {
            status_allow_list: Vec::new(),
            status_block_list: Vec::new(),
            exclude_final_result: true,
            require_linked: false,
        }
    }
}

impl ActiveCaseRule {
    pub fn admits_status(&self, status: Option<&str>) -> bool {
        let status = status.unwrap_or("");
        if !self.status_allow_list.is_empty() {
            return self.status_allow_list.iter().any(|s| s == status);
        }
        !self.status_block_list.iter().any(|s| s == status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TokenRenewalSettings {
    pub auto_rotate_enabled: bool,
    /// Tokens expiring within this many days are queued for renewal.
    pub renewal_before_days: u32,
}

impl Default for TokenRenewalSettings {
    fn default() -> Self {
        Self {
            auto_rotate_enabled: true,
            renewal_before_days: 3,
        }
    }
}

/// Engine tunables.
///
/// Every field has a default so a partially-populated settings document still
/// yields a usable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Global kill switch for both the dispatcher and the scheduler.
    pub auto_sync_enabled: bool,
    /// Maximum jobs claimed per dispatcher invocation.
    pub worker_batch_size: u32,
    /// Concurrent workers per dispatcher invocation.
    pub worker_concurrency: u32,
    /// Aggregate external calls allowed per rolling minute; `None`/0 = unlimited.
    pub rate_limit_per_minute: Option<u32>,
    /// Pause before every external case-sync call.
    pub request_jitter_ms: JitterRange,
    /// Jitter added to retry backoff.
    pub backoff_jitter_ms: JitterRange,
    /// Minimum spacing between cascaded general syncs for one case.
    pub general_backoff_hours: u32,
    pub auto_cooldown_minutes: u32,
    pub manual_cooldown_minutes: u32,
    pub progress_interval_hours: f64,
    pub progress_jitter_minutes: u32,
    pub scheduler_batch_size: u32,
    pub active_case_rule: ActiveCaseRule,
    #[serde(alias = "wmonid")]
    pub token_renewal: TokenRenewalSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            worker_batch_size: 10,
            worker_concurrency: 2,
            rate_limit_per_minute: Some(30),
            request_jitter_ms: JitterRange::new(500, 1500),
            backoff_jitter_ms: JitterRange::new(5_000, 15_000),
            general_backoff_hours: 24,
            auto_cooldown_minutes: 60,
            manual_cooldown_minutes: 5,
            progress_interval_hours: 6.0,
            progress_jitter_minutes: 30,
            scheduler_batch_size: 50,
            active_case_rule: ActiveCaseRule::default(),
            token_renewal: TokenRenewalSettings::default(),
        }
    }
}

impl SyncSettings {
    /// Batch size, never below one.
    pub fn batch_size(&self) -> usize {
        self.worker_batch_size.max(1) as usize
    }

    /// Worker count, never below one.
    pub fn concurrency(&self) -> usize {
        self.worker_concurrency.max(1) as usize
    }

    /// Effective per-minute cap; zero is treated as "no cap".
    pub fn rate_cap(&self) -> Option<u32> {
        self.rate_limit_per_minute.filter(|cap| *cap > 0)
    }

    pub fn general_backoff(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.general_backoff_hours).min(MAX_SCHEDULE_HOURS))
    }

    /// Progress interval at millisecond precision, within `[0, MAX_SCHEDULE_HOURS]`.
    pub fn progress_interval(&self) -> chrono::Duration {
        let hours = self.progress_interval_hours.clamp(0.0, MAX_SCHEDULE_HOURS as f64);
        chrono::Duration::milliseconds((hours * 3_600_000.0).round() as i64)
    }

    /// Progress interval rounded to whole minutes, never below one.
    pub fn progress_interval_minutes(&self) -> i64 {
        self.progress_interval().num_minutes().max(1)
    }

    /// How far ahead token expiry is checked.
    pub fn renewal_horizon(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.token_renewal.renewal_before_days).min(MAX_SCHEDULE_HOURS / 24))
    }

    /// Parse a settings document, filling absent fields with defaults.
    pub fn from_json(value: serde_json::Value) -> Result<Self, SettingsError> {
        serde_json::from_value(value).map_err(|e| SettingsError::Invalid(e.to_string()))
    }
}

/// Settings load failure.
#[derive(Debug, Clone, Error)]
pub enum SettingsError {
    #[error("settings storage error: {0}")]
    Storage(String),
    #[error("invalid settings document: {0}")]
    Invalid(String),
}

/// Source of [`SyncSettings`], consulted once per invocation.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn load(&self) -> Result<SyncSettings, SettingsError>;
}

/// Fixed settings (tests, dev, env-configured deployments).
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub SyncSettings);

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn load(&self) -> Result<SyncSettings, SettingsError> {
        Ok(self.0.clone())
    }
}

/// Settings stored as a JSON document in `sync_settings`.
///
/// A missing row yields the defaults.
#[derive(Debug, Clone)]
pub struct PostgresSettingsProvider {
    pool: PgPool,
}

impl PostgresSettingsProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsProvider for PostgresSettingsProvider {
    #[tracing::instrument(skip(self), err)]
    async fn load(&self) -> Result<SyncSettings, SettingsError> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM sync_settings WHERE key = $1")
                .bind(SETTINGS_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SettingsError::Storage(e.to_string()))?;

        match value {
            Some(doc) => SyncSettings::from_json(doc),
            None => Ok(SyncSettings::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let settings = SyncSettings::from_json(serde_json::json!({
            "autoSyncEnabled": false,
            "workerConcurrency": 4,
            "requestJitterMs": { "min": 0, "max": 0 },
        }))
        .unwrap();

        assert!(!settings.auto_sync_enabled);
        assert_eq!(settings.worker_concurrency, 4);
        assert_eq!(settings.request_jitter_ms, JitterRange::none());
        assert_eq!(settings.worker_batch_size, 10);
        assert_eq!(settings.general_backoff_hours, 24);
        assert_eq!(settings.backoff_jitter_ms, JitterRange::new(5_000, 15_000));
    }

    #[test]
    fn legacy_wmonid_block_is_accepted() {
        let settings = SyncSettings::from_json(serde_json::json!({
            "wmonid": { "autoRotateEnabled": false, "renewalBeforeDays": 7 }
        }))
        .unwrap();
        assert!(!settings.token_renewal.auto_rotate_enabled);
        assert_eq!(settings.token_renewal.renewal_before_days, 7);
    }

    #[test]
    fn zero_values_are_clamped() {
        let settings = SyncSettings {
            worker_batch_size: 0,
            worker_concurrency: 0,
            rate_limit_per_minute: Some(0),
            progress_interval_hours: 0.0,
            ..Default::default()
        };
        assert_eq!(settings.batch_size(), 1);
        assert_eq!(settings.concurrency(), 1);
        assert_eq!(settings.rate_cap(), None);
        assert_eq!(settings.progress_interval_minutes(), 1);
    }

    #[test]
    fn oversized_spans_are_capped() {
        let settings = SyncSettings {
            general_backoff_hours: u32::MAX,
            progress_interval_hours: f64::MAX,
            token_renewal: TokenRenewalSettings {
                renewal_before_days: u32::MAX,
                ..Default::default()
            },
            ..Default::default()
        };
        let cap = chrono::Duration::hours(MAX_SCHEDULE_HOURS);
        assert_eq!(settings.general_backoff(), cap);
        assert_eq!(settings.progress_interval(), cap);
        assert_eq!(settings.renewal_horizon(), cap);

        let nan = SyncSettings {
            progress_interval_hours: f64::NAN,
            ..Default::default()
        };
        assert_eq!(nan.progress_interval_minutes(), 1);
    }

    #[test]
    fn jitter_sample_stays_in_range() {
        let range = JitterRange::new(5, 9);
        for _ in 0..200 {
            let v = range.sample_ms();
            assert!((5..=9).contains(&v));
        }
        assert_eq!(JitterRange::new(7, 3).sample_ms(), 7);
    }

    #[test]
    fn active_rule_prefers_allow_list() {
        let rule = ActiveCaseRule {
            status_allow_list: vec!["open".into()],
            status_block_list: vec!["open".into()],
            ..Default::default()
        };
        assert!(rule.admits_status(Some("open")));
        assert!(!rule.admits_status(Some("closed")));

        let rule = ActiveCaseRule {
            status_block_list: vec!["closed".into()],
            ..Default::default()
        };
        assert!(rule.admits_status(Some("open")));
        assert!(rule.admits_status(None));
        assert!(!rule.admits_status(Some("closed")));
    }
}
