//! Sync vocabulary shared by jobs, cases, and the external client.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Kind of synchronization a job performs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Lightweight progress check (hearings, docket entries).
    Progress,
    /// Broader case-detail sync.
    General,
    /// Full re-link and sync; required when the case has no court link.
    Full,
    /// Renewal of a court session token (WMONID). Not tied to a case.
    TokenRenewal,
}

impl SyncType {
    pub const ALL: [SyncType; 4] = [
        SyncType::Progress,
        SyncType::General,
        SyncType::Full,
        SyncType::TokenRenewal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Progress => "progress",
            SyncType::General => "general",
            SyncType::Full => "full",
            SyncType::TokenRenewal => "token_renewal",
        }
    }
}

impl core::fmt::Display for SyncType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(SyncType::Progress),
            "general" => Ok(SyncType::General),
            "full" => Ok(SyncType::Full),
            "token_renewal" | "wmonid_renewal" => Ok(SyncType::TokenRenewal),
            other => Err(DomainError::unknown_variant("sync type", other)),
        }
    }
}

/// Who asked for a sync.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// User-initiated; bypasses cooldown.
    Manual,
    /// Scheduler-initiated.
    Auto,
}

impl TriggerSource {
    /// Priority threshold at or above which legacy rows are read as manual.
    pub const MANUAL_PRIORITY_THRESHOLD: i32 = 10;

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Auto => "auto",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, TriggerSource::Manual)
    }

    /// Infer the trigger source of a row that did not record one.
    pub fn from_priority(priority: i32) -> Self {
        if priority >= Self::MANUAL_PRIORITY_THRESHOLD {
            TriggerSource::Manual
        } else {
            TriggerSource::Auto
        }
    }

    /// Default priority for a newly enqueued job with this trigger source.
    pub fn default_priority(&self) -> i32 {
        match self {
            TriggerSource::Manual => Self::MANUAL_PRIORITY_THRESHOLD,
            TriggerSource::Auto => 0,
        }
    }
}

impl core::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerSource::Manual),
            "auto" => Ok(TriggerSource::Auto),
            other => Err(DomainError::unknown_variant("trigger source", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_type_parses_legacy_renewal_name() {
        assert_eq!("wmonid_renewal".parse::<SyncType>().unwrap(), SyncType::TokenRenewal);
        assert_eq!("token_renewal".parse::<SyncType>().unwrap(), SyncType::TokenRenewal);
        assert!("weekly".parse::<SyncType>().is_err());
    }

    #[test]
    fn trigger_source_falls_back_on_priority() {
        assert_eq!(TriggerSource::from_priority(10), TriggerSource::Manual);
        assert_eq!(TriggerSource::from_priority(42), TriggerSource::Manual);
        assert_eq!(TriggerSource::from_priority(9), TriggerSource::Auto);
        assert_eq!(TriggerSource::from_priority(0), TriggerSource::Auto);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&SyncType::TokenRenewal).unwrap();
        assert_eq!(json, "\"token_renewal\"");
        let src: TriggerSource = serde_json::from_str("\"manual\"").unwrap();
        assert!(src.is_manual());
    }
}
