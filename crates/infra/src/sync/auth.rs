//! Shared-secret check for trigger endpoints.

use subtle::ConstantTimeEq;

/// Secret a caller must present to trigger a run.
#[derive(Clone)]
pub struct CronSecret(String);

impl CronSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Constant-time comparison; an absent or empty credential never matches.
    pub fn verify(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(p) if !p.is_empty() && !self.0.is_empty() => {
                self.0.as_bytes().ct_eq(p.as_bytes()).into()
            }
            _ => false,
        }
    }
}

impl core::fmt::Debug for CronSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("CronSecret(***)")
    }
}
