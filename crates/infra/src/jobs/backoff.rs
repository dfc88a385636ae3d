//! Retry delay calculation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{JitterRange, SyncSettings};

use super::types::DEFAULT_MAX_ATTEMPTS;

/// Exponential backoff with additive jitter.
///
/// The base delay for a job that has made `n` attempts is
/// `base_delay * 2^(min(n, max_exponent) - 1)`; attempts below one count as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a retryable failure becomes terminal.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Exponent cap; growth stops after this many attempts.
    pub max_exponent: u32,
    pub jitter: JitterRange,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(5 * 60),
            max_exponent: 6,
            jitter: JitterRange::new(5_000, 15_000),
        }
    }
}

impl RetryPolicy {
    /// Default policy using the configured backoff jitter.
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            jitter: settings.backoff_jitter_ms,
            ..Self::default()
        }
    }

    /// Deterministic part of the delay.
    pub fn base_delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.clamp(1, self.max_exponent.max(1)) - 1;
        self.base_delay.saturating_mul(1u32 << exponent.min(31))
    }

    /// Base delay plus a fresh jitter sample.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        self.base_delay_for_attempt(attempts) + self.jitter.sample()
    }

    /// Instant before which the job must not be claimed again.
    pub fn backoff_until(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether a job that has made `attempts` attempts may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn base_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_for_attempt(0), 5 * MINUTE);
        assert_eq!(policy.base_delay_for_attempt(1), 5 * MINUTE);
        assert_eq!(policy.base_delay_for_attempt(2), 10 * MINUTE);
        assert_eq!(policy.base_delay_for_attempt(3), 20 * MINUTE);
        assert_eq!(policy.base_delay_for_attempt(6), 160 * MINUTE);
        assert_eq!(policy.base_delay_for_attempt(7), 160 * MINUTE);
        assert_eq!(policy.base_delay_for_attempt(u32::MAX), 160 * MINUTE);
    }

    #[test]
    fn jitter_is_additive_and_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= 10 * MINUTE + Duration::from_millis(5_000));
            assert!(delay <= 10 * MINUTE + Duration::from_millis(15_000));
        }
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn backoff_until_is_in_the_future() {
        let policy = RetryPolicy {
            jitter: JitterRange::none(),
            ..RetryPolicy::default()
        };
        let now = Utc::now();
        assert_eq!(policy.backoff_until(1, now), now + chrono::Duration::minutes(5));
    }

    proptest! {
        #[test]
        fn base_delay_is_monotonic(a in 0u32..64, b in 0u32..64) {
            let policy = RetryPolicy::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(policy.base_delay_for_attempt(lo) <= policy.base_delay_for_attempt(hi));
        }

        #[test]
        fn sampled_delay_never_below_base(attempts in 0u32..16) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for_attempt(attempts) >= policy.base_delay_for_attempt(attempts));
        }
    }
}
