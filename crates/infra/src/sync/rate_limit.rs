//! Sliding-window admission control for external calls.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::SyncSettings;

const WINDOW: Duration = Duration::from_secs(60);
const MARGIN: Duration = Duration::from_millis(25);

/// Caps call starts per trailing 60s window across every worker of one
/// dispatcher run.
///
/// Not persisted: each run builds its own limiter.
#[derive(Debug)]
pub struct RateLimiter {
    cap: Option<usize>,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `None` or zero means unlimited.
    pub fn new(cap_per_minute: Option<u32>) -> Self {
        Self {
            cap: cap_per_minute.filter(|c| *c > 0).map(|c| c as usize),
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.rate_cap())
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    /// Block until a call may start, then record it.
    pub async fn wait(&self) {
        let Some(cap) = self.cap else {
            return;
        };

        loop {
            let pause = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls.front().is_some_and(|t| now.duration_since(*t) >= WINDOW) {
                    calls.pop_front();
                }

                if calls.len() < cap {
                    calls.push_back(now);
                    return;
                }

                match calls.front() {
                    Some(oldest) => WINDOW.saturating_sub(now.duration_since(*oldest)) + MARGIN,
                    None => MARGIN,
                }
            };

            tracing::debug!(pause_ms = pause.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(pause).await;
        }
    }

    /// Calls recorded in the current window.
    #[cfg(test)]
    async fn in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls.iter().filter(|t| now.duration_since(**t) < WINDOW).count()
    }
}
