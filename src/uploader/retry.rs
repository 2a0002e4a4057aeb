// SPDX-License-Identifier: Apache-2.0

//! Retry policy for uploads: exponential backoff with jitter and a hard
//! attempt cap. The numeric policy comes from configuration.

use std::time::Duration;

use crate::config::RetrySettings;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total send attempts allowed, first try included.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            max_attempts: settings.max_attempts,
        }
    }
}

/// Per-batch backoff state.
pub struct RetryState {
    config: RetryConfig,
    current_backoff: Duration,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
        }
    }

    /// Delay before the next attempt, or None once `attempts_made` has
    /// reached the cap and the batch must be dropped.
    pub fn next_delay(&mut self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.config.max_attempts {
            return None;
        }

        let backoff_ms = self.current_backoff.as_millis() as i64;

        let mut v = backoff_ms / 2;
        // avoid div by zero
        if v == 0 {
            v = 1;
        }

        // Exponential backoff with jitter
        let jitter = (rand::random::<i64>() % v) - (v / 2);
        let mut sleep_ms = backoff_ms + jitter;
        if sleep_ms < 1 {
            sleep_ms = 1;
        }

        // Increase backoff for the next retry, capped at max_backoff
        self.current_backoff = std::cmp::min(self.current_backoff * 2, self.config.max_backoff);

        Some(Duration::from_millis(sleep_ms as u64))
    }
}

/// Backend responses worth retrying: request timeout, rate limiting, and
/// server-side failures. Anything else non-2xx is a terminal rejection.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=504)
}
