// SPDX-License-Identifier: Apache-2.0

//! Outbound token-bucket rate limiter, shared by every upload.
//!
//! Two buckets, bytes/sec and requests/sec, each holding at most one
//! second of budget. Accounting is atomic: concurrent acquirers race on
//! compare-and-swap loops over live counters, never on per-call
//! snapshots, so the configured rate holds across all uploads combined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitSettings;

/// How long an acquirer sleeps between refill checks when out of budget.
const ACQUIRE_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Outbound payload bytes per second; 0 disables the byte bucket
    pub bytes_per_sec: u64,
    /// Upload requests per second; 0 disables the request bucket
    pub requests_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bytes_per_sec: 1024 * 1024,
            requests_per_sec: 100,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            bytes_per_sec: settings.bytes_per_sec,
            requests_per_sec: settings.requests_per_sec,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    start: Instant,
    byte_tokens: AtomicU64,
    request_tokens: AtomicU64,
    last_refill_micros: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            byte_tokens: AtomicU64::new(config.bytes_per_sec),
            request_tokens: AtomicU64::new(config.requests_per_sec as u64),
            last_refill_micros: AtomicU64::new(0),
            start: Instant::now(),
            config,
        }
    }

    /// Wait until one request token and `bytes` byte tokens are available,
    /// then consume them. A payload larger than one second of byte budget
    /// is charged the full bucket rather than blocking forever.
    pub async fn acquire(&self, bytes: u64) {
        let need = if self.config.bytes_per_sec == 0 {
            0
        } else {
            bytes.min(self.config.bytes_per_sec)
        };

        loop {
            self.refill();
            if self.try_take(need) {
                return;
            }
            tokio::time::sleep(ACQUIRE_WAIT).await;
        }
    }

    /// Credit both buckets for the time elapsed since the previous refill.
    /// The swap hands each concurrent caller a disjoint interval, so
    /// elapsed time is never credited twice.
    fn refill(&self) {
        let now_micros = self.start.elapsed().as_micros() as u64;
        let last = self.last_refill_micros.swap(now_micros, Ordering::AcqRel);
        let delta = now_micros.saturating_sub(last);
        if delta == 0 {
            return;
        }

        if self.config.bytes_per_sec > 0 {
            let add = self.config.bytes_per_sec.saturating_mul(delta) / 1_000_000;
            let cap = self.config.bytes_per_sec;
            let _ = self
                .byte_tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                    Some(t.saturating_add(add).min(cap))
                });
        }

        if self.config.requests_per_sec > 0 {
            let add = (self.config.requests_per_sec as u64).saturating_mul(delta) / 1_000_000;
            let cap = self.config.requests_per_sec as u64;
            let _ = self
                .request_tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                    Some(t.saturating_add(add).min(cap))
                });
        }
    }

    fn try_take(&self, bytes: u64) -> bool {
        let take_request = self.config.requests_per_sec > 0;

        if take_request
            && self
                .request_tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
                .is_err()
        {
            return false;
        }

        if bytes > 0
            && self
                .byte_tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(bytes))
                .is_err()
        {
            // Give the request token back; the caller retries both.
            if take_request {
                self.request_tokens.fetch_add(1, Ordering::AcqRel);
            }
            return false;
        }

        true
    }
}
