// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Connect retry policy.
//!
//! `backoff(n) = min(n * step + random(0..=jitter), cap)`. Linear growth with
//! jitter keeps consumers that lost the same broker from reconnecting in
//! lockstep.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often and how patiently a resource is reconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retry_connect: u32,
    step: Duration,
    jitter: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retry_connect: 5,
            step: Duration::from_secs(5),
            jitter: Duration::from_secs(5),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry_connect: u32) -> RetryPolicy {
        RetryPolicy {
            max_retry_connect,
            ..Default::default()
        }
    }

    /// Single attempt, no sleeping. Used on the publish path.
    pub fn fail_fast(self) -> RetryPolicy {
        RetryPolicy {
            max_retry_connect: 0,
            ..self
        }
    }

    pub fn step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn max_retry_connect(&self) -> u32 {
        self.max_retry_connect
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_retry_connect > 0
    }

    pub fn cap_duration(&self) -> Duration {
        self.cap
    }

    /// Sleep before the `attempt`-th retry.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };

        self.step
            .saturating_mul(attempt)
            .saturating_add(Duration::from_millis(jitter))
            .min(self.cap)
    }
}

/// Sleeps for `delay` unless `token` is cancelled first.
///
/// Returns `false` when the sleep was interrupted.
pub async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
