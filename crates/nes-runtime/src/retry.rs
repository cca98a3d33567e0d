// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::EngineConfig;
use crate::metrics::Metrics;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff for sink writes (spec §7 "Retry": initial 50 ms,
/// factor 2, cap 2 s, up to K attempts).
pub struct RetryPolicy {
    initial_backoff: Duration,
    backoff_cap: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_backoff: config.retry_initial_backoff,
            backoff_cap: config.retry_backoff_cap,
            max_attempts: config.sink_retry_attempts,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.backoff_cap)
    }

    /// Runs `op` until it succeeds or `max_attempts` is exhausted, sleeping with
    /// exponential backoff between attempts. Returns the last error on exhaustion.
    pub fn execute<T, E>(&self, metrics: &Metrics, mut op: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        let mut last_err = None;
        for attempt in 0..self.max_attempts.max(1) {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt > 0 {
                        metrics.sink_retry_attempts.inc();
                    }
                    warn!(attempt, "sink write failed, retrying");
                    last_err = Some(err);
                    if attempt + 1 < self.max_attempts {
                        std::thread::sleep(self.delay_for_attempt(attempt));
                    }
                }
            }
        }
        metrics.sink_write_failures.inc();
        Err(last_err.expect("loop runs at least once"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_metrics;
    use std::cell::Cell;

    #[test]
    fn succeeds_without_retry_on_first_try() {
        let policy = RetryPolicy::from_config(&EngineConfig::default());
        let metrics = test_metrics();
        let result: Result<i32, &str> = policy.execute(&metrics, |_| Ok(42));
        assert_eq!(result, Ok(42));
        assert_eq!(metrics.sink_retry_attempts.get(), 0);
    }

    #[test]
    fn retries_then_succeeds() {
        let mut config = EngineConfig::default();
        config.retry_initial_backoff = Duration::from_millis(1);
        config.sink_retry_attempts = 5;
        let policy = RetryPolicy::from_config(&config);
        let metrics = test_metrics();
        let calls = Cell::new(0);
        let result: Result<&str, &str> = policy.execute(&metrics, |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("transient")
            } else {
                Ok("ok")
            }
        });
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.get(), 3);
        assert_eq!(metrics.sink_retry_attempts.get(), 2);
    }

    #[test]
    fn exhausts_attempts_and_reports_failure() {
        let mut config = EngineConfig::default();
        config.retry_initial_backoff = Duration::from_millis(1);
        config.sink_retry_attempts = 3;
        let policy = RetryPolicy::from_config(&config);
        let metrics = test_metrics();
        let result: Result<i32, &str> = policy.execute(&metrics, |_| Err("permanent"));
        assert_eq!(result, Err("permanent"));
        assert_eq!(metrics.sink_write_failures.get(), 1);
    }
}
