// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operational configuration of one engine instance (spec §6 "Environment").
///
/// All fields have sensible defaults; most deployments should only need to override
/// `worker_threads` for the machine they run on.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Number of worker OS threads. `0` means hardware concurrency.
    #[serde(default = "EngineConfig::default_worker_threads")]
    pub worker_threads: usize,

    /// Total bytes across all pooled segments.
    #[serde(default = "EngineConfig::default_buffer_pool_bytes")]
    pub buffer_pool_bytes: usize,

    /// Bytes per pooled segment.
    #[serde(default = "EngineConfig::default_buffer_size_bytes")]
    pub buffer_size_bytes: usize,

    /// Segments detached per worker into its `LocalBufferPool`.
    #[serde(default = "EngineConfig::default_local_pool_segments")]
    pub local_pool_segments: usize,

    /// Worker task-queue depth above which a source is asked to pause (spec §4.5
    /// "Back-pressure").
    #[serde(default = "EngineConfig::default_backpressure_high_watermark")]
    pub backpressure_high_watermark: usize,

    /// Maximum sink-write retry attempts before `ErrorState` (spec §7 "Retry").
    #[serde(default = "EngineConfig::default_sink_retry_attempts")]
    pub sink_retry_attempts: u32,

    /// Initial backoff delay for sink retries (spec §7: 50 ms, factor 2, cap 2 s).
    #[serde(default = "EngineConfig::default_retry_initial_backoff")]
    pub retry_initial_backoff: Duration,

    #[serde(default = "EngineConfig::default_retry_backoff_cap")]
    pub retry_backoff_cap: Duration,

    /// Stop timeout when no tasks of the query are in flight (spec §5).
    #[serde(default = "EngineConfig::default_stop_timeout_not_running")]
    pub stop_timeout_not_running: Duration,

    /// Stop timeout when the query still has in-flight tasks (spec §5).
    #[serde(default = "EngineConfig::default_stop_timeout_running")]
    pub stop_timeout_running: Duration,
}

impl EngineConfig {
    pub fn default_worker_threads() -> usize {
        0
    }

    pub fn default_buffer_pool_bytes() -> usize {
        64 * 1024 * 1024
    }

    pub fn default_buffer_size_bytes() -> usize {
        4096
    }

    pub fn default_local_pool_segments() -> usize {
        8
    }

    pub fn default_backpressure_high_watermark() -> usize {
        1024
    }

    pub fn default_sink_retry_attempts() -> u32 {
        5
    }

    pub fn default_retry_initial_backoff() -> Duration {
        Duration::from_millis(50)
    }

    pub fn default_retry_backoff_cap() -> Duration {
        Duration::from_secs(2)
    }

    pub fn default_stop_timeout_not_running() -> Duration {
        Duration::from_secs(60)
    }

    pub fn default_stop_timeout_running() -> Duration {
        Duration::from_secs(300)
    }

    /// Resolved worker-thread count: `worker_threads` if nonzero, else the detected
    /// hardware concurrency (spec §6 `NES_WORKER_THREADS`).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.worker_threads
        }
    }

    /// Reads overrides from the environment variables named in spec §6, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("NES_WORKER_THREADS") {
            if let Ok(parsed) = v.parse() {
                config.worker_threads = parsed;
            }
        }
        if let Ok(v) = std::env::var("NES_BUFFER_POOL_BYTES") {
            if let Ok(parsed) = v.parse() {
                config.buffer_pool_bytes = parsed;
            }
        }
        if let Ok(v) = std::env::var("NES_BUFFER_SIZE_BYTES") {
            if let Ok(parsed) = v.parse() {
                config.buffer_size_bytes = parsed;
            }
        }
        config
    }

    /// Number of pooled segments implied by `buffer_pool_bytes / buffer_size_bytes`.
    pub fn pool_segment_count(&self) -> usize {
        (self.buffer_pool_bytes / self.buffer_size_bytes).max(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: Self::default_worker_threads(),
            buffer_pool_bytes: Self::default_buffer_pool_bytes(),
            buffer_size_bytes: Self::default_buffer_size_bytes(),
            local_pool_segments: Self::default_local_pool_segments(),
            backpressure_high_watermark: Self::default_backpressure_high_watermark(),
            sink_retry_attempts: Self::default_sink_retry_attempts(),
            retry_initial_backoff: Self::default_retry_initial_backoff(),
            retry_backoff_cap: Self::default_retry_backoff_cap(),
            stop_timeout_not_running: Self::default_stop_timeout_not_running(),
            stop_timeout_running: Self::default_stop_timeout_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_worker_threads_to_hardware_concurrency() {
        let config = EngineConfig::default();
        assert!(config.resolved_worker_threads() >= 1);
    }

    #[test]
    fn pool_segment_count_divides_bytes_by_segment_size() {
        let mut config = EngineConfig::default();
        config.buffer_pool_bytes = 4096 * 10;
        config.buffer_size_bytes = 4096;
        assert_eq!(config.pool_segment_count(), 10);
    }
}
