// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{IntCounter, IntGauge, Registry};

/// Process-wide counters and gauges for one engine instance. Deliberately small: spec
/// §9 Non-goals exclude a monitoring *pipeline*, but the ambient observability a
/// production engine carries (late records, retries, queue depth) is not part of that
/// exclusion.
pub struct Metrics {
    pub late_records_dropped: IntCounter,
    pub sink_retry_attempts: IntCounter,
    pub sink_write_failures: IntCounter,
    pub buffer_pool_exhaustion_waits: IntCounter,
    pub worker_queue_depth: IntGauge,
    pub tasks_stolen: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        let late_records_dropped =
            IntCounter::new("nes_late_records_dropped_total", "Records dropped for arriving after the watermark").unwrap();
        let sink_retry_attempts =
            IntCounter::new("nes_sink_retry_attempts_total", "Sink write retry attempts").unwrap();
        let sink_write_failures =
            IntCounter::new("nes_sink_write_failures_total", "Sink writes that exhausted their retry budget").unwrap();
        let buffer_pool_exhaustion_waits =
            IntCounter::new("nes_buffer_pool_exhaustion_waits_total", "Times a source blocked waiting for a pooled buffer")
                .unwrap();
        let worker_queue_depth = IntGauge::new("nes_worker_queue_depth", "Current depth of a worker's local task queue").unwrap();
        let tasks_stolen = IntCounter::new("nes_tasks_stolen_total", "Tasks picked up via work-stealing").unwrap();

        let _ = registry.register(Box::new(late_records_dropped.clone()));
        let _ = registry.register(Box::new(sink_retry_attempts.clone()));
        let _ = registry.register(Box::new(sink_write_failures.clone()));
        let _ = registry.register(Box::new(buffer_pool_exhaustion_waits.clone()));
        let _ = registry.register(Box::new(worker_queue_depth.clone()));
        let _ = registry.register(Box::new(tasks_stolen.clone()));

        Self {
            late_records_dropped,
            sink_retry_attempts,
            sink_write_failures,
            buffer_pool_exhaustion_waits,
            worker_queue_depth,
            tasks_stolen,
        }
    }
}

/// Builds a registry-backed `Metrics` for tests without needing a live process
/// registry.
#[cfg(test)]
pub fn test_metrics() -> Metrics {
    Metrics::new(&Registry::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_construct_and_record() {
        let metrics = test_metrics();
        metrics.late_records_dropped.inc();
        assert_eq!(metrics.late_records_dropped.get(), 1);
    }
}
