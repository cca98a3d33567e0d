// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// High-watermark back-pressure signal for one worker's task queue (spec §4.5
/// "Back-pressure"). Pool exhaustion is handled separately by `BufferPool::acquire`
/// blocking; this controller only governs the worker-queue side, polled by a source
/// before each buffer emission.
pub struct Backpressure {
    high_watermark: usize,
    poll_interval: Duration,
}

impl Backpressure {
    pub fn new(high_watermark: usize) -> Self {
        Self { high_watermark, poll_interval: Duration::from_millis(1) }
    }

    pub fn is_congested(&self, queue_depth: usize) -> bool {
        queue_depth >= self.high_watermark
    }

    /// Blocks the calling source thread while `queue_depth()` reports congestion,
    /// re-checking `should_stop()` between polls so a query stop is never held up
    /// behind back-pressure.
    pub fn wait_while_congested(&self, queue_depth: impl Fn() -> usize, should_stop: impl Fn() -> bool) {
        while self.is_congested(queue_depth()) && !should_stop() {
            std::thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn not_congested_below_watermark() {
        let bp = Backpressure::new(10);
        assert!(!bp.is_congested(5));
        assert!(bp.is_congested(10));
    }

    #[test]
    fn wait_while_congested_returns_once_depth_drops() {
        let bp = Backpressure::new(4);
        let depth = AtomicUsize::new(4);
        let polls = Cell::new(0);
        bp.wait_while_congested(
            || {
                polls.set(polls.get() + 1);
                if polls.get() >= 3 {
                    depth.store(0, Ordering::SeqCst);
                }
                depth.load(Ordering::SeqCst)
            },
            || false,
        );
        assert!(polls.get() >= 3);
    }
}
