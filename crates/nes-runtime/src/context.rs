// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::EngineConfig;
use crate::metrics::Metrics;
use nes_buffer::BufferPool;
use prometheus::Registry;
use std::sync::Arc;

/// Process-wide configuration and metrics shared by every query, source and worker
/// the engine runs, mirroring the teacher crate's per-epoch `Context` bundle. Passed
/// explicitly to constructors rather than reached for as a singleton (spec §9
/// "Global state ... passed explicitly as dependencies").
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub metrics: Arc<Metrics>,
    pub buffer_pool: Arc<BufferPool>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        let registry = Registry::new();
        let buffer_pool = BufferPool::new(config.pool_segment_count(), config.buffer_size_bytes);
        Self {
            metrics: Arc::new(Metrics::new(&registry)),
            config: Arc::new(config),
            buffer_pool: Arc::new(buffer_pool),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> EngineContext {
    let mut config = EngineConfig::default();
    config.buffer_pool_bytes = 64 * 1024;
    config.buffer_size_bytes = 1024;
    config.worker_threads = 2;
    EngineContext::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_exposes_a_buffer_pool_sized_from_config() {
        let ctx = test_context();
        assert_eq!(ctx.buffer_pool.capacity(), 64);
    }
}
