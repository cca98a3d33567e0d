// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::Metrics;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use nes_buffer::{BufferPool, LocalBufferPool};
use nes_callback::CallbackRef;
use nes_types::{ChunkNumber, OriginId, PipelineId, QueryId, Record, SequenceNumber, WatermarkTimestamp};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Stable identifier for a worker thread (spec §4.5 "a thread-id (stable)").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// One releasable unit of pipeline work: a batch of already-decoded records destined
/// for one `(query, pipeline)`, already past its pipeline's sequencer (spec §4.5
/// "Pipeline stage execution"). A steal may reorder tasks across different
/// `(query, pipeline)` pairs but never within one, since within-pipeline ordering is
/// established before a `Task` is ever submitted to the pool.
pub struct Task {
    pub query_id: QueryId,
    pub pipeline_id: PipelineId,
    pub origin: OriginId,
    pub seq: SequenceNumber,
    pub chunk: ChunkNumber,
    pub last_chunk: bool,
    pub records: Vec<Record>,
    /// The multi-origin global watermark (spec §4.4) in effect when this task's
    /// records became ready for dispatch; carried forward unchanged across any
    /// downstream re-submission so every pipeline in the chain sees the watermark
    /// that was actually current when the data arrived.
    pub watermark: WatermarkTimestamp,
    /// Held for the duration of execution (spec §4.5 "Cancellation": "its refs are
    /// held by every in-flight task"); dropped when this `Task` is consumed.
    pub guard: Option<CallbackRef>,
}

/// Fixed-size pool of OS worker threads (spec §4.5 "Worker pool"). Tasks are
/// submitted to a global injector; each worker first drains its own local deque, then
/// steals a batch from the injector, then steals single tasks from peers — the
/// standard `crossbeam-deque` work-stealing idiom, filling in for the host codebase's
/// lack of a direct analogue here.
pub struct WorkerPool {
    injector: Arc<Injector<Task>>,
    queue_depth_hint: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(
        num_workers: usize,
        global_buffer_pool: Arc<BufferPool>,
        local_pool_segments: usize,
        metrics: Arc<Metrics>,
        execute: Arc<dyn Fn(Task, WorkerId, &LocalBufferPool) + Send + Sync>,
    ) -> Self {
        let injector = Arc::new(Injector::new());
        let locals: Vec<Deque<Task>> = (0..num_workers.max(1)).map(|_| Deque::new_fifo()).collect();
        let stealers: Vec<Stealer<Task>> = locals.iter().map(|d| d.stealer()).collect();
        let shutdown = Arc::new(AtomicBool::new(false));
        let queue_depth_hint = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(locals.len());
        for (index, local) in locals.into_iter().enumerate() {
            let worker_id = WorkerId(index);
            let injector = Arc::clone(&injector);
            let stealers = stealers.clone();
            let shutdown = Arc::clone(&shutdown);
            let execute = Arc::clone(&execute);
            let local_pool = global_buffer_pool.detach_local(local_pool_segments);
            let metrics = Arc::clone(&metrics);
            let depth_hint = Arc::clone(&queue_depth_hint);

            let handle = std::thread::Builder::new()
                .name(worker_id.to_string())
                .spawn(move || worker_loop(worker_id, local, injector, stealers, shutdown, local_pool, execute, metrics, depth_hint))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        debug!(workers = num_workers, "worker pool started");
        Self { injector, queue_depth_hint, shutdown, handles: Mutex::new(handles) }
    }

    pub fn submit(&self, task: Task) {
        self.queue_depth_hint.fetch_add(1, Ordering::AcqRel);
        self.injector.push(task);
    }

    /// Approximate global queue depth, used by sources polling for back-pressure
    /// (spec §4.5 "if a worker's queue exceeds a high-watermark").
    pub fn queue_depth(&self) -> usize {
        self.queue_depth_hint.load(Ordering::Acquire)
    }

    /// Signals every worker to stop after its current task and joins all threads.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            handle.join().ok();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    id: WorkerId,
    local: Deque<Task>,
    injector: Arc<Injector<Task>>,
    stealers: Vec<Stealer<Task>>,
    shutdown: Arc<AtomicBool>,
    local_pool: LocalBufferPool,
    execute: Arc<dyn Fn(Task, WorkerId, &LocalBufferPool) + Send + Sync>,
    metrics: Arc<Metrics>,
    depth_hint: Arc<AtomicUsize>,
) {
    loop {
        match find_task(&local, &injector, &stealers) {
            Some(task) => {
                depth_hint.fetch_sub(1, Ordering::AcqRel);
                metrics.worker_queue_depth.set(depth_hint.load(Ordering::Acquire) as i64);
                execute(task, id, &local_pool);
            }
            None => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }
    trace!(%id, "worker thread exiting");
}

/// Local queue first, then a batch steal from the injector, then single-task steals
/// from peers — the order `crossbeam-deque` documents for minimizing contention.
fn find_task<T>(local: &Deque<T>, global: &Injector<T>, stealers: &[Stealer<T>]) -> Option<T> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            global
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(|s| s.steal()).collect())
        })
        .find(|s| !matches!(s, Steal::Retry))
        .and_then(|s| s.success())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nes_types::Record;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn submitted_tasks_are_all_executed_exactly_once() {
        let pool = Arc::new(BufferPool::new(8, 64));
        let processed = Arc::new(AtomicU32::new(0));
        let processed_clone = Arc::clone(&processed);
        let workers = WorkerPool::start(
            2,
            pool,
            2,
            Arc::new(Metrics::new(&prometheus::Registry::new())),
            Arc::new(move |_task: Task, _id, _local: &LocalBufferPool| {
                processed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for i in 0..20 {
            workers.submit(Task {
                query_id: QueryId::new(0),
                pipeline_id: PipelineId::new(0),
                origin: OriginId::new(0),
                seq: SequenceNumber::new(i),
                chunk: ChunkNumber::new(0),
                last_chunk: true,
                records: vec![Record::new()],
                watermark: WatermarkTimestamp::new(0),
                guard: None,
            });
        }

        std::thread::sleep(Duration::from_millis(200));
        workers.shutdown();
        assert_eq!(processed.load(Ordering::SeqCst), 20);
    }
}
