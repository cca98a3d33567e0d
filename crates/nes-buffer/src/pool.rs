// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{BufferError, BufferResult};
use crate::tuple_buffer::TupleBuffer;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Where a recycled segment's bytes should be returned. A pooled segment goes back to
/// its owning `BufferPool`'s free list; an unpooled segment is simply dropped (spec
/// §4.1 "routed through the same recycling path").
enum RecycleTarget {
    Pooled(Weak<PoolShared>),
    Unpooled,
}

/// The physical backing store for one fixed-size segment plus its control block (spec
/// §3.1 "Segment"). Reference-counted via the enclosing `Arc`: when the last `Arc`
/// referencing a `SegmentInner` drops, `Drop` recycles the bytes into the pool's free
/// list instead of letting them be deallocated, mirroring the host codebase's
/// `LocalBufferManager::recyclePooledBuffer` / `MemorySegment::controlBlock` recycler
/// callback (`original_source/src/NodeEngine/LocalBufferManager.cpp`).
pub(crate) struct SegmentInner {
    data: UnsafeCell<Box<[u8]>>,
    recycle: RecycleTarget,
}

// SAFETY: access to `data` is only ever performed through a single live `TupleBuffer`
// lease at a time; concurrent TupleBuffer clones share read/write access the same way a
// `&mut [u8]` handed to cooperating pipeline code would, which is the buffer pool's
// documented contract (spec §3.1 "TupleBuffer ... Copy = atomic refcount increment").
unsafe impl Send for SegmentInner {}
unsafe impl Sync for SegmentInner {}

impl SegmentInner {
    pub(crate) fn capacity(&self) -> usize {
        // SAFETY: length never changes after construction.
        unsafe { (*self.data.get()).len() }
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }
}

impl Drop for SegmentInner {
    fn drop(&mut self) {
        match &self.recycle {
            RecycleTarget::Pooled(pool) => {
                if let Some(pool) = pool.upgrade() {
                    let bytes = std::mem::replace(self.data.get_mut(), Box::new([]));
                    pool.recycle(bytes);
                }
            }
            RecycleTarget::Unpooled => {}
        }
    }
}

pub(crate) type Segment = Arc<SegmentInner>;

struct PoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    segment_size_bytes: usize,
    capacity: usize,
    total_segments: AtomicUsize,
    not_empty: parking_lot::Condvar,
}

impl PoolShared {
    fn recycle(&self, bytes: Box<[u8]>) {
        let mut free = self.free.lock();
        free.push(bytes);
        self.not_empty.notify_one();
        trace!(free = free.len(), "segment recycled");
    }
}

/// Process-wide (or per-worker, when constructed as a `LocalBufferPool`'s backing
/// source) fixed-size pooled buffer allocator plus unpooled-allocation path (spec
/// §4.1).
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool of `capacity` fixed-size segments, each `segment_size_bytes`
    /// long.
    pub fn new(capacity: usize, segment_size_bytes: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(vec![0u8; segment_size_bytes].into_boxed_slice());
        }
        debug!(capacity, segment_size_bytes, "buffer pool created");
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                segment_size_bytes,
                capacity,
                total_segments: AtomicUsize::new(capacity),
                not_empty: parking_lot::Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn segment_size_bytes(&self) -> usize {
        self.shared.segment_size_bytes
    }

    pub fn segments_free(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Blocks until a pooled segment is available (spec §4.1 `acquire()`).
    pub fn acquire_blocking(&self) -> TupleBuffer {
        let segment = self.take_segment_blocking();
        TupleBuffer::from_segment(segment, self.shared.segment_size_bytes)
    }

    /// Non-blocking variant: returns `None` if no pooled segment is currently free
    /// (spec §4.1 "optional variant: non-blocking returns empty").
    pub fn try_acquire(&self) -> Option<TupleBuffer> {
        let mut free = self.shared.free.lock();
        let bytes = free.pop()?;
        drop(free);
        Some(TupleBuffer::from_segment(
            self.wrap_pooled(bytes),
            self.shared.segment_size_bytes,
        ))
    }

    /// Always allocates a fresh buffer of `size_bytes`, routed through the same
    /// recycling path as pooled segments but never counted against pool capacity
    /// (spec §4.1 `acquireUnpooled`).
    pub fn acquire_unpooled(&self, size_bytes: usize) -> BufferResult<TupleBuffer> {
        if size_bytes == 0 {
            return Err(BufferError::CannotAllocateBuffer {
                requested_bytes: size_bytes,
            });
        }
        let segment = Arc::new(SegmentInner {
            data: UnsafeCell::new(vec![0u8; size_bytes].into_boxed_slice()),
            recycle: RecycleTarget::Unpooled,
        });
        Ok(TupleBuffer::from_segment(segment, size_bytes))
    }

    /// Detaches `count` segments from the global free list into a worker-local pool
    /// (spec §4.1 "Local buffer pools").
    pub fn detach_local(self: &Arc<Self>, count: usize) -> LocalBufferPool {
        let mut reserved = Vec::with_capacity(count);
        for _ in 0..count {
            reserved.push(self.take_segment_blocking());
        }
        LocalBufferPool {
            global: Arc::clone(self),
            exclusive: Mutex::new(reserved),
        }
    }

    fn take_segment_blocking(&self) -> Segment {
        let mut free = self.shared.free.lock();
        loop {
            if let Some(bytes) = free.pop() {
                return self.wrap_pooled(bytes);
            }
            self.shared.not_empty.wait(&mut free);
        }
    }

    fn wrap_pooled(&self, bytes: Box<[u8]>) -> Segment {
        Arc::new(SegmentInner {
            data: UnsafeCell::new(bytes),
            recycle: RecycleTarget::Pooled(Arc::downgrade(&self.shared)),
        })
    }
}

/// Worker-thread-local slice of the global pool (spec §4.1 "Local buffer pools").
/// `acquire` is lock-free on the happy path; on local exhaustion it falls back to the
/// global pool. Remaining exclusive segments are returned to the global pool on drop.
pub struct LocalBufferPool {
    global: Arc<BufferPool>,
    exclusive: Mutex<Vec<Segment>>,
}

impl LocalBufferPool {
    /// The shared global pool this local pool detached its segments from. Handed to
    /// an `Arena` so variable-length writes can grow beyond one worker's exclusive
    /// segments without going through this pool's lock on every allocation.
    pub fn global_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.global)
    }

    pub fn acquire(&self) -> TupleBuffer {
        let mut exclusive = self.exclusive.lock();
        if let Some(segment) = exclusive.pop() {
            drop(exclusive);
            return TupleBuffer::from_segment(segment, self.global.shared.segment_size_bytes);
        }
        drop(exclusive);
        self.global.acquire_blocking()
    }

    pub fn available_exclusive_buffers(&self) -> usize {
        self.exclusive.lock().len()
    }
}

impl Drop for LocalBufferPool {
    fn drop(&mut self) {
        // Draining here (rather than relying on each Segment's own recycle-on-drop)
        // keeps the accounting symmetric with acquisition: every segment taken via
        // `detach_local` is handed back explicitly.
        let mut exclusive = self.exclusive.lock();
        exclusive.clear();
    }
}
