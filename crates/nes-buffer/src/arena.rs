// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::BufferResult;
use crate::pool::BufferPool;
use crate::tuple_buffer::TupleBuffer;
use std::sync::Arc;

/// A bump allocator scoped to a single task's execution, used to satisfy
/// variable-length field writes without round-tripping through the pool for every
/// small allocation (spec §4.2 "Arena").
///
/// `allocate(n)` follows a three-way contract: requests larger than a pooled
/// segment go straight to an unpooled buffer; requests that fit in the current
/// tail buffer's remaining space are served by bumping a cursor; anything else
/// triggers acquisition of a fresh pooled buffer, which becomes the new tail.
/// All buffers the arena has handed out stay alive until the arena itself drops.
pub struct Arena {
    pool: Arc<BufferPool>,
    buffers: Vec<TupleBuffer>,
    tail_cursor: usize,
}

impl Arena {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            buffers: Vec::new(),
            tail_cursor: 0,
        }
    }

    /// Allocates `n` bytes, returning the backing buffer and the byte offset within
    /// it where the allocation starts.
    pub fn allocate(&mut self, n: usize) -> BufferResult<(TupleBuffer, usize)> {
        if n > self.pool.segment_size_bytes() {
            let unpooled = self.pool.acquire_unpooled(n)?;
            self.buffers.push(unpooled.clone());
            return Ok((unpooled, 0));
        }

        if let Some(tail) = self.buffers.last() {
            if self.tail_cursor + n <= tail.capacity_bytes() {
                let offset = self.tail_cursor;
                self.tail_cursor += n;
                return Ok((tail.clone(), offset));
            }
        }

        let fresh = self.pool.acquire_blocking();
        self.buffers.push(fresh.clone());
        self.tail_cursor = n;
        Ok((fresh, 0))
    }

    pub fn allocated_buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_bump_within_one_buffer() {
        let pool = Arc::new(BufferPool::new(4, 64));
        let mut arena = Arena::new(Arc::clone(&pool));
        let (first, offset_a) = arena.allocate(16).unwrap();
        let (second, offset_b) = arena.allocate(16).unwrap();
        assert_eq!(offset_a, 0);
        assert_eq!(offset_b, 16);
        assert_eq!(first.capacity_bytes(), second.capacity_bytes());
        assert_eq!(arena.allocated_buffer_count(), 1);
    }

    #[test]
    fn overflowing_allocation_acquires_a_new_tail_buffer() {
        let pool = Arc::new(BufferPool::new(4, 64));
        let mut arena = Arena::new(Arc::clone(&pool));
        arena.allocate(48).unwrap();
        let (_, offset) = arena.allocate(32).unwrap();
        assert_eq!(offset, 0, "overflow forces a fresh tail buffer");
        assert_eq!(arena.allocated_buffer_count(), 2);
    }

    #[test]
    fn oversized_allocation_goes_unpooled_without_consuming_capacity() {
        let pool = Arc::new(BufferPool::new(4, 64));
        let mut arena = Arena::new(Arc::clone(&pool));
        let (buffer, offset) = arena.allocate(128).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(buffer.capacity_bytes(), 128);
        assert_eq!(pool.segments_free(), 4, "unpooled path never touches the pool");
    }

    #[test]
    fn dropping_the_arena_releases_all_acquired_buffers() {
        let pool = Arc::new(BufferPool::new(2, 64));
        {
            let mut arena = Arena::new(Arc::clone(&pool));
            arena.allocate(32).unwrap();
            arena.allocate(64).unwrap();
            assert_eq!(pool.segments_free(), 0);
        }
        assert_eq!(pool.segments_free(), 2);
    }
}
