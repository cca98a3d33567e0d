// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::arena::Arena;
use crate::error::{BufferError, BufferResult};
use crate::pool::{Segment, SegmentInner};
use nes_types::{layout_for, ChunkNumber, DataType, FieldValue, OriginId, Schema, SequenceNumber, WatermarkTimestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

struct TupleBufferInner {
    segment: Segment,
    /// Number of bytes of `segment` actually in use by this lease.
    used_bytes: usize,
    tuple_count: AtomicU32,
    tuple_size_bytes: usize,
    origin_id: AtomicU64,
    sequence_number: AtomicU64,
    chunk_number: AtomicU32,
    last_chunk: std::sync::atomic::AtomicBool,
    watermark_ts: AtomicU64,
    /// Buffers chained off this one for variable-sized payloads that did not fit
    /// inline (spec §3.1 "Arena", §4.2 "Record write").
    child_buffers: Mutex<Vec<TupleBuffer>>,
}

/// A cheap, reference-counted handle over a pooled or unpooled byte segment (spec
/// §3.1). Cloning increments the underlying segment's refcount; the last clone to
/// drop recycles the segment (see `pool::SegmentInner::drop`).
#[derive(Clone)]
pub struct TupleBuffer {
    inner: Arc<TupleBufferInner>,
}

impl TupleBuffer {
    pub(crate) fn from_segment(segment: Segment, used_bytes: usize) -> Self {
        Self {
            inner: Arc::new(TupleBufferInner {
                segment,
                used_bytes,
                tuple_count: AtomicU32::new(0),
                tuple_size_bytes: 0,
                origin_id: AtomicU64::new(0),
                sequence_number: AtomicU64::new(0),
                chunk_number: AtomicU32::new(0),
                last_chunk: std::sync::atomic::AtomicBool::new(false),
                watermark_ts: AtomicU64::new(0),
                child_buffers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of distinct handles currently sharing this buffer's segment. Exposed for
    /// tests and diagnostics; mirrors the segment's atomic refcount (spec §3.1).
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.inner.segment.capacity()
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.used_bytes
    }

    pub fn tuple_count(&self) -> u32 {
        self.inner.tuple_count.load(Ordering::Acquire)
    }

    pub fn set_tuple_count(&self, count: u32) {
        self.inner.tuple_count.store(count, Ordering::Release);
    }

    pub fn tuple_size_bytes(&self) -> usize {
        self.inner.tuple_size_bytes
    }

    /// Stamps origin/sequence metadata onto a freshly acquired buffer (spec §4.5
    /// "Source ... stamps the buffer"). Intended to be called exactly once, by the
    /// acquiring source thread, before the buffer is shared with any consumer.
    pub fn stamp(
        &self,
        origin: OriginId,
        sequence_number: SequenceNumber,
        chunk_number: ChunkNumber,
        last_chunk: bool,
        watermark_ts: WatermarkTimestamp,
    ) {
        self.inner.origin_id.store(origin.value(), Ordering::Release);
        self.inner
            .sequence_number
            .store(sequence_number.value(), Ordering::Release);
        self.inner.chunk_number.store(chunk_number.value(), Ordering::Release);
        self.inner.last_chunk.store(last_chunk, Ordering::Release);
        self.inner
            .watermark_ts
            .store(watermark_ts.value(), Ordering::Release);
    }

    pub fn origin_id(&self) -> OriginId {
        OriginId::new(self.inner.origin_id.load(Ordering::Acquire))
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.sequence_number.load(Ordering::Acquire))
    }

    pub fn chunk_number(&self) -> ChunkNumber {
        ChunkNumber::new(self.inner.chunk_number.load(Ordering::Acquire))
    }

    pub fn last_chunk(&self) -> bool {
        self.inner.last_chunk.load(Ordering::Acquire)
    }

    pub fn watermark_ts(&self) -> WatermarkTimestamp {
        WatermarkTimestamp::new(self.inner.watermark_ts.load(Ordering::Acquire))
    }

    pub fn add_child_buffer(&self, child: TupleBuffer) -> usize {
        let mut children = self.child_buffers_lock();
        trace!(
            parent_strong_count = self.strong_count(),
            child_strong_count = child.strong_count(),
            child_index = children.len(),
            "attaching child buffer"
        );
        children.push(child);
        children.len() - 1
    }

    pub fn child_buffer(&self, index: usize) -> Option<TupleBuffer> {
        self.child_buffers_lock().get(index).cloned()
    }

    pub fn child_buffer_count(&self) -> usize {
        self.child_buffers_lock().len()
    }

    fn child_buffers_lock(&self) -> parking_lot::MutexGuard<'_, Vec<TupleBuffer>> {
        self.inner.child_buffers.lock()
    }

    /// Raw byte access for the memory-layout read/write helpers below. Bounds must be
    /// validated by the caller against `capacity_bytes()`.
    ///
    /// # Safety
    /// The caller must not hold overlapping mutable/shared byte ranges across threads
    /// without external synchronization; within one task execution only a single
    /// worker thread accesses a given buffer's bytes, which this type's intended usage
    /// guarantees.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        let ptr = self.segment_ptr();
        std::slice::from_raw_parts_mut(ptr, self.capacity_bytes())
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.segment_ptr(), self.capacity_bytes()) }
    }

    fn segment_ptr(&self) -> *mut u8 {
        SegmentInner::as_mut_ptr(&self.inner.segment)
    }

    /// Binds a schema's tuple size onto a freshly acquired buffer, returning a new
    /// handle sharing the same underlying segment (spec §4.2 "a buffer is bound to
    /// exactly one schema for its lifetime"). `read_field`/`write_field` use the bound
    /// size, when present, in preference to recomputing it from the schema on every
    /// call. Intended to be called once, right after acquisition, before the buffer is
    /// shared with any consumer — like `stamp`, later calls on the original handle do
    /// not affect the buffer returned here.
    pub fn with_tuple_layout(&self, tuple_size_bytes: usize) -> Self {
        TupleBuffer {
            inner: Arc::new(TupleBufferInner {
                segment: Arc::clone(&self.inner.segment),
                used_bytes: self.inner.used_bytes,
                tuple_count: AtomicU32::new(self.tuple_count()),
                tuple_size_bytes,
                origin_id: AtomicU64::new(self.inner.origin_id.load(Ordering::Acquire)),
                sequence_number: AtomicU64::new(self.inner.sequence_number.load(Ordering::Acquire)),
                chunk_number: AtomicU32::new(self.inner.chunk_number.load(Ordering::Acquire)),
                last_chunk: std::sync::atomic::AtomicBool::new(self.last_chunk()),
                watermark_ts: AtomicU64::new(self.inner.watermark_ts.load(Ordering::Acquire)),
                child_buffers: Mutex::new(self.inner.child_buffers.lock().clone()),
            }),
        }
    }

    fn tuple_capacity(&self, schema: &Schema) -> usize {
        let tuple_size = if self.tuple_size_bytes() > 0 {
            self.tuple_size_bytes()
        } else {
            schema.tuple_size_bytes()
        };
        self.capacity_bytes() / tuple_size.max(1)
    }

    /// Writes one field of one tuple at `(record_index, field_index)`, resolving the
    /// byte address through `schema`'s memory layout (spec §4.2 "Record write"). Fixed-
    /// width fields are written in place; `FieldValue::VarSized` payloads are handed to
    /// `arena` and only a child-buffer index plus byte offset are stored inline.
    pub fn write_field(
        &self,
        schema: &Schema,
        arena: &mut Arena,
        record_index: usize,
        field_index: usize,
        value: &FieldValue,
    ) -> BufferResult<()> {
        let field = schema
            .fields()
            .get(field_index)
            .ok_or(BufferError::FieldIndexOutOfRange {
                field_index,
                field_count: schema.fields().len(),
            })?;
        if field.data_type != value.data_type() {
            return Err(BufferError::FieldTypeMismatch {
                field_index,
                expected: field.data_type,
                actual: value.data_type(),
            });
        }

        let capacity = self.tuple_capacity(schema);
        let offset = layout_for(schema).field_offset(schema, capacity, record_index, field_index);

        match value {
            FieldValue::VarSized(bytes) => {
                let (child, child_offset) = arena.allocate(4 + bytes.len())?;
                child.write_bytes(child_offset, &(bytes.len() as u32).to_le_bytes())?;
                child.write_bytes(child_offset + 4, bytes)?;
                let child_index = self.add_child_buffer(child) as u32;
                self.write_bytes(offset, &child_index.to_le_bytes())?;
                self.write_bytes(offset + 4, &(child_offset as u32).to_le_bytes())?;
                Ok(())
            }
            _ => self.write_fixed(offset, value),
        }
    }

    /// Reads one field of one tuple at `(record_index, field_index)`, the inverse of
    /// [`Self::write_field`].
    pub fn read_field(&self, schema: &Schema, record_index: usize, field_index: usize) -> BufferResult<FieldValue> {
        let field = schema
            .fields()
            .get(field_index)
            .ok_or(BufferError::FieldIndexOutOfRange {
                field_index,
                field_count: schema.fields().len(),
            })?;

        let capacity = self.tuple_capacity(schema);
        let offset = layout_for(schema).field_offset(schema, capacity, record_index, field_index);

        if field.data_type != DataType::VarSized {
            return self.read_fixed(offset, field.data_type);
        }

        let child_index = self.read_u32(offset)?;
        let child_offset = self.read_u32(offset + 4)? as usize;
        let child = self
            .child_buffer(child_index as usize)
            .ok_or(BufferError::MissingChildBuffer { child_index: child_index as usize })?;
        let len = child.read_u32(child_offset)? as usize;
        let start = child_offset + 4;
        if start + len > child.capacity_bytes() {
            return Err(BufferError::BufferTooSmall {
                offset: start,
                len,
                capacity: child.capacity_bytes(),
            });
        }
        Ok(FieldValue::VarSized(child.as_slice()[start..start + len].to_vec()))
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) -> BufferResult<()> {
        let end = offset + bytes.len();
        if end > self.capacity_bytes() {
            return Err(BufferError::BufferTooSmall {
                offset,
                len: bytes.len(),
                capacity: self.capacity_bytes(),
            });
        }
        // SAFETY: `end <= capacity_bytes()` was just checked, and per this type's
        // contract only one worker thread writes to a given buffer's bytes at a time.
        unsafe {
            self.as_mut_slice()[offset..end].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn write_fixed(&self, offset: usize, value: &FieldValue) -> BufferResult<()> {
        match value {
            FieldValue::Int8(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::Int16(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::Int32(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::Int64(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::UInt8(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::UInt16(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::UInt32(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::UInt64(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::Float32(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::Float64(v) => self.write_bytes(offset, &v.to_le_bytes()),
            FieldValue::Boolean(v) => self.write_bytes(offset, &[*v as u8]),
            FieldValue::VarSized(_) => unreachable!("var-sized fields go through the child-buffer path"),
        }
    }

    fn read_fixed(&self, offset: usize, data_type: DataType) -> BufferResult<FieldValue> {
        let width = data_type.fixed_width_bytes();
        let end = offset + width;
        if end > self.capacity_bytes() {
            return Err(BufferError::BufferTooSmall {
                offset,
                len: width,
                capacity: self.capacity_bytes(),
            });
        }
        let bytes = &self.as_slice()[offset..end];
        Ok(match data_type {
            DataType::Int8 => FieldValue::Int8(bytes[0] as i8),
            DataType::Int16 => FieldValue::Int16(i16::from_le_bytes(bytes.try_into().unwrap())),
            DataType::Int32 => FieldValue::Int32(i32::from_le_bytes(bytes.try_into().unwrap())),
            DataType::Int64 => FieldValue::Int64(i64::from_le_bytes(bytes.try_into().unwrap())),
            DataType::UInt8 => FieldValue::UInt8(bytes[0]),
            DataType::UInt16 => FieldValue::UInt16(u16::from_le_bytes(bytes.try_into().unwrap())),
            DataType::UInt32 => FieldValue::UInt32(u32::from_le_bytes(bytes.try_into().unwrap())),
            DataType::UInt64 => FieldValue::UInt64(u64::from_le_bytes(bytes.try_into().unwrap())),
            DataType::Float32 => FieldValue::Float32(f32::from_le_bytes(bytes.try_into().unwrap())),
            DataType::Float64 => FieldValue::Float64(f64::from_le_bytes(bytes.try_into().unwrap())),
            DataType::Boolean => FieldValue::Boolean(bytes[0] != 0),
            DataType::VarSized => unreachable!("var-sized fields go through the child-buffer path"),
        })
    }

    fn read_u32(&self, offset: usize) -> BufferResult<u32> {
        let FieldValue::UInt32(v) = self.read_fixed(offset, DataType::UInt32)? else {
            unreachable!()
        };
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use nes_types::Layout;
    use proptest::prelude::*;

    fn row_schema() -> Schema {
        Schema::new(
            Layout::Row,
            &[("k", DataType::UInt64), ("label", DataType::VarSized)],
        )
    }

    #[test]
    fn stamp_round_trips_metadata() {
        let pool = BufferPool::new(1, 64);
        let buffer = pool.acquire_blocking();
        buffer.stamp(
            OriginId::new(3),
            SequenceNumber::new(10),
            ChunkNumber::new(0),
            true,
            WatermarkTimestamp::new(100),
        );
        assert_eq!(buffer.origin_id(), OriginId::new(3));
        assert_eq!(buffer.sequence_number(), SequenceNumber::new(10));
        assert!(buffer.last_chunk());
        assert_eq!(buffer.watermark_ts(), WatermarkTimestamp::new(100));
    }

    #[test]
    fn child_buffers_are_indexable() {
        let pool = BufferPool::new(2, 64);
        let parent = pool.acquire_blocking();
        let child = pool.acquire_blocking();
        let index = parent.add_child_buffer(child.clone());
        assert_eq!(index, 0);
        assert_eq!(parent.child_buffer(0).unwrap().capacity_bytes(), child.capacity_bytes());
    }

    #[test]
    fn raw_slice_write_and_read_round_trips() {
        let pool = BufferPool::new(1, 16);
        let buffer = pool.acquire_blocking();
        unsafe {
            let slice = buffer.as_mut_slice();
            slice[0] = 42;
        }
        assert_eq!(buffer.as_slice()[0], 42);
    }

    #[test]
    fn fixed_field_round_trips_through_write_and_read() {
        let pool = Arc::new(BufferPool::new(2, 256));
        let schema = row_schema();
        let buffer = pool.acquire_blocking().with_tuple_layout(schema.tuple_size_bytes());
        let mut arena = Arena::new(Arc::clone(&pool));

        buffer
            .write_field(&schema, &mut arena, 0, 0, &FieldValue::UInt64(7))
            .unwrap();
        assert_eq!(buffer.read_field(&schema, 0, 0).unwrap(), FieldValue::UInt64(7));
    }

    #[test]
    fn var_sized_field_allocates_through_the_arena_and_round_trips() {
        let pool = Arc::new(BufferPool::new(2, 256));
        let schema = row_schema();
        let buffer = pool.acquire_blocking().with_tuple_layout(schema.tuple_size_bytes());
        let mut arena = Arena::new(Arc::clone(&pool));

        let payload = FieldValue::VarSized(b"hello window".to_vec());
        buffer.write_field(&schema, &mut arena, 0, 1, &payload).unwrap();
        assert_eq!(arena.allocated_buffer_count(), 1);
        assert_eq!(buffer.child_buffer_count(), 1);
        assert_eq!(buffer.read_field(&schema, 0, 1).unwrap(), payload);
    }

    #[test]
    fn multiple_var_sized_writes_share_one_arena_tail_buffer() {
        let pool = Arc::new(BufferPool::new(3, 256));
        let schema = row_schema();
        let buffer = pool.acquire_blocking().with_tuple_layout(schema.tuple_size_bytes());
        let mut arena = Arena::new(Arc::clone(&pool));

        buffer
            .write_field(&schema, &mut arena, 0, 1, &FieldValue::VarSized(vec![1, 2, 3]))
            .unwrap();
        buffer
            .write_field(&schema, &mut arena, 1, 1, &FieldValue::VarSized(vec![4, 5]))
            .unwrap();

        assert_eq!(arena.allocated_buffer_count(), 1, "both writes bump-pack into the same tail buffer");
        assert_eq!(buffer.read_field(&schema, 0, 1).unwrap(), FieldValue::VarSized(vec![1, 2, 3]));
        assert_eq!(buffer.read_field(&schema, 1, 1).unwrap(), FieldValue::VarSized(vec![4, 5]));
    }

    #[test]
    fn write_field_rejects_a_type_mismatched_value() {
        let pool = Arc::new(BufferPool::new(1, 64));
        let schema = row_schema();
        let buffer = pool.acquire_blocking().with_tuple_layout(schema.tuple_size_bytes());
        let mut arena = Arena::new(Arc::clone(&pool));

        let err = buffer
            .write_field(&schema, &mut arena, 0, 0, &FieldValue::UInt32(1))
            .unwrap_err();
        assert_eq!(
            err,
            BufferError::FieldTypeMismatch {
                field_index: 0,
                expected: DataType::UInt64,
                actual: DataType::UInt32,
            }
        );
    }

    proptest! {
        #[test]
        fn fixed_field_round_trips_for_any_u64(value: u64, bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let pool = Arc::new(BufferPool::new(2, 256));
            let schema = row_schema();
            let buffer = pool.acquire_blocking().with_tuple_layout(schema.tuple_size_bytes());
            let mut arena = Arena::new(Arc::clone(&pool));

            buffer.write_field(&schema, &mut arena, 0, 0, &FieldValue::UInt64(value)).unwrap();
            buffer.write_field(&schema, &mut arena, 0, 1, &FieldValue::VarSized(bytes.clone())).unwrap();

            prop_assert_eq!(buffer.read_field(&schema, 0, 0).unwrap(), FieldValue::UInt64(value));
            prop_assert_eq!(buffer.read_field(&schema, 0, 1).unwrap(), FieldValue::VarSized(bytes));
        }
    }
}
