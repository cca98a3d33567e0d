// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::Schema;

/// Pure function from `(record index, field index)` to a byte offset within a tuple
/// buffer, per spec §3.1. `capacity` is the buffer's declared tuple capacity, needed by
/// the columnar layout to compute cumulative column offsets.
pub trait MemoryLayout {
    fn field_offset(&self, schema: &Schema, capacity: usize, record_index: usize, field_index: usize) -> usize;
}

pub struct RowLayout;

impl MemoryLayout for RowLayout {
    fn field_offset(&self, schema: &Schema, _capacity: usize, record_index: usize, field_index: usize) -> usize {
        let tuple_size = schema.tuple_size_bytes();
        let field = &schema.fields()[field_index];
        record_index * tuple_size + field.byte_offset
    }
}

pub struct ColumnarLayout;

impl MemoryLayout for ColumnarLayout {
    fn field_offset(&self, schema: &Schema, capacity: usize, record_index: usize, field_index: usize) -> usize {
        let column_offset = schema.columnar_column_offset(field_index, capacity);
        let field_size = schema.fields()[field_index].data_type.fixed_width_bytes();
        column_offset + record_index * field_size
    }
}

/// Resolves the layout implementation matching `Schema::layout()`.
pub fn layout_for(schema: &Schema) -> Box<dyn MemoryLayout> {
    match schema.layout() {
        crate::Layout::Row => Box::new(RowLayout),
        crate::Layout::Columnar => Box::new(ColumnarLayout),
    }
}
