// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::DataType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declared physical layout of a schema's tuples (spec §3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    Row,
    Columnar,
}

/// One field of a `Schema`: name, type, and its precomputed byte/null-bit offsets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub byte_offset: usize,
    pub null_bit_offset: usize,
}

/// Ordered sequence of fields with a declared memory layout. Invariant: the sum of
/// field sizes equals the tuple size (spec §3.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "SchemaWire")]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
    layout: Layout,
    tuple_size_bytes: usize,
    #[serde(skip)]
    name_index: HashMap<String, usize>,
}

/// On-the-wire shape of a `Schema`: `name_index` is reconstructed on arrival instead of
/// being serialized, since it's a derived lookup cache, not part of the schema itself.
#[derive(Deserialize)]
struct SchemaWire {
    fields: Vec<FieldDescriptor>,
    layout: Layout,
    tuple_size_bytes: usize,
}

impl From<SchemaWire> for Schema {
    fn from(wire: SchemaWire) -> Self {
        let name_index = wire
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Schema {
            fields: wire.fields,
            layout: wire.layout,
            tuple_size_bytes: wire.tuple_size_bytes,
            name_index,
        }
    }
}

impl Schema {
    pub fn new(layout: Layout, field_types: &[(&str, DataType)]) -> Self {
        let mut fields = Vec::with_capacity(field_types.len());
        let mut offset = 0usize;
        for (i, (name, data_type)) in field_types.iter().enumerate() {
            fields.push(FieldDescriptor {
                name: (*name).to_string(),
                data_type: *data_type,
                byte_offset: offset,
                null_bit_offset: i,
            });
            offset += data_type.fixed_width_bytes();
        }
        let name_index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            fields,
            layout,
            tuple_size_bytes: offset,
            name_index,
        }
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn tuple_size_bytes(&self) -> usize {
        self.tuple_size_bytes
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    pub fn field(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    /// Cumulative byte offset of `field_index` within a columnar buffer's column block,
    /// i.e. the sum of `(field width * capacity)` for every preceding column. Callers
    /// supply `capacity` (tuples per buffer) since that is a property of the buffer,
    /// not the schema.
    pub fn columnar_column_offset(&self, field_index: usize, capacity: usize) -> usize {
        self.fields[..field_index]
            .iter()
            .map(|f| f.data_type.fixed_width_bytes() * capacity)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(
            Layout::Row,
            &[
                ("k", DataType::UInt64),
                ("v", DataType::UInt64),
                ("ts", DataType::UInt64),
            ],
        )
    }

    #[test]
    fn tuple_size_is_sum_of_field_widths() {
        let schema = sample_schema();
        assert_eq!(schema.tuple_size_bytes(), 24);
    }

    #[test]
    fn field_index_resolves_by_name() {
        let schema = sample_schema();
        assert_eq!(schema.field_index("v"), Some(1));
        assert_eq!(schema.field_index("missing"), None);
    }

    #[test]
    fn columnar_offset_is_cumulative_across_fields() {
        let schema = Schema::new(
            Layout::Columnar,
            &[("a", DataType::UInt32), ("b", DataType::UInt64)],
        );
        // column 0 occupies capacity*4 bytes, so column 1 starts right after it.
        assert_eq!(schema.columnar_column_offset(0, 100), 0);
        assert_eq!(schema.columnar_column_offset(1, 100), 400);
    }

    #[test]
    fn deserializing_a_schema_rebuilds_its_name_index() {
        let schema = sample_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let restored: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.field_index("v"), Some(1));
        assert_eq!(restored.field_index("missing"), None);
    }
}
