// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// The set of primitive field types a `Schema` can declare (spec §3.1, §9 "Dynamic
/// typing" — records are sum types over these).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Boolean,
    /// Length-prefixed byte payload, stored inline or via a child-buffer index.
    VarSized,
}

impl DataType {
    /// Fixed on-the-wire width in bytes for the in-record slot. `VarSized` fields store
    /// a 4-byte child-buffer index followed by a 4-byte byte offset into that child
    /// buffer, so the fixed slot is 8 bytes wide even though the payload itself lives
    /// out of line.
    pub const fn fixed_width_bytes(self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 | DataType::Boolean => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 | DataType::VarSized => 8,
        }
    }
}

/// A single typed field value. Records carry these ephemerally during task execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    VarSized(Vec<u8>),
}

impl FieldValue {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldValue::Int8(_) => DataType::Int8,
            FieldValue::Int16(_) => DataType::Int16,
            FieldValue::Int32(_) => DataType::Int32,
            FieldValue::Int64(_) => DataType::Int64,
            FieldValue::UInt8(_) => DataType::UInt8,
            FieldValue::UInt16(_) => DataType::UInt16,
            FieldValue::UInt32(_) => DataType::UInt32,
            FieldValue::UInt64(_) => DataType::UInt64,
            FieldValue::Float32(_) => DataType::Float32,
            FieldValue::Float64(_) => DataType::Float64,
            FieldValue::Boolean(_) => DataType::Boolean,
            FieldValue::VarSized(_) => DataType::VarSized,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt64(v) => Some(*v),
            FieldValue::UInt32(v) => Some(*v as u64),
            FieldValue::UInt16(v) => Some(*v as u64),
            FieldValue::UInt8(v) => Some(*v as u64),
            FieldValue::Int64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float64(v) => Some(*v),
            FieldValue::Float32(v) => Some(*v as f64),
            _ => self.as_u64().map(|v| v as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_width_matches_declared_type() {
        assert_eq!(DataType::Int64.fixed_width_bytes(), 8);
        assert_eq!(DataType::VarSized.fixed_width_bytes(), 8);
    }

    #[test]
    fn as_u64_widens_smaller_unsigned_types() {
        assert_eq!(FieldValue::UInt16(9).as_u64(), Some(9));
        assert_eq!(FieldValue::Boolean(true).as_u64(), None);
    }

    proptest! {
        #[test]
        fn as_u64_widening_never_changes_the_numeric_value(v8 in any::<u8>(), v16 in any::<u16>(), v32 in any::<u32>(), v64 in any::<u64>()) {
            prop_assert_eq!(FieldValue::UInt8(v8).as_u64(), Some(v8 as u64));
            prop_assert_eq!(FieldValue::UInt16(v16).as_u64(), Some(v16 as u64));
            prop_assert_eq!(FieldValue::UInt32(v32).as_u64(), Some(v32 as u64));
            prop_assert_eq!(FieldValue::UInt64(v64).as_u64(), Some(v64));
        }

        #[test]
        fn as_f64_agrees_with_as_u64_for_every_unsigned_width(v in any::<u32>()) {
            let value = FieldValue::UInt32(v);
            prop_assert_eq!(value.as_f64(), Some(v as f64));
        }

        #[test]
        fn data_type_round_trips_through_every_variant(v in any::<u64>(), f in any::<f64>(), b in any::<bool>()) {
            prop_assert_eq!(FieldValue::UInt64(v).data_type(), DataType::UInt64);
            prop_assert_eq!(FieldValue::Float64(f).data_type(), DataType::Float64);
            prop_assert_eq!(FieldValue::Boolean(b).data_type(), DataType::Boolean);
        }
    }
}
