// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use nes_types::FieldValue;

/// A hashable, totally-ordered projection of one or more `FieldValue`s, used as the
/// key in a keyed aggregation's hash map (spec §4.6 "a hash map `key ->
/// partialAggregate`"). `FieldValue` itself cannot derive `Eq`/`Hash` because of its
/// float variants, so floats are keyed by bit pattern here instead.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey(Vec<KeyPart>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum KeyPart {
    Signed(i64),
    Unsigned(u64),
    Bool(bool),
    FloatBits(u64),
    Bytes(Vec<u8>),
}

impl From<&FieldValue> for KeyPart {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Int8(v) => KeyPart::Signed(*v as i64),
            FieldValue::Int16(v) => KeyPart::Signed(*v as i64),
            FieldValue::Int32(v) => KeyPart::Signed(*v as i64),
            FieldValue::Int64(v) => KeyPart::Signed(*v),
            FieldValue::UInt8(v) => KeyPart::Unsigned(*v as u64),
            FieldValue::UInt16(v) => KeyPart::Unsigned(*v as u64),
            FieldValue::UInt32(v) => KeyPart::Unsigned(*v as u64),
            FieldValue::UInt64(v) => KeyPart::Unsigned(*v),
            FieldValue::Float32(v) => KeyPart::FloatBits(v.to_bits() as u64),
            FieldValue::Float64(v) => KeyPart::FloatBits(v.to_bits()),
            FieldValue::Boolean(v) => KeyPart::Bool(*v),
            FieldValue::VarSized(bytes) => KeyPart::Bytes(bytes.clone()),
        }
    }
}

impl GroupKey {
    pub fn from_values(values: &[FieldValue]) -> Self {
        GroupKey(values.iter().map(KeyPart::from).collect())
    }

    pub fn single(value: &FieldValue) -> Self {
        GroupKey(vec![KeyPart::from(value)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_produce_equal_keys() {
        let a = GroupKey::single(&FieldValue::UInt64(7));
        let b = GroupKey::single(&FieldValue::UInt64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn different_values_produce_different_keys() {
        let a = GroupKey::single(&FieldValue::UInt64(7));
        let b = GroupKey::single(&FieldValue::UInt64(8));
        assert_ne!(a, b);
    }
}
