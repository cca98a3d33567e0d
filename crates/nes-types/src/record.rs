// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::FieldValue;
use std::collections::HashMap;

/// A field identifier: either a pre-resolved index (fast path, set by a caller that
/// already bound against a `Schema`) or a name to hash-lookup (spec §9 "field
/// identifiers are strings ... or integers if the caller pre-resolves").
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldId {
    Index(usize),
    Name(String),
}

impl From<usize> for FieldId {
    fn from(index: usize) -> Self {
        FieldId::Index(index)
    }
}

impl From<&str> for FieldId {
    fn from(name: &str) -> Self {
        FieldId::Name(name.to_string())
    }
}

/// An ephemeral field-identifier -> value mapping, alive only for the duration of a
/// task's execution (spec §3.1).
#[derive(Clone, Debug, Default)]
pub struct Record {
    values: HashMap<FieldId, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: impl Into<FieldId>, value: FieldValue) {
        self.values.insert(field.into(), value);
    }

    pub fn get(&self, field: impl Into<FieldId>) -> Option<&FieldValue> {
        self.values.get(&field.into())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&FieldId, &FieldValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merges `other`'s fields into `self`, skipping any field already present —
    /// used by the stream join to union left/right records without duplicating
    /// shared fields (spec §4.6 "skipping any field already present in the other
    /// side's schema").
    pub fn merge_skip_existing(&mut self, other: &Record) {
        for (field, value) in &other.values {
            self.values.entry(field.clone()).or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_resolves_by_name_or_index() {
        let mut record = Record::new();
        record.set("k", FieldValue::UInt64(1));
        record.set(1usize, FieldValue::UInt64(2));
        assert_eq!(record.get("k"), Some(&FieldValue::UInt64(1)));
        assert_eq!(record.get(1usize), Some(&FieldValue::UInt64(2)));
        assert_eq!(record.get("missing"), None);
    }

    #[test]
    fn merge_skip_existing_keeps_left_side_on_conflict() {
        let mut left = Record::new();
        left.set("id", FieldValue::UInt64(1));
        let mut right = Record::new();
        right.set("id", FieldValue::UInt64(99));
        right.set("rv", FieldValue::UInt64(7));

        left.merge_skip_existing(&right);

        assert_eq!(left.get("id"), Some(&FieldValue::UInt64(1)));
        assert_eq!(left.get("rv"), Some(&FieldValue::UInt64(7)));
    }
}
