// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::slice::SlicePayload;
use crate::store::TriggeredWindow;
use nes_types::{FieldValue, Record};

/// Nested-loop join probe over one triggered window's slices (spec §4.6 "Stream join
/// (nested-loop variant)"). Scans every left record against every right record in the
/// window's slices, in `(leftSliceIndex, leftRecordIndex, rightSliceIndex,
/// rightRecordIndex)` order, which is the deterministic tie-break the spec requires.
///
/// Each side is snapshotted (cloned out from under its slice's lock) before the
/// cross product runs, so that a window whose left and right sides share a slice
/// never tries to re-lock that slice's payload mutex from within the scan.
pub fn probe_window(window: &TriggeredWindow, predicate: impl Fn(&Record, &Record) -> bool) -> Vec<Record> {
    let left_records = collect_side(window, Side::Left);
    let right_records = collect_side(window, Side::Right);

    let mut output = Vec::new();
    for left in &left_records {
        for right in &right_records {
            if predicate(left, right) {
                output.push(merge_joined_record(window.start, window.end, left, right));
            }
        }
    }
    output
}

enum Side {
    Left,
    Right,
}

fn collect_side(window: &TriggeredWindow, side: Side) -> Vec<Record> {
    let mut out = Vec::new();
    for slice in &window.slices {
        slice.with_payload(|payload| {
            let SlicePayload::Join { left, right } = payload else {
                return;
            };
            let paged = match side {
                Side::Left => &*left,
                Side::Right => &*right,
            };
            out.extend(paged.iter().cloned());
        });
    }
    out
}

fn merge_joined_record(window_start: u64, window_end: u64, left: &Record, right: &Record) -> Record {
    let mut joined = left.clone();
    joined.merge_skip_existing(right);
    joined.set("window_start", FieldValue::UInt64(window_start));
    joined.set("window_end", FieldValue::UInt64(window_end));
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::{Slice, SliceState};
    use std::sync::Arc;

    fn record(id: u64, value: u64) -> Record {
        let mut r = Record::new();
        r.set("id", FieldValue::UInt64(id));
        r.set("v", FieldValue::UInt64(value));
        r
    }

    #[test]
    fn probe_emits_matching_pairs_with_window_bounds() {
        let slice = Slice::new(0, 10, SlicePayload::join(8)).unwrap();
        slice.with_payload(|payload| {
            let SlicePayload::Join { left, right } = payload else { unreachable!() };
            left.push(record(1, 10));
            right.push(record(1, 100));
            right.push(record(1, 101));
            right.push(record(2, 200));
        });
        slice.advance_to(SliceState::Triggered);

        let window = TriggeredWindow { start: 0, end: 10, slices: vec![Arc::new(slice)] };
        let results = probe_window(&window, |l, r| l.get("id") == r.get("id"));

        assert_eq!(results.len(), 2);
        for record in &results {
            assert_eq!(record.get("window_start"), Some(&FieldValue::UInt64(0)));
            assert_eq!(record.get("v"), Some(&FieldValue::UInt64(10)));
        }
    }
}
