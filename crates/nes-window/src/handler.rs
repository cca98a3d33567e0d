// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::aggregation::{AggregateOp, PartialAggregate};
use crate::join::probe_window;
use crate::key::GroupKey;
use crate::slice::{Slice, SlicePayload};
use crate::store::{PayloadKind, SliceStore, TriggeredWindow, WindowKind};
use nes_types::{FieldValue, OperatorHandlerIndex, Record};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

/// Long-lived shared state for a stateful operator (spec §3.1 "OperatorHandler").
/// Owned by the query plan; pipelines reach it through `OperatorHandlerIndex` rather
/// than holding a direct pointer, per spec §9 "cyclic references avoided". An open
/// trait rather than one concrete struct, since window aggregation and stream join
/// need distinct ingest/finalize behavior over the same slice-triggering machinery.
pub trait OperatorHandler: Send + Sync {
    fn index(&self) -> OperatorHandlerIndex;

    /// Assigned exactly once, by `OperatorHandlerRegistry::register`, before the
    /// handler is shared across threads.
    fn set_index(&self, index: OperatorHandlerIndex);

    fn store(&self) -> &SliceStore;

    /// Produces this handler's output records for a batch of already-triggered
    /// windows (spec §4.6 "emit"). Implementations decide how a window's member
    /// slices combine into output.
    fn finalize(&self, windows: Vec<TriggeredWindow>) -> Vec<Record>;

    fn triggerable_windows(&self, global_watermark: u64) -> Vec<TriggeredWindow> {
        self.store().triggerable_windows(global_watermark)
    }

    fn garbage_collect(&self, global_watermark: u64) -> usize {
        self.store().garbage_collect(global_watermark)
    }
}

/// Windowed aggregation handler (spec §4.6 "Keyed aggregation" / "Non-keyed
/// aggregation"): non-keyed when `group_by` is `None`, keyed otherwise.
pub struct WindowAggregationHandler {
    index: Cell<OperatorHandlerIndex>,
    store: SliceStore,
    op: AggregateOp,
    group_by: Option<String>,
    /// `GroupKey` deliberately drops the source `FieldValue` (see `key.rs`), so a
    /// representative value per key is kept here to restamp onto emitted records.
    key_values: Mutex<HashMap<GroupKey, FieldValue>>,
}

// SAFETY: `index` is written exactly once, from `set_index`, before the handler is
// wrapped in an `Arc` and shared across worker threads.
unsafe impl Sync for WindowAggregationHandler {}

impl WindowAggregationHandler {
    pub fn non_keyed(window: WindowKind, op: AggregateOp) -> Self {
        Self {
            index: Cell::new(OperatorHandlerIndex::new(0)),
            store: SliceStore::new(window, PayloadKind::NonKeyed(op)),
            op,
            group_by: None,
            key_values: Mutex::new(HashMap::new()),
        }
    }

    pub fn keyed(window: WindowKind, op: AggregateOp, group_by: impl Into<String>) -> Self {
        Self {
            index: Cell::new(OperatorHandlerIndex::new(0)),
            store: SliceStore::new(window, PayloadKind::Keyed(op)),
            op,
            group_by: Some(group_by.into()),
            key_values: Mutex::new(HashMap::new()),
        }
    }

    /// Folds `record`'s `value_field` into `slice`'s partial aggregate (spec §4.6
    /// "applying the aggregate's combine function"). `slice` must have come from this
    /// handler's own `store()`.
    pub fn ingest(&self, slice: &Arc<Slice>, value_field: &str, record: &Record) {
        let Some(value) = record.get(value_field) else {
            return;
        };
        match &self.group_by {
            None => slice.with_payload(|payload| {
                if let SlicePayload::NonKeyed { op, partial } = payload {
                    op.combine(partial, value);
                }
            }),
            Some(group_field) => {
                let Some(key_value) = record.get(group_field.as_str()) else {
                    return;
                };
                let key = GroupKey::single(key_value);
                self.key_values
                    .lock()
                    .entry(key.clone())
                    .or_insert_with(|| key_value.clone());
                slice.with_payload(|payload| {
                    if let SlicePayload::Keyed { op, partials } = payload {
                        let entry = partials.entry(key).or_insert_with(|| op.identity());
                        op.combine(entry, value);
                    }
                });
            }
        }
    }
}

impl OperatorHandler for WindowAggregationHandler {
    fn index(&self) -> OperatorHandlerIndex {
        self.index.get()
    }

    fn set_index(&self, index: OperatorHandlerIndex) {
        self.index.set(index);
    }

    fn store(&self) -> &SliceStore {
        &self.store
    }

    fn finalize(&self, windows: Vec<TriggeredWindow>) -> Vec<Record> {
        let key_values = self.key_values.lock();
        windows
            .into_iter()
            .flat_map(|window| match &self.group_by {
                None => {
                    let mut merged = self.op.identity();
                    for slice in &window.slices {
                        slice.with_payload(|payload| {
                            if let SlicePayload::NonKeyed { partial, .. } = payload {
                                merged = self.op.merge(&merged, partial);
                            }
                        });
                    }
                    let mut record = Record::new();
                    record.set("window_start", FieldValue::UInt64(window.start));
                    record.set("window_end", FieldValue::UInt64(window.end));
                    record.set("value", FieldValue::Float64(self.op.finalize(&merged)));
                    vec![record]
                }
                Some(group_field) => {
                    let mut merged: HashMap<GroupKey, PartialAggregate> = HashMap::new();
                    for slice in &window.slices {
                        slice.with_payload(|payload| {
                            if let SlicePayload::Keyed { partials, .. } = payload {
                                for (key, partial) in partials.iter() {
                                    merged
                                        .entry(key.clone())
                                        .and_modify(|existing| *existing = self.op.merge(existing, partial))
                                        .or_insert_with(|| partial.clone());
                                }
                            }
                        });
                    }
                    merged
                        .into_iter()
                        .map(|(key, partial)| {
                            let mut record = Record::new();
                            record.set("window_start", FieldValue::UInt64(window.start));
                            record.set("window_end", FieldValue::UInt64(window.end));
                            if let Some(key_value) = key_values.get(&key) {
                                record.set(group_field.as_str(), key_value.clone());
                            }
                            record.set("value", FieldValue::Float64(self.op.finalize(&partial)));
                            record
                        })
                        .collect()
                }
            })
            .collect()
    }
}

/// Which build side of a stream join an incoming record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

/// Symmetric hash/nested-loop join handler (spec §4.6 "Stream join (nested-loop
/// variant)"), driving `probe_window` once its window's slices have triggered.
pub struct JoinHandler {
    index: Cell<OperatorHandlerIndex>,
    store: SliceStore,
    left_key: String,
    right_key: String,
}

// SAFETY: see `WindowAggregationHandler`'s identical justification above.
unsafe impl Sync for JoinHandler {}

impl JoinHandler {
    pub fn new(window: WindowKind, page_size: usize, left_key: impl Into<String>, right_key: impl Into<String>) -> Self {
        Self {
            index: Cell::new(OperatorHandlerIndex::new(0)),
            store: SliceStore::new(window, PayloadKind::Join { page_size }),
            left_key: left_key.into(),
            right_key: right_key.into(),
        }
    }

    /// Appends `record` to `slice`'s left or right build side.
    pub fn push(&self, slice: &Arc<Slice>, side: JoinSide, record: Record) {
        slice.with_payload(|payload| {
            if let SlicePayload::Join { left, right } = payload {
                match side {
                    JoinSide::Left => left.push(record),
                    JoinSide::Right => right.push(record),
                }
            }
        });
    }
}

impl OperatorHandler for JoinHandler {
    fn index(&self) -> OperatorHandlerIndex {
        self.index.get()
    }

    fn set_index(&self, index: OperatorHandlerIndex) {
        self.index.set(index);
    }

    fn store(&self) -> &SliceStore {
        &self.store
    }

    fn finalize(&self, windows: Vec<TriggeredWindow>) -> Vec<Record> {
        let left_key = self.left_key.as_str();
        let right_key = self.right_key.as_str();
        windows
            .iter()
            .flat_map(|window| probe_window(window, |l, r| l.get(left_key) == r.get(right_key)))
            .collect()
    }
}

/// Bag of operator handlers indexed the way a query plan references them (spec §3.1
/// "Pipeline ... Stateful operators access their handler via an index").
#[derive(Default)]
pub struct OperatorHandlerRegistry {
    handlers: Vec<Arc<dyn OperatorHandler>>,
}

impl OperatorHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn OperatorHandler>) -> OperatorHandlerIndex {
        let index = OperatorHandlerIndex::new(self.handlers.len());
        handler.set_index(index);
        self.handlers.push(handler);
        index
    }

    pub fn get(&self, index: OperatorHandlerIndex) -> Option<Arc<dyn OperatorHandler>> {
        self.handlers.get(index.value()).cloned()
    }

    pub fn handlers(&self) -> &[Arc<dyn OperatorHandler>] {
        &self.handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateOp;

    #[test]
    fn registry_hands_back_the_same_handler_by_index() {
        let mut registry = OperatorHandlerRegistry::new();
        let handler = Arc::new(WindowAggregationHandler::non_keyed(
            WindowKind::Tumbling { size_ms: 10 },
            AggregateOp::Sum,
        ));
        let index = registry.register(handler);
        assert!(registry.get(index).is_some());
        assert!(registry.get(OperatorHandlerIndex::new(99)).is_none());
    }

    #[test]
    fn non_keyed_aggregation_ingests_and_finalizes_a_triggered_window() {
        let handler = WindowAggregationHandler::non_keyed(WindowKind::Tumbling { size_ms: 10 }, AggregateOp::Sum);
        for v in [3u64, 4, 5] {
            let slice = handler.store().get_or_create_slice_for(v);
            let mut record = Record::new();
            record.set("v", FieldValue::UInt64(v));
            handler.ingest(&slice, "v", &record);
        }
        let windows = handler.triggerable_windows(10);
        let output = handler.finalize(windows);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].get("value"), Some(&FieldValue::Float64(12.0)));
    }

    #[test]
    fn keyed_aggregation_emits_one_record_per_group_with_its_key_restamped() {
        let handler = WindowAggregationHandler::keyed(WindowKind::Tumbling { size_ms: 10 }, AggregateOp::Sum, "k");
        for (k, v) in [(1u64, 10u64), (1, 20), (2, 5)] {
            let slice = handler.store().get_or_create_slice_for(0);
            let mut record = Record::new();
            record.set("k", FieldValue::UInt64(k));
            record.set("v", FieldValue::UInt64(v));
            handler.ingest(&slice, "v", &record);
        }
        let windows = handler.triggerable_windows(10);
        let mut output = handler.finalize(windows);
        output.sort_by_key(|r| r.get("k").and_then(FieldValue::as_u64).unwrap());
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].get("k"), Some(&FieldValue::UInt64(1)));
        assert_eq!(output[0].get("value"), Some(&FieldValue::Float64(30.0)));
        assert_eq!(output[1].get("k"), Some(&FieldValue::UInt64(2)));
        assert_eq!(output[1].get("value"), Some(&FieldValue::Float64(5.0)));
    }

    #[test]
    fn join_handler_probes_matching_keys_across_its_triggered_window() {
        let handler = JoinHandler::new(WindowKind::Tumbling { size_ms: 10 }, 8, "id", "id");
        let slice = handler.store().get_or_create_slice_for(0);
        let mut left = Record::new();
        left.set("id", FieldValue::UInt64(1));
        let mut right = Record::new();
        right.set("id", FieldValue::UInt64(1));
        handler.push(&slice, JoinSide::Left, left);
        handler.push(&slice, JoinSide::Right, right);

        let windows = handler.triggerable_windows(10);
        let output = handler.finalize(windows);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].get("window_start"), Some(&FieldValue::UInt64(0)));
    }
}
