// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::RuntimeResult;
use crate::pipeline::{Operator, PipelineContext};
use nes_types::{FieldValue, PipelineId, Record};
use nes_window::{JoinHandler, JoinSide, OperatorHandler, Slice, SliceCache, TriggeredWindow, WindowAggregationHandler};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Per-operator slice-cache capacity (spec §4.6 "Slice caches"). Small, since a
/// pipeline stage only ever touches the handful of slices its currently open windows
/// span.
const SLICE_CACHE_CAPACITY: usize = 8;

/// Resolves the slice for `ts`, checking `cache` before falling back to the
/// handler's store (spec §4.6 "avoiding a store lookup for consecutive tuples likely
/// to land in the same slice").
fn slice_for(handler: &dyn OperatorHandler, cache: &Mutex<SliceCache>, ts: u64) -> Arc<Slice> {
    if let Some(slice) = cache.lock().lookup(ts) {
        return slice;
    }
    let slice = handler.store().get_or_create_slice_for(ts);
    cache.lock().insert(Arc::clone(&slice));
    slice
}

/// Dedupes a handler's triggerable windows against ones this operator instance has
/// already finalized, since `SliceStore::triggerable_windows` is documented safe to
/// call repeatedly and returns the same window again until its slices are garbage
/// collected (spec §4.6 "callers are responsible for not re-emitting a (start, end)
/// pair they have already processed"). Also reclaims every slice the new watermark
/// fully dominates, so the store does not grow without bound over a long-running
/// query.
fn drain_new_windows(handler: &dyn OperatorHandler, watermark: u64, emitted: &Mutex<HashSet<(u64, u64)>>) -> Vec<TriggeredWindow> {
    let mut emitted = emitted.lock();
    let fresh: Vec<_> = handler
        .triggerable_windows(watermark)
        .into_iter()
        .filter(|w| emitted.insert((w.start, w.end)))
        .collect();
    handler.garbage_collect(watermark);
    fresh
}

/// Feeds records into a windowed aggregation handler and emits each window's
/// finalized output downstream as soon as the pipeline's current multi-origin
/// watermark (spec §4.4, exposed via `ctx.watermark()`) reaches the window's end
/// (spec §4.6 "Window trigger model").
pub struct WindowAggregateOperator {
    handler: Arc<WindowAggregationHandler>,
    value_field: String,
    time_field: String,
    downstream: PipelineId,
    emitted_windows: Mutex<HashSet<(u64, u64)>>,
    slice_cache: Mutex<SliceCache>,
}

impl WindowAggregateOperator {
    pub fn new(handler: Arc<WindowAggregationHandler>, value_field: impl Into<String>, time_field: impl Into<String>, downstream: PipelineId) -> Self {
        Self {
            handler,
            value_field: value_field.into(),
            time_field: time_field.into(),
            downstream,
            emitted_windows: Mutex::new(HashSet::new()),
            slice_cache: Mutex::new(SliceCache::new(SLICE_CACHE_CAPACITY)),
        }
    }
}

impl Operator for WindowAggregateOperator {
    fn process(&self, ctx: &PipelineContext, record: Record) -> RuntimeResult<Option<Record>> {
        let Some(ts) = record.get(self.time_field.as_str()).and_then(FieldValue::as_u64) else {
            return Ok(None);
        };
        let slice = slice_for(self.handler.as_ref(), &self.slice_cache, ts);
        self.handler.ingest(&slice, &self.value_field, &record);

        let fresh = drain_new_windows(self.handler.as_ref(), ctx.watermark().value(), &self.emitted_windows);
        for output in self.handler.finalize(fresh) {
            ctx.emit(self.downstream, output);
        }
        Ok(None)
    }
}

/// One build side of a streaming join: pushes every record it sees into a shared
/// `JoinHandler`'s slices and, on the side configured to drain output, probes and
/// emits joined windows (spec §4.6 "Stream join (nested-loop variant)"). Pairing one
/// `JoinBuildOperator` per side against the same `Arc<JoinHandler>`, with only one
/// side's `emits_output` set, avoids double-emitting a window that both sides'
/// records could otherwise trip independently.
pub struct JoinBuildOperator {
    handler: Arc<JoinHandler>,
    side: JoinSide,
    time_field: String,
    downstream: PipelineId,
    emits_output: bool,
    emitted_windows: Mutex<HashSet<(u64, u64)>>,
    slice_cache: Mutex<SliceCache>,
}

impl JoinBuildOperator {
    pub fn new(handler: Arc<JoinHandler>, side: JoinSide, time_field: impl Into<String>, downstream: PipelineId, emits_output: bool) -> Self {
        Self {
            handler,
            side,
            time_field: time_field.into(),
            downstream,
            emits_output,
            emitted_windows: Mutex::new(HashSet::new()),
            slice_cache: Mutex::new(SliceCache::new(SLICE_CACHE_CAPACITY)),
        }
    }
}

impl Operator for JoinBuildOperator {
    fn process(&self, ctx: &PipelineContext, record: Record) -> RuntimeResult<Option<Record>> {
        let Some(ts) = record.get(self.time_field.as_str()).and_then(FieldValue::as_u64) else {
            return Ok(None);
        };
        let slice = slice_for(self.handler.as_ref(), &self.slice_cache, ts);
        self.handler.push(&slice, self.side, record);

        if self.emits_output {
            let fresh = drain_new_windows(self.handler.as_ref(), ctx.watermark().value(), &self.emitted_windows);
            for output in self.handler.finalize(fresh) {
                ctx.emit(self.downstream, output);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Emission, Pipeline};
    use nes_types::{DataType, Layout, Schema, SinkId, WatermarkTimestamp};
    use nes_window::{AggregateOp, OperatorHandlerRegistry, WindowKind};

    fn schema() -> Schema {
        Schema::new(Layout::Row, &[("k", DataType::UInt64), ("v", DataType::UInt64), ("ts", DataType::UInt64)])
    }

    fn record(k: u64, v: u64, ts: u64) -> Record {
        let mut r = Record::new();
        r.set("k", FieldValue::UInt64(k));
        r.set("v", FieldValue::UInt64(v));
        r.set("ts", FieldValue::UInt64(ts));
        r
    }

    #[test]
    fn window_aggregate_operator_emits_once_a_later_record_trips_the_window() {
        let handler = Arc::new(WindowAggregationHandler::non_keyed(WindowKind::Tumbling { size_ms: 10 }, AggregateOp::Sum));
        let downstream = PipelineId::new(1);
        let op = WindowAggregateOperator::new(handler, "v", "ts", downstream);
        let pipeline = Pipeline::new(
            PipelineId::new(0),
            schema(),
            schema(),
            vec![Arc::new(op)],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![],
            Some(SinkId::new(0)),
        );

        // One record per call, each stamped with its own watermark, mirrors how a
        // single-tuple source buffer reaches the pipeline in the real engine.
        let mut emitted = pipeline.execute(vec![record(0, 3, 1)], WatermarkTimestamp::new(1)).unwrap();
        emitted.extend(pipeline.execute(vec![record(0, 4, 5)], WatermarkTimestamp::new(5)).unwrap());
        emitted.extend(pipeline.execute(vec![record(0, 1, 11)], WatermarkTimestamp::new(11)).unwrap());

        let window_emissions: Vec<_> = emitted
            .iter()
            .filter(|(target, _)| *target == downstream)
            .collect();
        assert_eq!(window_emissions.len(), 1, "only the watermark crossing 10 trips [0,10)");
        let (_, Emission::Record(output)) = &window_emissions[0] else { panic!("expected a record emission") };
        assert_eq!(output.get("value"), Some(&FieldValue::Float64(7.0)));
    }

    #[test]
    fn window_aggregate_operator_never_emits_the_same_window_twice() {
        let handler = Arc::new(WindowAggregationHandler::non_keyed(WindowKind::Tumbling { size_ms: 10 }, AggregateOp::Sum));
        let downstream = PipelineId::new(1);
        let op = WindowAggregateOperator::new(handler, "v", "ts", downstream);
        let pipeline = Pipeline::new(
            PipelineId::new(0),
            schema(),
            schema(),
            vec![Arc::new(op)],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![],
            Some(SinkId::new(0)),
        );

        let mut emitted = pipeline.execute(vec![record(0, 3, 1)], WatermarkTimestamp::new(1)).unwrap();
        emitted.extend(pipeline.execute(vec![record(0, 1, 11)], WatermarkTimestamp::new(11)).unwrap());
        emitted.extend(pipeline.execute(vec![record(0, 1, 12)], WatermarkTimestamp::new(12)).unwrap());
        let window_emissions = emitted.iter().filter(|(target, _)| *target == downstream).count();
        assert_eq!(window_emissions, 1, "the second post-window record must not re-emit [0,10)");
    }
}
