// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::RuntimeResult;
use nes_buffer::TupleBuffer;
use nes_types::{PipelineId, Record, Schema, SinkId, WatermarkTimestamp};
use nes_window::OperatorHandlerRegistry;
use std::cell::RefCell;
use std::sync::Arc;

/// One unit of output a pipeline stage hands to its context: either a fully decoded
/// record (for pipelines that reshuffle row-by-row) or a whole buffer (for pipelines
/// that pass data through unchanged, spec §4.5 "ctx.emitBuffer").
pub enum Emission {
    Record(Record),
    Buffer(TupleBuffer),
}

/// Given to a stage's generated `execute` function (spec §4.5 "The context provides
/// access to operator handlers by index"). Collects emissions addressed to
/// downstream pipelines; the worker that drives `Pipeline::execute` is responsible
/// for actually dispatching them.
pub struct PipelineContext<'a> {
    pipeline_id: PipelineId,
    handlers: &'a OperatorHandlerRegistry,
    watermark: WatermarkTimestamp,
    emitted: RefCell<Vec<(PipelineId, Emission)>>,
}

impl<'a> PipelineContext<'a> {
    fn new(pipeline_id: PipelineId, handlers: &'a OperatorHandlerRegistry, watermark: WatermarkTimestamp) -> Self {
        Self { pipeline_id, handlers, watermark, emitted: RefCell::new(Vec::new()) }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn handlers(&self) -> &OperatorHandlerRegistry {
        self.handlers
    }

    /// The multi-origin global watermark in effect for this batch (spec §4.4), the
    /// same value every stateful operator in this pipeline must use to decide which
    /// windows are now safe to trigger.
    pub fn watermark(&self) -> WatermarkTimestamp {
        self.watermark
    }

    pub fn emit(&self, target_pipeline: PipelineId, record: Record) {
        self.emitted.borrow_mut().push((target_pipeline, Emission::Record(record)));
    }

    pub fn emit_buffer(&self, target_pipeline: PipelineId, buffer: TupleBuffer) {
        self.emitted.borrow_mut().push((target_pipeline, Emission::Buffer(buffer)));
    }

    fn take_emissions(self) -> Vec<(PipelineId, Emission)> {
        self.emitted.into_inner()
    }
}

/// A stateless transform within a pipeline: a generated function of signature
/// `execute(ctx, record)` (spec §4.5). Operators reach shared state through
/// `ctx.handlers()` by index rather than holding it directly.
pub trait Operator: Send + Sync {
    fn process(&self, ctx: &PipelineContext, record: Record) -> RuntimeResult<Option<Record>>;
}

/// An ordered chain of stateless transforms plus a terminal fan-out to downstream
/// pipelines or a sink (spec §4.5 "Pipeline stage execution"). Each record that
/// survives every operator is handed to every downstream pipeline listed in the
/// plan's edges; a pipeline with no downstream pipelines and a `sink` is terminal.
pub struct Pipeline {
    id: PipelineId,
    input_schema: Schema,
    output_schema: Schema,
    operators: Vec<Arc<dyn Operator>>,
    operator_handlers: Arc<OperatorHandlerRegistry>,
    downstream_pipelines: Vec<PipelineId>,
    sink: Option<SinkId>,
}

impl Pipeline {
    pub fn new(
        id: PipelineId,
        input_schema: Schema,
        output_schema: Schema,
        operators: Vec<Arc<dyn Operator>>,
        operator_handlers: Arc<OperatorHandlerRegistry>,
        downstream_pipelines: Vec<PipelineId>,
        sink: Option<SinkId>,
    ) -> Self {
        Self { id, input_schema, output_schema, operators, operator_handlers, downstream_pipelines, sink }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    pub fn downstream_pipelines(&self) -> &[PipelineId] {
        &self.downstream_pipelines
    }

    pub fn sink(&self) -> Option<SinkId> {
        self.sink
    }

    pub fn is_terminal(&self) -> bool {
        self.sink.is_some()
    }

    /// Runs every record through the operator chain and collects what survives,
    /// addressed to this pipeline's downstream targets. A terminal pipeline's
    /// survivors are returned alongside (caller routes them to the sink).
    pub fn execute(&self, records: Vec<Record>, watermark: WatermarkTimestamp) -> RuntimeResult<Vec<(PipelineId, Emission)>> {
        let ctx = PipelineContext::new(self.id, &self.operator_handlers, watermark);
        for record in records {
            let mut current = Some(record);
            for op in &self.operators {
                current = match current {
                    Some(r) => op.process(&ctx, r)?,
                    None => None,
                };
            }
            if let Some(r) = current {
                for &downstream in &self.downstream_pipelines {
                    ctx.emit(downstream, r.clone());
                }
                if self.downstream_pipelines.is_empty() {
                    ctx.emit(self.id, r);
                }
            }
        }
        Ok(ctx.take_emissions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nes_types::{DataType, FieldValue, Layout};

    struct Double;
    impl Operator for Double {
        fn process(&self, _ctx: &PipelineContext, mut record: Record) -> RuntimeResult<Option<Record>> {
            if let Some(FieldValue::UInt64(v)) = record.get("v").cloned() {
                record.set("v", FieldValue::UInt64(v * 2));
            }
            Ok(Some(record))
        }
    }

    struct DropOdd;
    impl Operator for DropOdd {
        fn process(&self, _ctx: &PipelineContext, record: Record) -> RuntimeResult<Option<Record>> {
            match record.get("v") {
                Some(FieldValue::UInt64(v)) if v % 2 == 1 => Ok(None),
                _ => Ok(Some(record)),
            }
        }
    }

    fn schema() -> Schema {
        Schema::new(Layout::Row, &[("v", DataType::UInt64)])
    }

    #[test]
    fn chained_operators_transform_and_filter_records() {
        let pipeline = Pipeline::new(
            PipelineId::new(0),
            schema(),
            schema(),
            vec![Arc::new(DropOdd), Arc::new(Double)],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![PipelineId::new(1)],
            None,
        );

        let mut r1 = Record::new();
        r1.set("v", FieldValue::UInt64(3));
        let mut r2 = Record::new();
        r2.set("v", FieldValue::UInt64(4));

        let emitted = pipeline.execute(vec![r1, r2], WatermarkTimestamp::new(0)).unwrap();
        assert_eq!(emitted.len(), 1, "the odd record was dropped before doubling");
        let (target, Emission::Record(record)) = &emitted[0] else { panic!("expected a record emission") };
        assert_eq!(*target, PipelineId::new(1));
        assert_eq!(record.get("v"), Some(&FieldValue::UInt64(8)));
    }

    #[test]
    fn terminal_pipeline_emits_to_itself_for_sink_routing() {
        let pipeline = Pipeline::new(
            PipelineId::new(2),
            schema(),
            schema(),
            vec![],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![],
            Some(SinkId::new(0)),
        );
        let mut record = Record::new();
        record.set("v", FieldValue::UInt64(1));
        let emitted = pipeline.execute(vec![record], WatermarkTimestamp::new(0)).unwrap();
        assert_eq!(emitted.len(), 1);
        assert!(pipeline.is_terminal());
    }
}
