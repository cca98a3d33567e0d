// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::context::EngineContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::lifecycle::{QueryLifecycle, QuerySignals, QueryState};
use crate::pipeline::{Emission, Pipeline};
use crate::retry::RetryPolicy;
use crate::sequencer::PipelineSequencer;
use crate::source::{Source, SourceContext};
use crate::worker::{Task, WorkerId, WorkerPool};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use nes_buffer::LocalBufferPool;
use nes_sequencing::MultiOriginWatermarkProcessor;
use nes_types::{OriginId, PipelineId, QueryId, Record, Schema, SinkId, WatermarkTimestamp};
use nes_window::OperatorHandlerRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info};

/// One source's contribution to a plan: which pipeline receives its buffers.
pub struct SourcePlan {
    pub origin_id: OriginId,
    pub source: Arc<dyn Source>,
    pub target_pipeline: PipelineId,
}

/// A sink in a plan: only the id and which pipeline roots it. The channel that
/// actually carries its output is created at `register_query` time.
pub struct SinkSpec {
    pub id: SinkId,
    pub root_pipeline: PipelineId,
}

/// A fully assembled, not-yet-validated query plan (spec §4.7 `registerQuery`).
pub struct QueryPlan {
    pub pipelines: Vec<Pipeline>,
    pub operator_handlers: Arc<OperatorHandlerRegistry>,
    pub sources: Vec<SourcePlan>,
    pub sinks: Vec<SinkSpec>,
}

fn schema_compatible(upstream: &Schema, downstream: &Schema) -> bool {
    upstream.fields().len() == downstream.fields().len()
        && upstream
            .fields()
            .iter()
            .zip(downstream.fields())
            .all(|(a, b)| a.name == b.name && a.data_type == b.data_type)
}

/// Validates plan structure (spec §4.7): every downstream pipeline id must exist and
/// have a compatible schema, every source must target a known pipeline, and every
/// sink must have exactly one root pipeline.
fn validate_plan(plan: &QueryPlan) -> RuntimeResult<()> {
    let pipeline_ids: std::collections::HashSet<PipelineId> = plan.pipelines.iter().map(|p| p.id()).collect();

    for pipeline in &plan.pipelines {
        for &downstream_id in pipeline.downstream_pipelines() {
            let Some(downstream) = plan.pipelines.iter().find(|p| p.id() == downstream_id) else {
                return Err(RuntimeError::InvalidPlan(format!(
                    "pipeline {} references unknown downstream pipeline {downstream_id}",
                    pipeline.id()
                )));
            };
            if !schema_compatible(pipeline.output_schema(), downstream.input_schema()) {
                return Err(RuntimeError::SchemaMismatch {
                    pipeline: downstream_id,
                    reason: format!("edge from pipeline {} has an incompatible schema", pipeline.id()),
                });
            }
        }
    }

    for source in &plan.sources {
        if !pipeline_ids.contains(&source.target_pipeline) {
            return Err(RuntimeError::InvalidPlan(format!(
                "source for origin {:?} targets unknown pipeline {}",
                source.origin_id, source.target_pipeline
            )));
        }
    }

    for sink in &plan.sinks {
        let roots = plan.pipelines.iter().filter(|p| p.sink() == Some(sink.id)).count();
        if roots != 1 {
            return Err(RuntimeError::InvalidPlan(format!(
                "sink {} must have exactly one root pipeline, found {roots}",
                sink.id
            )));
        }
    }

    Ok(())
}

struct RunningQuery {
    query_id: QueryId,
    lifecycle: QueryLifecycle,
    signals: Arc<QuerySignals>,
    plan: QueryPlan,
    sequencers: HashMap<PipelineId, Arc<PipelineSequencer<Vec<Record>>>>,
    sink_senders: HashMap<SinkId, Sender<Vec<Record>>>,
    sink_receivers: Mutex<HashMap<SinkId, Receiver<Vec<Record>>>>,
    source_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Global watermark across every origin this query's sources declare (spec §4.4
    /// "Multi-origin processor"); stateful operators gate window triggering on this
    /// rather than any single origin's own progress.
    watermark_processor: MultiOriginWatermarkProcessor,
}

/// Status snapshot returned by `status()` (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatus {
    pub state: QueryState,
    pub error_message: Option<String>,
}

/// Runs a completed task's pipeline and routes whatever it emits: into a downstream
/// pipeline's sequencer (re-submitted to the same pool once released in order), or
/// onto a sink's channel if the emission targets a terminal pipeline (spec §4.5
/// "Pipeline stage execution" + §4.7 `drainSink`).
fn dispatch_ready_task(queries: &DashMap<QueryId, Arc<RunningQuery>>, context: &EngineContext, worker_pool: &WorkerPool, task: Task) {
    let Some(query) = queries.get(&task.query_id).map(|q| Arc::clone(&q)) else { return };
    let Some(pipeline) = query.plan.pipelines.iter().find(|p| p.id() == task.pipeline_id) else { return };

    let emissions = match pipeline.execute(task.records, task.watermark) {
        Ok(e) => e,
        Err(err) => {
            error!(query = %task.query_id, pipeline = %task.pipeline_id, error = %err, "pipeline execution failed");
            query.lifecycle.fail(err.to_string());
            return;
        }
    };

    for (target, emission) in emissions {
        let records = match emission {
            Emission::Record(r) => vec![r],
            Emission::Buffer(_) => continue,
        };

        if target == pipeline.id() {
            if let Some(sink_id) = pipeline.sink() {
                if let Some(sender) = query.sink_senders.get(&sink_id) {
                    let retry = RetryPolicy::from_config(&context.config);
                    let _ = retry.execute(&context.metrics, |_attempt| {
                        sender.send(records.clone()).map_err(|e| RuntimeError::SinkError(e.to_string()))
                    });
                }
                continue;
            }
        }

        let Some(sequencer) = query.sequencers.get(&target) else { continue };
        for ready in sequencer.submit(task.origin, task.seq, task.chunk, task.last_chunk, records) {
            let Some(guard) = query.signals.task_guard() else { break };
            worker_pool.submit(Task {
                query_id: task.query_id,
                pipeline_id: target,
                origin: task.origin,
                seq: task.seq,
                chunk: task.chunk,
                last_chunk: task.last_chunk,
                records: ready,
                watermark: task.watermark,
                guard: Some(guard),
            });
        }
    }
}

/// The engine exposes exactly the operations spec §4.7 lists to collaborators. One
/// `Engine` owns one process-wide worker pool (spec §9 "Global state ... passed
/// explicitly as dependencies") and a catalog of registered queries.
pub struct Engine {
    context: EngineContext,
    worker_pool: Arc<WorkerPool>,
    queries: Arc<DashMap<QueryId, Arc<RunningQuery>>>,
    next_query_id: AtomicU64,
}

impl Engine {
    pub fn new(context: EngineContext) -> Self {
        let queries: Arc<DashMap<QueryId, Arc<RunningQuery>>> = Arc::new(DashMap::new());
        let pool_slot: Arc<Mutex<Option<Arc<WorkerPool>>>> = Arc::new(Mutex::new(None));

        let dispatch_queries = Arc::clone(&queries);
        let dispatch_context = context.clone();
        let dispatch_pool_slot = Arc::clone(&pool_slot);

        let worker_pool = Arc::new(WorkerPool::start(
            context.config.resolved_worker_threads(),
            Arc::clone(&context.buffer_pool),
            context.config.local_pool_segments,
            Arc::clone(&context.metrics),
            Arc::new(move |task: Task, _worker: WorkerId, _local: &LocalBufferPool| {
                if let Some(pool) = dispatch_pool_slot.lock().unwrap().as_ref() {
                    dispatch_ready_task(&dispatch_queries, &dispatch_context, pool, task);
                }
            }),
        ));
        *pool_slot.lock().unwrap() = Some(Arc::clone(&worker_pool));

        Self { context, worker_pool, queries, next_query_id: AtomicU64::new(0) }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Validates and registers a plan, returning its new `queryId` (spec §4.7
    /// `registerQuery`).
    pub fn register_query(&self, plan: QueryPlan) -> RuntimeResult<QueryId> {
        validate_plan(&plan)?;

        let query_id = QueryId::new(self.next_query_id.fetch_add(1, Ordering::AcqRel));
        let lifecycle = QueryLifecycle::new(query_id);

        let sequencers = plan.pipelines.iter().map(|p| (p.id(), Arc::new(PipelineSequencer::new()))).collect();

        let mut sink_senders = HashMap::new();
        let mut sink_receivers = HashMap::new();
        for sink in &plan.sinks {
            let (tx, rx) = crossbeam_channel::unbounded();
            sink_senders.insert(sink.id, tx);
            sink_receivers.insert(sink.id, rx);
        }

        let signals = Arc::new(QuerySignals::new(move || {
            info!(?query_id, "query teardown complete");
        }));

        let origins: Vec<OriginId> = plan.sources.iter().map(|s| s.origin_id).collect();
        let watermark_processor = MultiOriginWatermarkProcessor::new(&origins);

        let running = Arc::new(RunningQuery {
            query_id,
            lifecycle,
            signals,
            plan,
            sequencers,
            sink_senders,
            sink_receivers: Mutex::new(sink_receivers),
            source_handles: Mutex::new(Vec::new()),
            watermark_processor,
        });
        running.lifecycle.setup()?;
        self.queries.insert(query_id, running);
        Ok(query_id)
    }

    /// Launches source threads (spec §4.7 `start`). A no-op if the query is already
    /// `Running`.
    pub fn start(&self, query_id: QueryId) -> RuntimeResult<()> {
        let query = self.query(query_id)?;
        if query.lifecycle.state() == QueryState::Running {
            return Ok(());
        }
        query.lifecycle.start()?;

        let mut handles = query.source_handles.lock().unwrap();
        for source_plan in &query.plan.sources {
            let Some(guard) = query.signals.task_guard() else { continue };
            let local_pool = self.context.buffer_pool.detach_local(self.context.config.local_pool_segments);
            let backpressure = Arc::new(crate::backpressure::Backpressure::new(self.context.config.backpressure_high_watermark));
            let worker_pool = Arc::clone(&self.worker_pool);
            let signals = Arc::clone(&query.signals);
            let source = Arc::clone(&source_plan.source);
            let origin_id = source_plan.origin_id;
            let target_pipeline = source_plan.target_pipeline;
            let sequencer = Arc::clone(&query.sequencers[&target_pipeline]);
            let input_schema = query
                .plan
                .pipelines
                .iter()
                .find(|p| p.id() == target_pipeline)
                .map(|p| p.input_schema().clone())
                .expect("validate_plan already checked every source targets a known pipeline");
            let watermark_query = Arc::clone(&query);

            let handle = std::thread::Builder::new()
                .name(format!("nes-source-{query_id}-{origin_id}"))
                .spawn(move || {
                    let _guard = guard;
                    let worker_pool_for_emit = Arc::clone(&worker_pool);
                    let signals_for_emit = Arc::clone(&signals);
                    let ctx = SourceContext::new(
                        origin_id,
                        local_pool,
                        Arc::clone(&signals),
                        backpressure,
                        {
                            let worker_pool = Arc::clone(&worker_pool);
                            move || worker_pool.queue_depth()
                        },
                        move |buffer| {
                            let records = match decode_buffer_records(&buffer, &input_schema) {
                                Ok(records) => records,
                                Err(err) => {
                                    error!(error = %err, origin = ?origin_id, "failed to decode buffer into records");
                                    return;
                                }
                            };
                            let watermark = watermark_query.watermark_processor.update_watermark(
                                origin_id,
                                buffer.sequence_number(),
                                buffer.chunk_number(),
                                buffer.last_chunk(),
                                buffer.watermark_ts(),
                            );
                            let ready = sequencer.submit(origin_id, buffer.sequence_number(), buffer.chunk_number(), buffer.last_chunk(), records);
                            for ready_records in ready {
                                let Some(task_guard) = signals_for_emit.task_guard() else { break };
                                worker_pool_for_emit.submit(Task {
                                    query_id,
                                    pipeline_id: target_pipeline,
                                    origin: origin_id,
                                    seq: buffer.sequence_number(),
                                    chunk: buffer.chunk_number(),
                                    last_chunk: buffer.last_chunk(),
                                    records: ready_records,
                                    watermark,
                                    guard: Some(task_guard),
                                });
                            }
                        },
                    );
                    if let Err(e) = source.run(&ctx) {
                        error!(error = %e, origin = ?origin_id, "source failed");
                    }
                })
                .expect("failed to spawn source thread");
            handles.push(handle);
        }
        Ok(())
    }

    /// Idempotent stop (spec §4.7 `stop`, §8 "stop(q); stop(q)"). Signals cancellation
    /// and blocks until every in-flight task/source guard has dropped.
    pub fn stop(&self, query_id: QueryId) -> RuntimeResult<()> {
        let query = self.query(query_id)?;
        query.lifecycle.stop()?;
        query.signals.request_stop();
        let mut handles = query.source_handles.lock().unwrap();
        for handle in handles.drain(..) {
            handle.join().ok();
        }
        Ok(())
    }

    pub fn status(&self, query_id: QueryId) -> RuntimeResult<QueryStatus> {
        let query = self.query(query_id)?;
        Ok(QueryStatus { state: query.lifecycle.state(), error_message: query.lifecycle.error_message() })
    }

    /// Streams output batches from one sink until its channel closes (spec §4.7
    /// `drainSink`). Runs `consumer` on the calling thread; call from a dedicated
    /// thread for a non-blocking drain.
    pub fn drain_sink(&self, query_id: QueryId, sink_id: SinkId, mut consumer: impl FnMut(Vec<Record>)) -> RuntimeResult<()> {
        let query = self.query(query_id)?;
        let receiver = query
            .sink_receivers
            .lock()
            .unwrap()
            .remove(&sink_id)
            .ok_or_else(|| RuntimeError::InvalidPlan(format!("no sink {sink_id} on query {query_id}")))?;
        for batch in receiver.iter() {
            consumer(batch);
        }
        Ok(())
    }

    /// Externally driven ingestion path, bypassing a `Source` thread (spec §4.7
    /// `submitBuffer`). Each call is treated as its own complete, single-chunk
    /// sequence for `origin_id`.
    pub fn submit_buffer(&self, query_id: QueryId, origin_id: OriginId, pipeline_id: PipelineId, records: Vec<Record>) -> RuntimeResult<()> {
        let query = self.query(query_id)?;
        if query.lifecycle.state() != QueryState::Running {
            return Err(RuntimeError::LifecycleViolation { query: query_id, from: "non-Running", to: "submitBuffer" });
        }
        let Some(guard) = query.signals.task_guard() else {
            return Ok(());
        };
        let sequencer = query
            .sequencers
            .get(&pipeline_id)
            .ok_or_else(|| RuntimeError::InvalidPlan(format!("unknown pipeline {pipeline_id}")))?;
        let seq = nes_types::SequenceNumber::new(0);
        let chunk = nes_types::ChunkNumber::new(0);
        let watermark = query
            .watermark_processor
            .update_watermark(origin_id, seq, chunk, true, WatermarkTimestamp::new(0));
        for ready in sequencer.submit(origin_id, seq, chunk, true, records) {
            self.worker_pool.submit(Task {
                query_id,
                pipeline_id,
                origin: origin_id,
                seq,
                chunk,
                last_chunk: true,
                records: ready,
                watermark,
                guard: Some(guard.clone()),
            });
        }
        Ok(())
    }

    fn query(&self, query_id: QueryId) -> RuntimeResult<Arc<RunningQuery>> {
        self.queries.get(&query_id).map(|q| Arc::clone(&q)).ok_or(RuntimeError::UnknownQuery(query_id))
    }
}

/// Decodes every tuple in `buffer` into a `Record`, resolving each field's address
/// through `schema`'s memory layout (spec §4.5 "Pipeline stage execution" consumes
/// records, not raw buffers; the boundary between the two is this decode step).
fn decode_buffer_records(buffer: &nes_buffer::TupleBuffer, schema: &Schema) -> RuntimeResult<Vec<Record>> {
    let tuple_count = buffer.tuple_count() as usize;
    let mut records = Vec::with_capacity(tuple_count);
    for record_index in 0..tuple_count {
        let mut record = Record::new();
        for (field_index, field) in schema.fields().iter().enumerate() {
            let value = buffer.read_field(schema, record_index, field_index)?;
            record.set(field.name.as_str(), value);
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::Pipeline;
    use nes_types::{DataType, Layout};

    fn schema() -> Schema {
        Schema::new(Layout::Row, &[("v", DataType::UInt64)])
    }

    fn test_engine() -> Engine {
        let mut config = EngineConfig::default();
        config.worker_threads = 1;
        config.buffer_pool_bytes = 4096 * 4;
        config.buffer_size_bytes = 4096;
        Engine::new(EngineContext::new(config))
    }

    #[test]
    fn register_query_rejects_unknown_downstream_pipeline() {
        let engine = test_engine();
        let pipeline = Pipeline::new(
            PipelineId::new(0),
            schema(),
            schema(),
            vec![],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![PipelineId::new(99)],
            None,
        );
        let plan = QueryPlan {
            pipelines: vec![pipeline],
            operator_handlers: Arc::new(OperatorHandlerRegistry::new()),
            sources: vec![],
            sinks: vec![],
        };
        assert!(matches!(engine.register_query(plan), Err(RuntimeError::InvalidPlan(_))));
    }

    #[test]
    fn register_query_rejects_sink_with_no_root_pipeline() {
        let engine = test_engine();
        let pipeline = Pipeline::new(
            PipelineId::new(0),
            schema(),
            schema(),
            vec![],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![],
            None,
        );
        let plan = QueryPlan {
            pipelines: vec![pipeline],
            operator_handlers: Arc::new(OperatorHandlerRegistry::new()),
            sources: vec![],
            sinks: vec![SinkSpec { id: SinkId::new(0), root_pipeline: PipelineId::new(0) }],
        };
        assert!(matches!(engine.register_query(plan), Err(RuntimeError::InvalidPlan(_))));
    }

    #[test]
    fn lifecycle_round_trips_through_register_start_stop() {
        let engine = test_engine();
        let pipeline = Pipeline::new(
            PipelineId::new(0),
            schema(),
            schema(),
            vec![],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![],
            Some(SinkId::new(0)),
        );
        let plan = QueryPlan {
            pipelines: vec![pipeline],
            operator_handlers: Arc::new(OperatorHandlerRegistry::new()),
            sources: vec![],
            sinks: vec![SinkSpec { id: SinkId::new(0), root_pipeline: PipelineId::new(0) }],
        };
        let query_id = engine.register_query(plan).unwrap();
        assert_eq!(engine.status(query_id).unwrap().state, QueryState::Deployed);
        engine.start(query_id).unwrap();
        assert_eq!(engine.status(query_id).unwrap().state, QueryState::Running);
        engine.stop(query_id).unwrap();
        assert_eq!(engine.status(query_id).unwrap().state, QueryState::Stopped);
        engine.stop(query_id).unwrap();
    }

    #[test]
    fn end_to_end_query_drains_generated_source_output_through_sink() {
        let engine = test_engine();
        let sink_id = SinkId::new(0);
        let pipeline = Pipeline::new(
            PipelineId::new(0),
            schema(),
            schema(),
            vec![],
            Arc::new(OperatorHandlerRegistry::new()),
            vec![],
            Some(sink_id),
        );
        let source = Arc::new(crate::source::GeneratedSource::new(schema(), 5, "v"));
        let plan = QueryPlan {
            pipelines: vec![pipeline],
            operator_handlers: Arc::new(OperatorHandlerRegistry::new()),
            sources: vec![SourcePlan { origin_id: OriginId::new(0), source, target_pipeline: PipelineId::new(0) }],
            sinks: vec![SinkSpec { id: sink_id, root_pipeline: PipelineId::new(0) }],
        };
        let query_id = engine.register_query(plan).unwrap();
        engine.start(query_id).unwrap();

        let mut seen = Vec::new();
        engine
            .drain_sink(query_id, sink_id, |records| {
                assert_eq!(records.len(), 1);
                seen.push(records[0].get("v").and_then(nes_types::FieldValue::as_u64).unwrap());
            })
            .unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4], "every generated tuple's actual field value reached the sink");
        engine.stop(query_id).unwrap();
    }
}
