// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{bail, Context, Result};
use nes_runtime::{CsvFileSource, GeneratedSource, JoinBuildOperator, Operator, Pipeline, QueryPlan, SinkSpec, Source, SourcePlan, WindowAggregateOperator};
use nes_types::{DataType, Layout, OriginId, PipelineId, Schema, SinkId};
use nes_window::{AggregateOp, JoinHandler, JoinSide, OperatorHandler, OperatorHandlerRegistry, WindowAggregationHandler, WindowKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// On-disk JSON form of a plan (spec §6 "Plan is a structured message with ..."),
/// trimmed to what this illustrative CLI can assemble into a runnable `QueryPlan`.
/// A production wire format would carry compiled operator stages; this one only
/// supports the identity pipeline plus the two bundled source kinds, enough to drive
/// `submit`/`stop`/`status` end to end.
#[derive(Deserialize)]
pub struct PlanFile {
    pub pipelines: Vec<PipelineFile>,
    #[serde(default)]
    pub sources: Vec<SourceFile>,
    #[serde(default)]
    pub sinks: Vec<u32>,
    /// Named, shareable operator state (spec §3.1 "OperatorHandler"). A join's two
    /// build-side operators reference the same entry by id so they push into one
    /// shared `JoinHandler`.
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
}

#[derive(Deserialize)]
pub struct PipelineFile {
    pub id: u32,
    pub input_schema: SchemaFile,
    pub output_schema: SchemaFile,
    #[serde(default)]
    pub downstream: Vec<u32>,
    pub sink: Option<u32>,
    #[serde(default)]
    pub operators: Vec<OperatorFile>,
}

#[derive(Deserialize)]
pub struct SchemaFile {
    pub layout: String,
    pub fields: Vec<(String, String)>,
}

#[derive(Deserialize)]
pub struct WindowFile {
    pub kind: String,
    pub size_ms: u64,
    pub slide_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerEntry {
    WindowAggregate {
        id: String,
        window: WindowFile,
        op: String,
        #[serde(default)]
        group_by: Option<String>,
    },
    Join {
        id: String,
        window: WindowFile,
        left_key: String,
        right_key: String,
        #[serde(default = "default_join_page_size")]
        page_size: usize,
    },
}

fn default_join_page_size() -> usize {
    256
}

/// An operator attached to a pipeline, referencing a `HandlerEntry` by id for
/// whatever shared state it needs (spec §3.1 "Stateful operators access their
/// handler via an index").
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorFile {
    WindowAggregate {
        handler: String,
        value_field: String,
        time_field: String,
        downstream: u32,
    },
    JoinBuild {
        handler: String,
        side: String,
        time_field: String,
        downstream: u32,
        #[serde(default)]
        emits_output: bool,
    },
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFile {
    Generated { origin_id: u64, target_pipeline: u32, schema: SchemaFile, count: u64 },
    Csv { origin_id: u64, target_pipeline: u32, schema: SchemaFile, path: String, delimiter: Option<char> },
}

fn parse_data_type(name: &str) -> Result<DataType> {
    Ok(match name {
        "int8" => DataType::Int8,
        "int16" => DataType::Int16,
        "int32" => DataType::Int32,
        "int64" => DataType::Int64,
        "uint8" => DataType::UInt8,
        "uint16" => DataType::UInt16,
        "uint32" => DataType::UInt32,
        "uint64" => DataType::UInt64,
        "float32" => DataType::Float32,
        "float64" => DataType::Float64,
        "boolean" | "bool" => DataType::Boolean,
        "varsized" | "string" => DataType::VarSized,
        other => bail!("unknown data type '{other}'"),
    })
}

fn build_window_kind(file: &WindowFile) -> Result<WindowKind> {
    Ok(match file.kind.as_str() {
        "tumbling" => WindowKind::Tumbling { size_ms: file.size_ms },
        "sliding" => WindowKind::Sliding {
            size_ms: file.size_ms,
            slide_ms: file.slide_ms.context("sliding window requires 'slide_ms'")?,
        },
        other => bail!("unknown window kind '{other}'"),
    })
}

fn parse_aggregate_op(name: &str) -> Result<AggregateOp> {
    Ok(match name {
        "sum" => AggregateOp::Sum,
        "count" => AggregateOp::Count,
        "min" => AggregateOp::Min,
        "max" => AggregateOp::Max,
        "avg" => AggregateOp::Avg,
        "median" => AggregateOp::Median,
        other => bail!("unknown aggregate op '{other}'"),
    })
}

fn parse_join_side(name: &str) -> Result<JoinSide> {
    Ok(match name {
        "left" => JoinSide::Left,
        "right" => JoinSide::Right,
        other => bail!("unknown join side '{other}' (expected 'left' or 'right')"),
    })
}

/// A named handler as loaded from the plan file, kept behind its concrete type so
/// `OperatorFile` entries can be matched against the handler kind they expect.
enum NamedHandler {
    WindowAggregate(Arc<WindowAggregationHandler>),
    Join(Arc<JoinHandler>),
}

fn build_schema(file: &SchemaFile) -> Result<Schema> {
    let layout = match file.layout.as_str() {
        "row" => Layout::Row,
        "columnar" => Layout::Columnar,
        other => bail!("unknown layout '{other}'"),
    };
    let fields: Vec<(&str, DataType)> = file
        .fields
        .iter()
        .map(|(name, ty)| parse_data_type(ty).map(|dt| (name.as_str(), dt)))
        .collect::<Result<_>>()?;
    Ok(Schema::new(layout, &fields))
}

/// Parses and assembles a `QueryPlan` from a JSON file on disk. Schema/plan
/// validation beyond this (edges, sinks) is the engine's job at `register_query`.
pub fn load_plan(path: &Path) -> Result<QueryPlan> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading plan file {}", path.display()))?;
    let file: PlanFile = serde_json::from_str(&raw).context("parsing plan JSON")?;

    let mut registry = OperatorHandlerRegistry::new();
    let mut named_handlers: HashMap<String, NamedHandler> = HashMap::new();
    for entry in &file.handlers {
        match entry {
            HandlerEntry::WindowAggregate { id, window, op, group_by } => {
                let window_kind = build_window_kind(window)?;
                let agg = parse_aggregate_op(op)?;
                let handler = Arc::new(match group_by {
                    Some(field) => WindowAggregationHandler::keyed(window_kind, agg, field.clone()),
                    None => WindowAggregationHandler::non_keyed(window_kind, agg),
                });
                registry.register(Arc::clone(&handler) as Arc<dyn OperatorHandler>);
                if named_handlers.insert(id.clone(), NamedHandler::WindowAggregate(handler)).is_some() {
                    bail!("duplicate handler id '{id}'");
                }
            }
            HandlerEntry::Join { id, window, left_key, right_key, page_size } => {
                let window_kind = build_window_kind(window)?;
                let handler = Arc::new(JoinHandler::new(window_kind, *page_size, left_key.clone(), right_key.clone()));
                registry.register(Arc::clone(&handler) as Arc<dyn OperatorHandler>);
                if named_handlers.insert(id.clone(), NamedHandler::Join(handler)).is_some() {
                    bail!("duplicate handler id '{id}'");
                }
            }
        }
    }
    let operator_handlers = Arc::new(registry);

    let mut pipelines = Vec::with_capacity(file.pipelines.len());
    for p in &file.pipelines {
        let mut operators: Vec<Arc<dyn Operator>> = Vec::with_capacity(p.operators.len());
        for op in &p.operators {
            let operator: Arc<dyn Operator> = match op {
                OperatorFile::WindowAggregate { handler, value_field, time_field, downstream } => {
                    let Some(NamedHandler::WindowAggregate(handler)) = named_handlers.get(handler) else {
                        bail!("operator references unknown or mismatched window-aggregate handler '{handler}'");
                    };
                    Arc::new(WindowAggregateOperator::new(
                        Arc::clone(handler),
                        value_field.clone(),
                        time_field.clone(),
                        PipelineId::new(*downstream),
                    ))
                }
                OperatorFile::JoinBuild { handler, side, time_field, downstream, emits_output } => {
                    let Some(NamedHandler::Join(handler)) = named_handlers.get(handler) else {
                        bail!("operator references unknown or mismatched join handler '{handler}'");
                    };
                    Arc::new(JoinBuildOperator::new(
                        Arc::clone(handler),
                        parse_join_side(side)?,
                        time_field.clone(),
                        PipelineId::new(*downstream),
                        *emits_output,
                    ))
                }
            };
            operators.push(operator);
        }

        pipelines.push(Pipeline::new(
            PipelineId::new(p.id),
            build_schema(&p.input_schema)?,
            build_schema(&p.output_schema)?,
            operators,
            Arc::clone(&operator_handlers),
            p.downstream.iter().map(|&id| PipelineId::new(id)).collect(),
            p.sink.map(SinkId::new),
        ));
    }

    let mut sources = Vec::with_capacity(file.sources.len());
    for s in &file.sources {
        let (origin_id, target_pipeline, source): (u64, u32, Arc<dyn Source>) = match s {
            SourceFile::Generated { origin_id, target_pipeline, schema, count } => {
                (*origin_id, *target_pipeline, Arc::new(GeneratedSource::new(build_schema(schema)?, *count, "value")))
            }
            SourceFile::Csv { origin_id, target_pipeline, schema, path, delimiter } => (
                *origin_id,
                *target_pipeline,
                Arc::new(CsvFileSource::new(path, build_schema(schema)?, delimiter.unwrap_or(','))),
            ),
        };
        sources.push(SourcePlan { origin_id: OriginId::new(origin_id), source, target_pipeline: PipelineId::new(target_pipeline) });
    }

    let sinks = file.sinks.iter().map(|&id| SinkSpec { id: SinkId::new(id), root_pipeline: PipelineId::new(0) }).collect();

    Ok(QueryPlan { pipelines, operator_handlers: Arc::new(OperatorHandlerRegistry::new()), sources, sinks })
}
