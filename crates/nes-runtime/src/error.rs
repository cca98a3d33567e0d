// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use nes_types::{PipelineId, QueryId};
use thiserror::Error;

/// Errors raised by the pipeline executor and its external interfaces (spec §7
/// taxonomy, the slice owned by `nes-runtime`). `LateRecordDropped` is deliberately
/// not a variant here: the spec calls it "informational, not an error", so it is
/// surfaced as a metrics counter instead (see `metrics::Metrics::late_records_dropped`).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("buffer pool: {0}")]
    Buffer(#[from] nes_buffer::BufferError),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("schema mismatch on edge into pipeline {pipeline}: {reason}")]
    SchemaMismatch { pipeline: PipelineId, reason: String },

    #[error("source error: {0}")]
    SourceError(String),

    #[error("sink error: {0}")]
    SinkError(String),

    #[error("operator error: {0}")]
    OperatorError(String),

    #[error("unknown query {0}")]
    UnknownQuery(QueryId),

    #[error("illegal lifecycle transition for query {query}: {from} -> {to}")]
    LifecycleViolation { query: QueryId, from: &'static str, to: &'static str },
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
