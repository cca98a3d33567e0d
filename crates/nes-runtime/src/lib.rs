// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pipeline executor: the process that turns a registered query plan into running
//! source threads, ordered pipeline dispatch on a shared worker pool, and drainable
//! sink output (spec §4.5, §4.7).

mod backpressure;
mod config;
mod context;
mod engine;
mod error;
mod lifecycle;
mod metrics;
mod operators;
mod pipeline;
mod retry;
mod sequencer;
mod source;
mod worker;

pub use backpressure::Backpressure;
pub use config::EngineConfig;
pub use context::EngineContext;
pub use engine::{Engine, QueryPlan, QueryStatus, SinkSpec, SourcePlan};
pub use error::{RuntimeError, RuntimeResult};
pub use lifecycle::{QueryLifecycle, QuerySignals, QueryState};
pub use metrics::Metrics;
pub use operators::{JoinBuildOperator, WindowAggregateOperator};
pub use pipeline::{Emission, Operator, Pipeline, PipelineContext};
pub use retry::RetryPolicy;
pub use sequencer::PipelineSequencer;
pub use source::{CsvFileSource, GeneratedSource, Source, SourceContext};
pub use worker::{Task, WorkerId, WorkerPool};
