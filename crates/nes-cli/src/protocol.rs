// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use nes_runtime::{QueryState, RuntimeError};
use serde::{Deserialize, Serialize};

/// One line of newline-delimited JSON sent from `nes-cli` to a running `nes-cli serve`
/// daemon over a Unix domain socket (spec §6 "Wire format (between collaborators and
/// core)", specialized here to the illustrative CLI's own client/server pair rather
/// than the network source/sink wire format, which `nes-runtime` itself implements).
#[derive(Serialize, Deserialize)]
pub enum Request {
    Submit { plan_path: String },
    Stop { query_id: u64 },
    Status { query_id: u64 },
}

#[derive(Serialize, Deserialize)]
pub enum Response {
    Submitted { query_id: u64 },
    Stopped,
    Status { state: String, last_error: Option<String> },
    Error { message: String, exit_code: i32 },
}

/// Exit codes from spec §6: 0 success, 1 validation failure, 2 runtime failure, 3
/// protocol error.
pub fn exit_code_for(err: &RuntimeError) -> i32 {
    match err {
        RuntimeError::InvalidPlan(_) | RuntimeError::SchemaMismatch { .. } => 1,
        RuntimeError::SourceError(_) | RuntimeError::SinkError(_) | RuntimeError::OperatorError(_) | RuntimeError::Buffer(_) => 2,
        RuntimeError::UnknownQuery(_) | RuntimeError::LifecycleViolation { .. } => 3,
    }
}

pub fn state_name(state: QueryState) -> &'static str {
    match state {
        QueryState::Created => "Created",
        QueryState::Deployed => "Deployed",
        QueryState::Running => "Running",
        QueryState::Stopped => "Stopped",
        QueryState::Finished => "Finished",
        QueryState::ErrorState => "ErrorState",
    }
}
