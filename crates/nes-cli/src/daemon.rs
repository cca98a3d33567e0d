// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::plan::load_plan;
use crate::protocol::{exit_code_for, state_name, Request, Response};
use nes_runtime::{Engine, EngineConfig, EngineContext};
use nes_types::QueryId;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs the illustrative `nes-cli serve` daemon: one process-wide `Engine`, one
/// worker pool, any number of registered queries, reachable by later `submit`/
/// `stop`/`status` invocations over a Unix domain socket (spec §6's `submit`/`stop`/
/// `status` are separate invocations, which only makes sense against a long-lived
/// process holding engine state between them).
pub fn run(socket_path: &Path) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    let engine = Arc::new(Engine::new(EngineContext::new(EngineConfig::from_env())));
    info!(socket = %socket_path.display(), "nes-cli daemon listening");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            if let Err(e) = handle_connection(&engine, stream) {
                error!(error = %e, "connection handler failed");
            }
        });
    }
    Ok(())
}

fn handle_connection(engine: &Engine, mut stream: UnixStream) -> anyhow::Result<()> {
    let mut line = String::new();
    BufReader::new(stream.try_clone()?).read_line(&mut line)?;
    let request: Request = serde_json::from_str(line.trim())?;

    let response = match request {
        Request::Submit { plan_path } => match load_plan(Path::new(&plan_path)) {
            Ok(plan) => match engine.register_query(plan) {
                Ok(query_id) => match engine.start(query_id) {
                    Ok(()) => Response::Submitted { query_id: query_id.value() },
                    Err(e) => Response::Error { message: e.to_string(), exit_code: exit_code_for(&e) },
                },
                Err(e) => Response::Error { message: e.to_string(), exit_code: exit_code_for(&e) },
            },
            Err(e) => Response::Error { message: e.to_string(), exit_code: 1 },
        },
        Request::Stop { query_id } => match engine.stop(QueryId::new(query_id)) {
            Ok(()) => Response::Stopped,
            Err(e) => Response::Error { message: e.to_string(), exit_code: exit_code_for(&e) },
        },
        Request::Status { query_id } => match engine.status(QueryId::new(query_id)) {
            Ok(status) => Response::Status { state: state_name(status.state).to_string(), last_error: status.error_message },
            Err(e) => Response::Error { message: e.to_string(), exit_code: exit_code_for(&e) },
        },
    };

    let payload = serde_json::to_string(&response)?;
    stream.write_all(payload.as_bytes())?;
    stream.write_all(b"\n")?;
    Ok(())
}
