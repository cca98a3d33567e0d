// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod client;
mod daemon;
mod plan;
mod protocol;

use anyhow::Result;
use clap::{Parser, Subcommand};
use protocol::{Request, Response};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "nes-cli", about = "Illustrative CLI for the pipeline executor's external interface (spec §6)")]
struct Cli {
    /// Unix domain socket the daemon listens on and clients connect to.
    #[arg(long, global = true, default_value = "/tmp/nes-engine.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the long-lived engine process that `submit`/`stop`/`status` talk to.
    Serve,
    /// Registers and starts a query from a plan file; prints its queryId on success.
    Submit { plan_file: PathBuf },
    /// Requests a query stop; exits 0 if it transitioned or was already terminal.
    Stop { query_id: u64 },
    /// Prints a query's `{state, lastError?}`.
    Status { query_id: u64 },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result: Result<u8> = match cli.command {
        Command::Serve => daemon::run(&cli.socket).map(|()| 0),
        Command::Submit { plan_file } => submit(&cli.socket, &plan_file),
        Command::Stop { query_id } => stop(&cli.socket, query_id),
        Command::Status { query_id } => status(&cli.socket, query_id),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(3)
        }
    }
}

fn submit(socket: &std::path::Path, plan_file: &std::path::Path) -> Result<u8> {
    let plan_path = plan_file.canonicalize().unwrap_or_else(|_| plan_file.to_path_buf());
    let request = Request::Submit { plan_path: plan_path.display().to_string() };
    let (exit_code, response) = client::send(socket, &request)?;
    match response {
        Response::Submitted { query_id } => {
            println!("{query_id}");
            Ok(0)
        }
        Response::Error { message, .. } => {
            eprintln!("{message}");
            Ok(exit_code as u8)
        }
        _ => unreachable!("daemon only replies Submitted/Error to a Submit request"),
    }
}

fn stop(socket: &std::path::Path, query_id: u64) -> Result<u8> {
    let (exit_code, response) = client::send(socket, &Request::Stop { query_id })?;
    match response {
        Response::Stopped => Ok(0),
        Response::Error { message, .. } => {
            eprintln!("{message}");
            Ok(exit_code as u8)
        }
        _ => unreachable!("daemon only replies Stopped/Error to a Stop request"),
    }
}

fn status(socket: &std::path::Path, query_id: u64) -> Result<u8> {
    let (exit_code, response) = client::send(socket, &Request::Status { query_id })?;
    match response {
        Response::Status { state, last_error } => {
            let body = serde_json::json!({ "state": state, "lastError": last_error });
            println!("{body}");
            Ok(0)
        }
        Response::Error { message, .. } => {
            eprintln!("{message}");
            Ok(exit_code as u8)
        }
        _ => unreachable!("daemon only replies Status/Error to a Status request"),
    }
}
