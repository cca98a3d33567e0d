// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::protocol::{Request, Response};
use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Sends one request to a running daemon and returns `(exit_code, response)`.
pub fn send(socket_path: &Path, request: &Request) -> Result<(i32, Response)> {
    let mut stream = UnixStream::connect(socket_path)
        .with_context(|| format!("connecting to nes-cli daemon at {}", socket_path.display()))?;
    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    stream.write_all(payload.as_bytes())?;
    stream.flush()?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    if line.trim().is_empty() {
        bail!("daemon closed the connection without a response");
    }
    let response: Response = serde_json::from_str(line.trim())?;
    let exit_code = match &response {
        Response::Error { exit_code, .. } => *exit_code,
        _ => 0,
    };
    Ok((exit_code, response))
}
