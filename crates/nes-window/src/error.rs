// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised by the window state engine (spec §7 taxonomy, the slice owned by
/// `nes-window`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("malformed slice range [{start}, {end})")]
    MalformedSliceRange { start: u64, end: u64 },
    #[error("unknown operator handler index {0}")]
    UnknownOperatorHandlerIndex(usize),
}

pub type WindowResult<T> = Result<T, WindowError>;
