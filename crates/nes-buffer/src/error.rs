// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use nes_types::DataType;
use thiserror::Error;

/// Errors raised by the buffer pool and arena (spec §7 taxonomy, the slice owned by
/// `nes-buffer`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("cannot allocate unpooled buffer of {requested_bytes} bytes")]
    CannotAllocateBuffer { requested_bytes: usize },

    #[error("field index {field_index} out of range for a schema with {field_count} fields")]
    FieldIndexOutOfRange { field_index: usize, field_count: usize },

    #[error("field {field_index} expects a {expected:?} value, got a {actual:?} value")]
    FieldTypeMismatch {
        field_index: usize,
        expected: DataType,
        actual: DataType,
    },

    #[error("buffer too small: offset {offset} + {len} bytes exceeds capacity {capacity}")]
    BufferTooSmall {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("child buffer index {child_index} has no attached buffer")]
    MissingChildBuffer { child_index: usize },
}

pub type BufferResult<T> = Result<T, BufferError>;
