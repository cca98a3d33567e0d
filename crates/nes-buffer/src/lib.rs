// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod arena;
mod error;
mod pool;
mod tuple_buffer;

pub use arena::Arena;
pub use error::{BufferError, BufferResult};
pub use pool::{BufferPool, LocalBufferPool};
pub use tuple_buffer::TupleBuffer;
