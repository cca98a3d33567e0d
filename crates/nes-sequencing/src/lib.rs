// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod multi_origin;
mod seq_queue;

pub use multi_origin::{MultiOriginWatermarkProcessor, OriginWatermarkSnapshot};
pub use seq_queue::NonBlockingMonotonicSeqQueue;
