// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use nes_types::{ChunkNumber, OriginId, SequenceNumber};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

struct BufferedTask<T> {
    seq: u64,
    chunk: u32,
    last_chunk: bool,
    payload: T,
}

impl<T> PartialEq for BufferedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.seq, self.chunk) == (other.seq, other.chunk)
    }
}
impl<T> Eq for BufferedTask<T> {}
impl<T> PartialOrd for BufferedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for BufferedTask<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.seq, self.chunk).cmp(&(other.seq, other.chunk))
    }
}

#[derive(Default)]
struct OriginQueue<T> {
    next_seq: u64,
    expected_chunk: u32,
    buffered: BinaryHeap<Reverse<BufferedTask<T>>>,
}

/// Per-pipeline, per-origin dispatch order (spec §4.5 "Ordering"): a task is released
/// for execution only once every prior `(origin, seq, chunk)` pair for this pipeline
/// has already been released. Out-of-order arrivals sit in a min-heap keyed by
/// `(seq, chunk)` until their turn comes; `last_chunk=true` is what lets the cursor
/// advance to the next sequence number.
///
/// This is a dispatch-ordering analogue of `nes_sequencing`'s contiguous-prefix
/// tracking, applied here to arbitrary task payloads rather than watermark
/// timestamps, since the pipeline executor and the watermark processor advance on
/// independent cursors (a pipeline may dispatch a task before its watermark effects
/// are visible to `nes-sequencing`, and vice versa).
pub struct PipelineSequencer<T> {
    origins: Mutex<HashMap<OriginId, OriginQueue<T>>>,
}

impl<T> PipelineSequencer<T> {
    pub fn new() -> Self {
        Self { origins: Mutex::new(HashMap::new()) }
    }

    /// Submits one task for `origin` and returns every task now releasable, in
    /// dispatch order (possibly more than one, if buffered arrivals closed a gap).
    pub fn submit(&self, origin: OriginId, seq: SequenceNumber, chunk: ChunkNumber, last_chunk: bool, payload: T) -> Vec<T> {
        let mut origins = self.origins.lock();
        let queue = origins.entry(origin).or_default();
        queue.buffered.push(Reverse(BufferedTask {
            seq: seq.value(),
            chunk: chunk.value(),
            last_chunk,
            payload,
        }));

        let mut ready = Vec::new();
        while let Some(Reverse(top)) = queue.buffered.peek() {
            if top.seq != queue.next_seq || top.chunk != queue.expected_chunk {
                break;
            }
            let Reverse(task) = queue.buffered.pop().unwrap();
            if task.last_chunk {
                queue.next_seq += 1;
                queue.expected_chunk = 0;
            } else {
                queue.expected_chunk += 1;
            }
            ready.push(task.payload);
        }
        ready
    }

    pub fn pending_count(&self, origin: OriginId) -> usize {
        self.origins.lock().get(&origin).map(|q| q.buffered.len()).unwrap_or(0)
    }
}

impl<T> Default for PipelineSequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_arrivals_dispatch_immediately() {
        let sequencer: PipelineSequencer<&'static str> = PipelineSequencer::new();
        let origin = OriginId::new(0);
        let ready = sequencer.submit(origin, SequenceNumber::new(0), ChunkNumber::new(0), true, "a");
        assert_eq!(ready, vec!["a"]);
        let ready = sequencer.submit(origin, SequenceNumber::new(1), ChunkNumber::new(0), true, "b");
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn out_of_order_arrival_is_buffered_until_gap_closes() {
        let sequencer: PipelineSequencer<&'static str> = PipelineSequencer::new();
        let origin = OriginId::new(0);
        let ready = sequencer.submit(origin, SequenceNumber::new(1), ChunkNumber::new(0), true, "b");
        assert!(ready.is_empty(), "seq 1 must wait for seq 0");
        assert_eq!(sequencer.pending_count(origin), 1);

        let ready = sequencer.submit(origin, SequenceNumber::new(0), ChunkNumber::new(0), true, "a");
        assert_eq!(ready, vec!["a", "b"], "closing the gap releases both in order");
    }

    #[test]
    fn multi_chunk_sequence_releases_chunk_by_chunk() {
        let sequencer: PipelineSequencer<u32> = PipelineSequencer::new();
        let origin = OriginId::new(0);
        assert_eq!(sequencer.submit(origin, SequenceNumber::new(0), ChunkNumber::new(0), false, 10), vec![10]);
        assert_eq!(sequencer.submit(origin, SequenceNumber::new(0), ChunkNumber::new(2), true, 12), Vec::<u32>::new());
        assert_eq!(sequencer.submit(origin, SequenceNumber::new(0), ChunkNumber::new(1), false, 11), vec![11, 12]);
    }
}
