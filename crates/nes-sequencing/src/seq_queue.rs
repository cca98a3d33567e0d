// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use nes_types::{ChunkNumber, SequenceNumber, WatermarkTimestamp};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct PendingSeq {
    received_chunks: HashSet<u32>,
    last_chunk_number: Option<u32>,
    max_timestamp: u64,
}

impl PendingSeq {
    fn is_complete(&self) -> bool {
        match self.last_chunk_number {
            Some(last) => (0..=last).all(|chunk| self.received_chunks.contains(&chunk)),
            None => false,
        }
    }
}

struct Inner {
    pending: HashMap<u64, PendingSeq>,
    next_expected_seq: u64,
}

/// Tracks the largest contiguous prefix of sequence numbers whose chunks have all
/// arrived, exposing the timestamp attached to that prefix as a monotonically
/// non-decreasing watermark (spec §4.4 "per-origin queue").
///
/// Insertion is commutative in arrival order: replaying the same set of
/// `(seq, chunk, last_chunk, timestamp)` tuples in any order converges to the same
/// watermark, which is what makes [`Self::restore`] safe to call with an unordered
/// snapshot.
pub struct NonBlockingMonotonicSeqQueue {
    inner: Mutex<Inner>,
    watermark_ts: AtomicU64,
}

impl NonBlockingMonotonicSeqQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                next_expected_seq: 0,
            }),
            watermark_ts: AtomicU64::new(0),
        }
    }

    /// Records one chunk of a sequence number and advances the watermark as far as
    /// the newly contiguous prefix allows. Returns the updated watermark.
    pub fn update(
        &self,
        sequence_number: SequenceNumber,
        chunk_number: ChunkNumber,
        last_chunk: bool,
        timestamp: WatermarkTimestamp,
    ) -> WatermarkTimestamp {
        let mut inner = self.inner.lock();
        let seq = sequence_number.value();
        if seq < inner.next_expected_seq {
            // Already folded into the watermark; a duplicate or retransmitted chunk.
            return self.current_watermark();
        }

        let entry = inner.pending.entry(seq).or_default();
        entry.received_chunks.insert(chunk_number.value());
        entry.max_timestamp = entry.max_timestamp.max(timestamp.value());
        if last_chunk {
            entry.last_chunk_number = Some(chunk_number.value());
        }

        loop {
            let Some(state) = inner.pending.get(&inner.next_expected_seq) else {
                break;
            };
            if !state.is_complete() {
                break;
            }
            let ts = state.max_timestamp;
            inner.pending.remove(&inner.next_expected_seq);
            inner.next_expected_seq += 1;
            self.watermark_ts.store(ts, Ordering::Release);
        }

        self.current_watermark()
    }

    pub fn current_watermark(&self) -> WatermarkTimestamp {
        WatermarkTimestamp::new(self.watermark_ts.load(Ordering::Acquire))
    }

    /// Flattens still-pending (not yet contiguous) chunk arrivals into tuples for
    /// checkpointing (spec §4.4 "Serialisation"). Each tuple carries the timestamp
    /// that chunk was stamped with, so that replaying them in any order reconstructs
    /// the exact same pending state the original arrival order produced — a
    /// necessary addition to the host header's `(seq, lastChunk, numChunks)` triple,
    /// since watermark timestamps are per-chunk, not derivable from counts alone.
    pub fn serialize_pending(&self) -> Vec<(SequenceNumber, ChunkNumber, bool, WatermarkTimestamp)> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for (&seq, state) in &inner.pending {
            for &chunk in &state.received_chunks {
                let is_last = state.last_chunk_number == Some(chunk);
                out.push((
                    SequenceNumber::new(seq),
                    ChunkNumber::new(chunk),
                    is_last,
                    WatermarkTimestamp::new(state.max_timestamp),
                ));
            }
        }
        out
    }

    /// Replays a checkpointed snapshot. Order of `tuples` does not matter; the
    /// baseline watermark/next-expected-seq must be restored first via
    /// [`Self::restore_baseline`].
    pub fn restore(&self, tuples: &[(SequenceNumber, ChunkNumber, bool, WatermarkTimestamp)]) {
        for &(seq, chunk, last_chunk, ts) in tuples {
            self.update(seq, chunk, last_chunk, ts);
        }
    }

    /// Sets the already-advanced baseline (watermark timestamp and next expected
    /// sequence number) before replaying pending triples via [`Self::restore`].
    pub fn restore_baseline(&self, next_expected_seq: SequenceNumber, watermark_ts: WatermarkTimestamp) {
        let mut inner = self.inner.lock();
        inner.next_expected_seq = next_expected_seq.value();
        self.watermark_ts.store(watermark_ts.value(), Ordering::Release);
    }

    pub fn next_expected_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.lock().next_expected_seq)
    }
}

impl Default for NonBlockingMonotonicSeqQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_chunk_sequences_advance_in_order() {
        let queue = NonBlockingMonotonicSeqQueue::new();
        let wm = queue.update(SequenceNumber::new(0), ChunkNumber::new(0), true, WatermarkTimestamp::new(10));
        assert_eq!(wm, WatermarkTimestamp::new(10));
        let wm = queue.update(SequenceNumber::new(1), ChunkNumber::new(0), true, WatermarkTimestamp::new(20));
        assert_eq!(wm, WatermarkTimestamp::new(20));
    }

    #[test]
    fn out_of_order_arrival_holds_watermark_until_gap_fills() {
        let queue = NonBlockingMonotonicSeqQueue::new();
        // seq 1 arrives before seq 0: watermark must not advance yet.
        let wm = queue.update(SequenceNumber::new(1), ChunkNumber::new(0), true, WatermarkTimestamp::new(20));
        assert_eq!(wm, WatermarkTimestamp::new(0));

        let wm = queue.update(SequenceNumber::new(0), ChunkNumber::new(0), true, WatermarkTimestamp::new(10));
        assert_eq!(wm, WatermarkTimestamp::new(20), "both seq 0 and 1 now complete");
    }

    #[test]
    fn multi_chunk_sequence_needs_all_chunks_before_advancing() {
        let queue = NonBlockingMonotonicSeqQueue::new();
        queue.update(SequenceNumber::new(0), ChunkNumber::new(0), false, WatermarkTimestamp::new(5));
        let wm = queue.update(SequenceNumber::new(0), ChunkNumber::new(2), true, WatermarkTimestamp::new(15));
        assert_eq!(wm, WatermarkTimestamp::new(0), "chunk 1 missing");

        let wm = queue.update(SequenceNumber::new(0), ChunkNumber::new(1), false, WatermarkTimestamp::new(9));
        assert_eq!(wm, WatermarkTimestamp::new(15));
    }

    #[test]
    fn restore_is_commutative_on_replay_order() {
        let forward = NonBlockingMonotonicSeqQueue::new();
        forward.update(SequenceNumber::new(1), ChunkNumber::new(0), false, WatermarkTimestamp::new(1));
        forward.update(SequenceNumber::new(1), ChunkNumber::new(1), true, WatermarkTimestamp::new(2));
        let pending = forward.serialize_pending();

        let replayed_forward = NonBlockingMonotonicSeqQueue::new();
        replayed_forward.restore(&pending);

        let mut reversed = pending.clone();
        reversed.reverse();
        let replayed_reversed = NonBlockingMonotonicSeqQueue::new();
        replayed_reversed.restore(&reversed);

        assert_eq!(
            replayed_forward.current_watermark(),
            replayed_reversed.current_watermark()
        );
    }

    proptest! {
        #[test]
        fn single_chunk_sequences_converge_to_the_same_watermark_in_any_arrival_order(shuffle_keys in proptest::collection::vec(any::<u16>(), 2..12)) {
            let n = shuffle_keys.len();
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|&i| shuffle_keys[i]);

            let queue = NonBlockingMonotonicSeqQueue::new();
            let mut last_watermark = WatermarkTimestamp::new(0);
            for &seq in &order {
                last_watermark = queue.update(
                    SequenceNumber::new(seq as u64),
                    ChunkNumber::new(0),
                    true,
                    WatermarkTimestamp::new((seq as u64) * 10),
                );
            }

            prop_assert_eq!(last_watermark, WatermarkTimestamp::new((n as u64 - 1) * 10));
            prop_assert_eq!(queue.current_watermark(), WatermarkTimestamp::new((n as u64 - 1) * 10));
        }
    }
}
