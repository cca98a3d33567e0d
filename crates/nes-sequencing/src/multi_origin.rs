// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::seq_queue::NonBlockingMonotonicSeqQueue;
use nes_types::{ChunkNumber, OriginId, SequenceNumber, WatermarkTimestamp};
use std::collections::HashMap;

/// One [`NonBlockingMonotonicSeqQueue`] per origin; the global watermark is the
/// minimum of each origin's own watermark, so a single stalled origin holds back the
/// whole stream exactly as the single-origin case would (spec §4.4 "Multi-origin
/// processor").
pub struct MultiOriginWatermarkProcessor {
    origins: Vec<OriginId>,
    queues: HashMap<OriginId, NonBlockingMonotonicSeqQueue>,
}

impl MultiOriginWatermarkProcessor {
    pub fn new(origins: &[OriginId]) -> Self {
        let queues = origins
            .iter()
            .map(|&origin| (origin, NonBlockingMonotonicSeqQueue::new()))
            .collect();
        Self {
            origins: origins.to_vec(),
            queues,
        }
    }

    /// Updates `origin`'s queue and returns the new global watermark, which is
    /// guaranteed monotonically non-decreasing by construction.
    pub fn update_watermark(
        &self,
        origin: OriginId,
        sequence_number: SequenceNumber,
        chunk_number: ChunkNumber,
        last_chunk: bool,
        timestamp: WatermarkTimestamp,
    ) -> WatermarkTimestamp {
        if let Some(queue) = self.queues.get(&origin) {
            queue.update(sequence_number, chunk_number, last_chunk, timestamp);
        }
        self.current_watermark()
    }

    pub fn current_watermark(&self) -> WatermarkTimestamp {
        self.origins
            .iter()
            .filter_map(|origin| self.queues.get(origin))
            .map(|queue| queue.current_watermark())
            .min()
            .unwrap_or(WatermarkTimestamp::new(0))
    }

    pub fn origins(&self) -> &[OriginId] {
        &self.origins
    }

    /// Serialises per-origin pending state for checkpointing (spec §4.4
    /// "Serialisation").
    pub fn serialize_watermarks(&self) -> Vec<OriginWatermarkSnapshot> {
        self.origins
            .iter()
            .filter_map(|&origin| {
                let queue = self.queues.get(&origin)?;
                Some(OriginWatermarkSnapshot {
                    origin,
                    next_expected_seq: queue.next_expected_seq(),
                    watermark_ts: queue.current_watermark(),
                    pending: queue.serialize_pending(),
                })
            })
            .collect()
    }

    /// Restores per-origin state from a prior [`Self::serialize_watermarks`] call.
    /// Snapshot order and pending-tuple order within a snapshot do not matter.
    pub fn restore_watermarks(&self, snapshots: &[OriginWatermarkSnapshot]) {
        for snapshot in snapshots {
            if let Some(queue) = self.queues.get(&snapshot.origin) {
                queue.restore_baseline(snapshot.next_expected_seq, snapshot.watermark_ts);
                queue.restore(&snapshot.pending);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct OriginWatermarkSnapshot {
    pub origin: OriginId,
    pub next_expected_seq: SequenceNumber,
    pub watermark_ts: WatermarkTimestamp,
    pub pending: Vec<(SequenceNumber, ChunkNumber, bool, WatermarkTimestamp)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_watermark_is_min_across_origins() {
        let origins = vec![OriginId::new(0), OriginId::new(1)];
        let processor = MultiOriginWatermarkProcessor::new(&origins);

        processor.update_watermark(
            OriginId::new(0),
            SequenceNumber::new(0),
            ChunkNumber::new(0),
            true,
            WatermarkTimestamp::new(100),
        );
        let wm = processor.update_watermark(
            OriginId::new(1),
            SequenceNumber::new(0),
            ChunkNumber::new(0),
            true,
            WatermarkTimestamp::new(40),
        );

        assert_eq!(wm, WatermarkTimestamp::new(40), "origin 1 lags behind origin 0");
    }

    #[test]
    fn serialize_restore_round_trips_watermark() {
        let origins = vec![OriginId::new(0)];
        let processor = MultiOriginWatermarkProcessor::new(&origins);
        processor.update_watermark(
            OriginId::new(0),
            SequenceNumber::new(0),
            ChunkNumber::new(0),
            false,
            WatermarkTimestamp::new(5),
        );

        let snapshot = processor.serialize_watermarks();

        let restored = MultiOriginWatermarkProcessor::new(&origins);
        restored.restore_watermarks(&snapshot);
        restored.update_watermark(
            OriginId::new(0),
            SequenceNumber::new(0),
            ChunkNumber::new(1),
            true,
            WatermarkTimestamp::new(9),
        );

        assert_eq!(restored.current_watermark(), WatermarkTimestamp::new(9));
    }
}
