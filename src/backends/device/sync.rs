// SPDX-License-Identifier: GPL-3.0-only

//! Timestamp reconciliation across independently clocked streams

use std::time::Duration;

use super::types::StreamKind;

/// Tracks the latest timestamp of every synchronized stream and decides when
/// they describe the same moment.
///
/// The first stream is the reference. A snapshot is coherent when every
/// stream has a non-zero timestamp within half a frame period of the
/// reference. After publishing, [`reset`](Self::reset) zeroes all timestamps
/// so each stream has to deliver a fresh sample before the next frame.
#[derive(Debug, Clone)]
pub struct FrameSynchronizer {
    tolerance_ns: u64,
    timestamps: Vec<(StreamKind, u64)>,
}

impl FrameSynchronizer {
    pub fn new(frame_period: Duration) -> Self {
        Self {
            tolerance_ns: frame_period.as_nanos() as u64 / 2,
            timestamps: Vec::new(),
        }
    }

    /// Select the participating streams, keeping timestamps of streams that stay
    pub fn set_streams(&mut self, kinds: &[StreamKind]) {
        let previous = std::mem::take(&mut self.timestamps);
        self.timestamps = kinds
            .iter()
            .map(|kind| {
                let ts = previous
                    .iter()
                    .find(|(k, _)| k == kind)
                    .map(|(_, ts)| *ts)
                    .unwrap_or(0);
                (*kind, ts)
            })
            .collect();
    }

    /// Record a new sample timestamp; ignored for non-participating streams
    pub fn record(&mut self, kind: StreamKind, timestamp_ns: u64) {
        if let Some(slot) = self.timestamps.iter_mut().find(|(k, _)| *k == kind) {
            slot.1 = timestamp_ns;
        }
    }

    pub fn timestamp(&self, kind: StreamKind) -> Option<u64> {
        self.timestamps
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, ts)| *ts)
    }

    /// Timestamp of the reference stream, zero if nothing participates
    pub fn reference(&self) -> u64 {
        self.timestamps.first().map(|(_, ts)| *ts).unwrap_or(0)
    }

    pub fn is_coherent(&self) -> bool {
        let reference = self.reference();
        self.timestamps
            .iter()
            .all(|(_, ts)| *ts != 0 && ts.abs_diff(reference) <= self.tolerance_ns)
    }

    pub fn reset(&mut self) {
        for slot in &mut self.timestamps {
            slot.1 = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD_NS: u64 = 33_333_333;

    fn synchronizer() -> FrameSynchronizer {
        let mut sync = FrameSynchronizer::new(Duration::from_nanos(PERIOD_NS));
        sync.set_streams(&[StreamKind::Color, StreamKind::Depth, StreamKind::Infrared]);
        sync
    }

    #[test]
    fn test_waits_for_lagging_stream() {
        let mut sync = synchronizer();
        let t = 10 * PERIOD_NS;
        sync.record(StreamKind::Color, t);
        sync.record(StreamKind::Depth, t + 1_000_000);
        // Infrared is still on the previous frame
        sync.record(StreamKind::Infrared, t - PERIOD_NS);
        assert!(!sync.is_coherent());

        // Still more than half a period behind
        sync.record(StreamKind::Infrared, t - PERIOD_NS / 2 - 1);
        assert!(!sync.is_coherent());

        sync.record(StreamKind::Infrared, t + 2_000_000);
        assert!(sync.is_coherent());

        sync.reset();
        assert_eq!(sync.timestamp(StreamKind::Color), Some(0));
        assert_eq!(sync.timestamp(StreamKind::Depth), Some(0));
        assert_eq!(sync.timestamp(StreamKind::Infrared), Some(0));
        assert!(!sync.is_coherent());
    }

    #[test]
    fn test_missing_stream_is_not_coherent() {
        let mut sync = synchronizer();
        sync.record(StreamKind::Color, PERIOD_NS);
        sync.record(StreamKind::Depth, PERIOD_NS);
        assert!(!sync.is_coherent());
    }

    #[test]
    fn test_set_streams_keeps_existing_timestamps() {
        let mut sync = synchronizer();
        sync.record(StreamKind::Depth, 42);
        sync.set_streams(&[StreamKind::Depth]);
        assert_eq!(sync.timestamp(StreamKind::Depth), Some(42));
        assert_eq!(sync.timestamp(StreamKind::Color), None);
        assert!(sync.is_coherent());

        // Non-participating streams are ignored
        sync.record(StreamKind::Color, 1);
        assert_eq!(sync.timestamp(StreamKind::Color), None);
    }
}
