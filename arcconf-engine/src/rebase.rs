//! Sequence/timestamp rebasing across source switches
//!
//! When a forwarded stream switches sources (publisher switch, classroom
//! slot relink), the downstream sequence/timestamp series must keep
//! increasing: a backward jump would make the receiver's jitter buffer and
//! SRTP window discard everything after the switch.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


/// Timestamp gap inserted between the last packet of the previous source
/// and the first packet of the next one (one video frame at 90 kHz).
pub const RELINK_TIMESTAMP_GAP: u32 = 2880;

/// Rewrites one forwarded stream's sequence numbers and timestamps.
///
/// On the first packet of a newly bound source, `base_seq`/`base_ts` are
/// captured; every packet then maps to
/// `out = last + (source − base)` with wrapping arithmetic, so the output
/// series continues the previous source's numbering instead of jumping to
/// the new source's raw values.
#[derive(Debug, Default)]
pub struct StreamRebaser {
    base_seq: Option<u16>,
    base_ts: Option<u32>,
    last_seq: u16,
    last_ts: u32,
    /// Most recent rebased outputs
    seq: u16,
    ts: u32,
}

impl StreamRebaser {
    pub fn new() -> Self {
        StreamRebaser::default()
    }

    /// Map one source packet's (seq, ts) onto the output series
    pub fn rebase(&mut self, source_seq: u16, source_ts: u32) -> (u16, u32) {
        let base_seq = *self.base_seq.get_or_insert(source_seq);
        self.seq = self.last_seq.wrapping_add(source_seq.wrapping_sub(base_seq));

        let base_ts = *self.base_ts.get_or_insert(source_ts);
        self.ts = self.last_ts.wrapping_add(source_ts.wrapping_sub(base_ts));

        (self.seq, self.ts)
    }

    /// Splice in a new source: the next packet continues one past the
    /// current output position, whatever its raw numbering is.
    pub fn relink(&mut self) {
        self.last_seq = self.seq.wrapping_add(1);
        self.last_ts = self.ts.wrapping_add(RELINK_TIMESTAMP_GAP);
        self.base_seq = None;
        self.base_ts = None;
    }

    /// Last rebased sequence number
    pub fn sequence(&self) -> u16 {
        self.seq
    }

    /// Last rebased timestamp
    pub fn timestamp(&self) -> u32 {
        self.ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_source_passes_through_from_zero() {
        let mut rebaser = StreamRebaser::new();
        assert_eq!(rebaser.rebase(100, 1000), (0, 0));
        assert_eq!(rebaser.rebase(101, 1010), (1, 10));
        assert_eq!(rebaser.rebase(102, 1020), (2, 20));
    }

    #[test]
    fn test_switch_keeps_series_strictly_increasing() {
        let mut rebaser = StreamRebaser::new();
        rebaser.rebase(100, 1000);
        let (seq_before, ts_before) = rebaser.rebase(101, 1010);

        // New source starts at lower raw numbers; output must not reset
        rebaser.relink();
        let (seq_a, ts_a) = rebaser.rebase(50, 500);
        let (seq_b, ts_b) = rebaser.rebase(51, 510);

        assert!(seq_a > seq_before);
        assert!(ts_a > ts_before);
        assert_eq!(seq_b, seq_a + 1);
        assert_eq!(ts_b, ts_a + 10);
    }

    #[test]
    fn test_source_wraparound_is_preserved() {
        let mut rebaser = StreamRebaser::new();
        rebaser.rebase(65535, 100);
        let (seq, _) = rebaser.rebase(0, 110);
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_multiple_relinks() {
        let mut rebaser = StreamRebaser::new();
        let mut previous = 0u16;
        for source_start in [1000u16, 10, 40000, 7] {
            rebaser.relink();
            for offset in 0..3u16 {
                let (seq, _) = rebaser.rebase(source_start.wrapping_add(offset), 0);
                assert!(seq > previous || previous == 0);
                previous = seq;
            }
        }
    }
}
