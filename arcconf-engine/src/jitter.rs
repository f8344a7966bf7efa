//! Per-stream packet reordering queue
//!
//! Compensates for network jitter ahead of the decode stage:
//! packets are kept ordered by a wraparound-aware sequence comparator,
//! duplicates are suppressed, arrivals older than anything already handed
//! out are discarded, and the queue is bounded by buffered duration rather
//! than item count.
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


use crate::media_packet::MediaPacket;
use crate::rtp::{peek_sequence, peek_timestamp};
use arcconf_config::JitterConfig;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default target depth in seconds before depth-gated pops release data
pub const DEFAULT_DEPTH_SECONDS: f64 = 3.0;
/// Default maximum buffered duration in seconds
pub const DEFAULT_MAX_DEPTH_SECONDS: f64 = 5.0;

struct QueuedPacket {
    sequence: u16,
    timestamp: u32,
    packet: MediaPacket,
}

/// Wraparound-aware sequence order: `x` precedes `y` iff the 16-bit
/// difference, interpreted as signed, is negative.
pub fn sequence_less_than(x: u16, y: u16) -> bool {
    x != y && y.wrapping_sub(x) < 0x8000
}

/// Reordering/dedup jitter queue for one media stream.
///
/// Single-writer (transport receive callback) / single-reader (decode or
/// forward stage) per stream; the owning structure provides the locking.
pub struct JitterQueue {
    queue: VecDeque<QueuedPacket>,
    last_sequence_given: Option<u16>,
    /// RTP timestamp ticks per second; buffered duration is computed from
    /// the timestamp span between oldest and newest entry.
    timebase: u32,
    depth_seconds: f64,
    max_depth_seconds: f64,
}

impl JitterQueue {
    /// Create a queue with explicit depth bounds
    pub fn new(depth_seconds: f64, max_depth_seconds: f64) -> Self {
        JitterQueue {
            queue: VecDeque::new(),
            last_sequence_given: None,
            timebase: 0,
            depth_seconds,
            max_depth_seconds,
        }
    }

    /// Create a queue from the engine jitter configuration
    pub fn from_config(config: &JitterConfig) -> Self {
        Self::new(config.depth_seconds, config.max_depth_seconds)
    }

    /// Set the RTP timestamp rate used to translate buffered span to seconds
    pub fn set_timebase(&mut self, timebase: u32) {
        self.timebase = timebase;
    }

    /// Insert a packet, maintaining sequence order.
    ///
    /// Duplicates (already queued or already handed out) and packets older
    /// than the last handed-out sequence are dropped silently.
    pub fn push(&mut self, packet: MediaPacket) {
        let (sequence, timestamp) = match (peek_sequence(&packet.data), peek_timestamp(&packet.data))
        {
            (Ok(seq), Ok(ts)) => (seq, ts),
            _ => {
                warn!(len = packet.len(), "Dropping malformed RTP packet");
                return;
            }
        };

        if let Some(last_given) = self.last_sequence_given {
            if sequence == last_given || sequence_less_than(sequence, last_given) {
                debug!(
                    sequence,
                    last_given, "Very late packet, dropping"
                );
                return;
            }
        }
        if self.queue.iter().any(|entry| entry.sequence == sequence) {
            debug!(sequence, "Duplicate packet, dropping");
            return;
        }

        // Walk from the newest end; most arrivals are in order.
        let mut insert_at = 0;
        for idx in (0..self.queue.len()).rev() {
            if sequence_less_than(self.queue[idx].sequence, sequence) {
                insert_at = idx + 1;
                break;
            }
        }
        self.queue.insert(
            insert_at,
            QueuedPacket {
                sequence,
                timestamp,
                packet,
            },
        );

        while self.depth_in_seconds() > self.max_depth_seconds {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(
                    sequence = dropped.sequence,
                    "Queue over max depth, dropping oldest"
                );
            }
        }
    }

    /// Pop the oldest packet.
    ///
    /// With `ignore_depth` false the packet is released only once the
    /// buffered duration has reached the target depth; depth-agnostic
    /// consumers and the shutdown flush pass true.
    pub fn pop(&mut self, ignore_depth: bool) -> Option<MediaPacket> {
        if !ignore_depth && !self.has_data() {
            return None;
        }
        let entry = self.queue.pop_front()?;
        self.last_sequence_given = Some(entry.sequence);
        Some(entry.packet)
    }

    /// Whether the buffered duration has reached the target depth
    pub fn has_data(&self) -> bool {
        !self.queue.is_empty() && self.depth_in_seconds() >= self.depth_seconds
    }

    /// Number of queued packets
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue holds no packets
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything, including the hand-out history
    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_sequence_given = None;
    }

    /// Buffered duration: timestamp span between oldest and newest entry
    /// over the timebase. Zero until the timebase is known.
    fn depth_in_seconds(&self) -> f64 {
        if self.timebase == 0 || self.queue.len() < 2 {
            return 0.0;
        }
        let oldest = self.queue.front().map(|e| e.timestamp).unwrap_or(0);
        let newest = self.queue.back().map(|e| e.timestamp).unwrap_or(0);
        newest.wrapping_sub(oldest) as f64 / self.timebase as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpHeader;
    use bytes::Bytes;

    fn packet(seq: u16, ts: u32) -> MediaPacket {
        let header = RtpHeader {
            payload_type: 120,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 0x42,
            ..RtpHeader::default()
        };
        let mut bytes = header.serialize();
        bytes.extend_from_slice(b"payload");
        MediaPacket::audio(Bytes::from(bytes.to_vec()))
    }

    fn drain_sequences(queue: &mut JitterQueue) -> Vec<u16> {
        let mut seqs = Vec::new();
        while let Some(p) = queue.pop(true) {
            seqs.push(peek_sequence(&p.data).unwrap());
        }
        seqs
    }

    #[test]
    fn test_empty_pop() {
        let mut queue = JitterQueue::new(0.0, 5.0);
        assert!(queue.pop(true).is_none());
        assert!(queue.pop(false).is_none());
    }

    #[test]
    fn test_reordered_arrivals_pop_in_order() {
        let mut queue = JitterQueue::new(0.0, 5.0);
        queue.push(packet(3, 2880));
        queue.push(packet(1, 960));
        queue.push(packet(2, 1920));
        assert_eq!(drain_sequences(&mut queue), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_yields_one_packet() {
        let mut queue = JitterQueue::new(0.0, 5.0);
        queue.push(packet(5, 100));
        queue.push(packet(5, 100));
        assert_eq!(queue.size(), 1);
        assert_eq!(drain_sequences(&mut queue), vec![5]);
        // Re-pushing an already handed-out sequence is also suppressed
        queue.push(packet(5, 100));
        assert!(queue.pop(true).is_none());
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut queue = JitterQueue::new(0.0, 5.0);
        queue.push(packet(0, 2880));
        queue.push(packet(65534, 960));
        queue.push(packet(1, 3840));
        queue.push(packet(65535, 1920));
        assert_eq!(drain_sequences(&mut queue), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_too_old_packet_discarded() {
        let mut queue = JitterQueue::new(0.0, 5.0);
        queue.push(packet(10, 960));
        assert_eq!(drain_sequences(&mut queue), vec![10]);
        queue.push(packet(9, 0));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_never_goes_backwards() {
        let mut queue = JitterQueue::new(0.0, 5.0);
        for seq in [4u16, 2, 7, 3, 6, 5, 2, 4] {
            queue.push(packet(seq, seq as u32 * 960));
        }
        let seqs = drain_sequences(&mut queue);
        for pair in seqs.windows(2) {
            assert!(sequence_less_than(pair[0], pair[1]));
        }
    }

    #[test]
    fn test_depth_gating() {
        let mut queue = JitterQueue::new(0.02, 5.0);
        queue.set_timebase(48000);
        queue.push(packet(1, 0));
        // One packet buffered: depth not reached yet
        assert!(!queue.has_data());
        assert!(queue.pop(false).is_none());

        queue.push(packet(2, 960)); // 20 ms span at 48 kHz
        assert!(queue.has_data());
        assert!(queue.pop(false).is_some());

        // Depth-agnostic pop drains the rest
        assert!(queue.pop(true).is_some());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = JitterQueue::new(0.0, 0.05);
        queue.set_timebase(48000);
        for seq in 0..10u16 {
            queue.push(packet(seq, seq as u32 * 960)); // 10 ms per packet
        }
        // 90 ms span exceeds the 50 ms cap; the oldest entries are gone
        assert!(queue.size() < 10);
        let first = queue.pop(true).unwrap();
        assert!(peek_sequence(&first.data).unwrap() > 0);
    }
}
