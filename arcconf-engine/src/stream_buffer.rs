//! Per-participant inbound audio lane
//!
//! Couples the jitter queue with the participant's decoder and the
//! short-frame mute heuristic. One instance per stream; pushed to by the
//! transport receive callback, drained by the mixer tick.
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


use crate::codec::AudioDecoder;
use crate::energy::frame_energy;
use crate::error::EngineResult;
use crate::jitter::JitterQueue;
use crate::media_packet::{DecodedFrame, MediaPacket};
use crate::rtp::{peek_payload_type, RtpHeader, OPUS_48000_PT, PCMU_8000_PT};
use arcconf_config::EngineConfig;

/// Jitter queue, decoder and mute state for one participant's audio stream.
pub struct AudioStreamBuffer {
    queue: JitterQueue,
    decoder: AudioDecoder,
    prebuffer_packets: usize,
    prebuffering: bool,

    /// Administrative mute, set through the RPC surface. Independent of the
    /// heuristic so inbound traffic can never un-mute an admin-muted stream.
    admin_muted: bool,
    /// Heuristic mute derived from consecutive short frames. An
    /// approximation only: DTX/comfort-noise padding frames are
    /// indistinguishable from genuine silence at this layer.
    auto_muted: bool,
    short_packet_run: u32,
    mute_packet_length: usize,
    continue_mute_packets: u32,
}

impl AudioStreamBuffer {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        Ok(AudioStreamBuffer {
            queue: JitterQueue::from_config(&config.jitter),
            decoder: AudioDecoder::new(&config.media)?,
            prebuffer_packets: config.jitter.prebuffer_packets,
            prebuffering: true,
            admin_muted: false,
            auto_muted: false,
            short_packet_run: 0,
            mute_packet_length: config.mute.mute_packet_length,
            continue_mute_packets: config.mute.continue_mute_packets,
        })
    }

    /// Enqueue one inbound audio packet.
    ///
    /// Runs the mute heuristic on the wire length, derives the queue
    /// timebase from the payload type, and tracks the prebuffer state.
    pub fn push_packet(&mut self, packet: MediaPacket) {
        self.check_and_set_mute(packet.len());

        match peek_payload_type(&packet.data) {
            Ok(PCMU_8000_PT) => self.queue.set_timebase(8000),
            Ok(OPUS_48000_PT) => self.queue.set_timebase(48000),
            _ => {}
        }

        self.queue.push(packet);
        self.prebuffering = self.queue.size() <= self.prebuffer_packets;
    }

    /// Non-blocking: pop the next packet and decode it to one tick block.
    ///
    /// Returns `None` while prebuffering, while muted, when the queue is
    /// empty, or when the decode fails — the caller treats all of these as
    /// silence for this tick.
    pub fn pop_and_decode(&mut self) -> Option<DecodedFrame> {
        if self.is_muted() || self.prebuffering {
            return None;
        }
        let packet = self.queue.pop(true)?;
        let (_, payload) = RtpHeader::parse(&packet.data).ok()?;
        let samples = self.decoder.decode(payload)?;
        let energy = frame_energy(&samples);
        Some(DecodedFrame { samples, energy })
    }

    /// Count consecutive short frames; a run of `continue_mute_packets`
    /// marks the stream muted, one normal-length frame clears it.
    fn check_and_set_mute(&mut self, packet_len: usize) {
        if packet_len < self.mute_packet_length {
            self.short_packet_run += 1;
            if self.short_packet_run >= self.continue_mute_packets {
                self.auto_muted = true;
            }
        } else {
            self.short_packet_run = 0;
            self.auto_muted = false;
        }
    }

    /// Administrative mute from the session surface
    pub fn set_muted(&mut self, muted: bool) {
        self.admin_muted = muted;
    }

    /// Whether the stream currently contributes nothing to the mix
    pub fn is_muted(&self) -> bool {
        self.admin_muted || self.auto_muted
    }

    /// Packets currently queued
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioEncoder;
    use bytes::{BufMut, Bytes, BytesMut};

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn rtp_packet(seq: u16, payload: &[u8]) -> MediaPacket {
        let header = RtpHeader {
            payload_type: OPUS_48000_PT,
            sequence_number: seq,
            timestamp: seq as u32 * 960,
            ssrc: 0x99,
            ..RtpHeader::default()
        };
        let mut bytes = BytesMut::from(&header.serialize()[..]);
        bytes.put_slice(payload);
        MediaPacket::audio(Bytes::from(bytes.to_vec()))
    }

    fn tone_payload() -> Bytes {
        let mut encoder = AudioEncoder::new(&config().media).unwrap();
        let tone: Vec<i16> = (0..480)
            .map(|i| ((i as f32 * 0.07).sin() * 9000.0) as i16)
            .collect();
        encoder.encode(&tone).unwrap()
    }

    #[test]
    fn test_mute_heuristic_trips_after_run_of_short_frames() {
        let mut buffer = AudioStreamBuffer::new(&config()).unwrap();
        // Short frame: 12-byte header + 5-byte payload = 17 bytes on the wire
        for seq in 0..9u16 {
            buffer.push_packet(rtp_packet(seq, &[0u8; 5]));
            assert!(!buffer.is_muted(), "muted too early at {seq}");
        }
        buffer.push_packet(rtp_packet(9, &[0u8; 5]));
        assert!(buffer.is_muted());

        // One normal-length frame resets the counter and un-mutes
        buffer.push_packet(rtp_packet(10, &tone_payload()));
        assert!(!buffer.is_muted());
    }

    #[test]
    fn test_admin_mute_is_not_cleared_by_traffic() {
        let mut buffer = AudioStreamBuffer::new(&config()).unwrap();
        buffer.set_muted(true);
        buffer.push_packet(rtp_packet(0, &tone_payload()));
        assert!(buffer.is_muted());
        assert!(buffer.pop_and_decode().is_none());

        buffer.set_muted(false);
        assert!(!buffer.is_muted());
    }

    #[test]
    fn test_prebuffering_then_decode() {
        let mut cfg = config();
        cfg.jitter.prebuffer_packets = 2;
        let mut buffer = AudioStreamBuffer::new(&cfg).unwrap();
        let payload = tone_payload();

        buffer.push_packet(rtp_packet(1, &payload));
        assert!(buffer.pop_and_decode().is_none());
        buffer.push_packet(rtp_packet(2, &payload));
        buffer.push_packet(rtp_packet(3, &payload));

        let frame = buffer.pop_and_decode().expect("expected a decoded frame");
        assert_eq!(frame.samples.len(), 480);
    }

    #[test]
    fn test_empty_queue_is_silence() {
        let mut cfg = config();
        cfg.jitter.prebuffer_packets = 0;
        let mut buffer = AudioStreamBuffer::new(&cfg).unwrap();
        assert!(buffer.pop_and_decode().is_none());
    }
}
