//! Raw and decoded media packet containers moved between pipeline stages
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


use bytes::Bytes;
use chrono::Utc;

/// Kind of a transport-level packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// RTP/RTCP carrying audio
    Audio,
    /// RTP/RTCP carrying video
    Video,
}

/// One raw packet as handed over by the transport layer.
///
/// `data` holds the complete wire bytes (RTP header included). The packet is
/// owned by whichever queue it sits in until popped.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Audio or video lane
    pub kind: PacketKind,
    /// Complete packet bytes
    pub data: Bytes,
    /// Wall-clock arrival time in milliseconds
    pub received_time_ms: i64,
}

impl MediaPacket {
    /// Wrap transport bytes arriving on the audio lane
    pub fn audio(data: Bytes) -> Self {
        MediaPacket {
            kind: PacketKind::Audio,
            data,
            received_time_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Wrap transport bytes arriving on the video lane
    pub fn video(data: Bytes) -> Self {
        MediaPacket {
            kind: PacketKind::Video,
            data,
            received_time_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Packet length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet carries no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One decoded PCM block for a single participant and tick
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Exactly samples-per-tick PCM samples
    pub samples: Vec<i16>,
    /// Fixed-point energy of the block
    pub energy: i32,
}

/// One encoded output frame produced by the mixer or forwarder, not yet
/// wrapped in an RTP header. Sequence number and timestamp are stamped at
/// mix/forward time so encode-stage jitter cannot skew RTP timing.
#[derive(Debug, Clone)]
pub struct MediaOutputPacket {
    /// Encoded payload (no RTP header)
    pub payload: Bytes,
    /// Session-monotonic sequence number
    pub seq: u16,
    /// RTP timestamp, advanced by samples-per-tick each tick
    pub timestamp: u32,
    /// Outbound SSRC; 0 lets the relaying plugin substitute its own
    pub ssrc: u32,
    /// RTP marker bit (end of video frame)
    pub marker: bool,
    /// Energy of the source block, used by the speaker estimator
    pub audio_energy: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_packet_lane() {
        let p = MediaPacket::audio(Bytes::from_static(b"0123456789ab"));
        assert_eq!(p.kind, PacketKind::Audio);
        assert_eq!(p.len(), 12);
        assert!(!p.is_empty());
    }
}
