//! RTP (Real-time Transport Protocol) packet handling
//!
//! Implements RFC 3550 RTP parsing, construction and in-place header
//! patching. The bit layout is externally fixed and must byte-match what
//! existing conference participants emit.
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


use crate::error::{EngineError, EngineResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Static payload type for PCMU at 8 kHz
pub const PCMU_8000_PT: u8 = 0;
/// Dynamic payload type used for Opus at 48 kHz
pub const OPUS_48000_PT: u8 = 120;
/// Dynamic payload type used for VP8 at 90 kHz
pub const VP8_90000_PT: u8 = 100;

/// RTP header as defined in RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (must be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number (16 bits, wrapping)
    pub sequence_number: u16,
    /// Timestamp (32 bits, wrapping)
    pub timestamp: u32,
    /// SSRC (Synchronization Source) identifier
    pub ssrc: u32,
    /// CSRC (Contributing Source) identifiers
    pub csrc: Vec<u32>,
}

/// Complete RTP packet
#[derive(Debug, Clone)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,
    /// Payload data
    pub payload: Bytes,
}

impl RtpHeader {
    /// Fixed base header size (12 bytes)
    pub const BASE_SIZE: usize = 12;

    /// Parse an RTP header, returning it together with the payload slice.
    ///
    /// Negotiated header extensions are skipped, not interpreted; a peer
    /// negotiating extensions shifts the payload start accordingly.
    pub fn parse(data: &[u8]) -> EngineResult<(Self, &[u8])> {
        if data.len() < Self::BASE_SIZE {
            return Err(EngineError::RtpParseError(format!(
                "RTP header too short: {} bytes",
                data.len()
            )));
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(EngineError::RtpParseError(format!(
                "Invalid RTP version: {version}"
            )));
        }
        let padding = (data[0] & 0x20) != 0;
        let extension = (data[0] & 0x10) != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = (data[1] & 0x80) != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = Self::BASE_SIZE;
        if data.len() < offset + csrc_count * 4 {
            return Err(EngineError::RtpParseError(
                "Incomplete CSRC list".to_string(),
            ));
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
            offset += 4;
        }

        if extension {
            if data.len() < offset + 4 {
                return Err(EngineError::RtpParseError(
                    "Incomplete extension header".to_string(),
                ));
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
            if data.len() < offset {
                return Err(EngineError::RtpParseError(
                    "Incomplete extension data".to_string(),
                ));
            }
        }

        let header = RtpHeader {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
        };

        Ok((header, &data[offset..]))
    }

    /// Serialize the header to wire bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::BASE_SIZE + self.csrc.len() * 4);

        let mut first = (self.version & 0x03) << 6;
        if self.padding {
            first |= 0x20;
        }
        first |= (self.csrc.len() as u8) & 0x0F;
        buf.put_u8(first);

        let mut second = self.payload_type & 0x7F;
        if self.marker {
            second |= 0x80;
        }
        buf.put_u8(second);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        buf
    }
}

impl Default for RtpHeader {
    fn default() -> Self {
        RtpHeader {
            version: 2,
            padding: false,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
        }
    }
}

impl RtpPacket {
    /// Parse a complete RTP packet
    pub fn parse(data: &[u8]) -> EngineResult<Self> {
        let (header, payload) = RtpHeader::parse(data)?;
        Ok(RtpPacket {
            header,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Serialize the packet to wire bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = self.header.serialize();
        buf.put_slice(&self.payload);
        buf
    }
}

/// Read the sequence number without a full parse
pub fn peek_sequence(data: &[u8]) -> EngineResult<u16> {
    ensure_base(data)?;
    Ok(u16::from_be_bytes([data[2], data[3]]))
}

/// Read the timestamp without a full parse
pub fn peek_timestamp(data: &[u8]) -> EngineResult<u32> {
    ensure_base(data)?;
    Ok(u32::from_be_bytes([data[4], data[5], data[6], data[7]]))
}

/// Read the SSRC without a full parse
pub fn peek_ssrc(data: &[u8]) -> EngineResult<u32> {
    ensure_base(data)?;
    Ok(u32::from_be_bytes([data[8], data[9], data[10], data[11]]))
}

/// Read the payload type without a full parse
pub fn peek_payload_type(data: &[u8]) -> EngineResult<u8> {
    ensure_base(data)?;
    Ok(data[1] & 0x7F)
}

/// Read the marker bit without a full parse
pub fn peek_marker(data: &[u8]) -> EngineResult<bool> {
    ensure_base(data)?;
    Ok((data[1] & 0x80) != 0)
}

/// Overwrite the sequence number in place.
///
/// The relay/rebase path rewrites headers without re-serializing payloads.
pub fn patch_sequence(data: &mut [u8], seq: u16) -> EngineResult<()> {
    ensure_base(data)?;
    data[2..4].copy_from_slice(&seq.to_be_bytes());
    Ok(())
}

/// Overwrite the timestamp in place
pub fn patch_timestamp(data: &mut [u8], timestamp: u32) -> EngineResult<()> {
    ensure_base(data)?;
    data[4..8].copy_from_slice(&timestamp.to_be_bytes());
    Ok(())
}

/// Overwrite the SSRC in place
pub fn patch_ssrc(data: &mut [u8], ssrc: u32) -> EngineResult<()> {
    ensure_base(data)?;
    data[8..12].copy_from_slice(&ssrc.to_be_bytes());
    Ok(())
}

fn ensure_base(data: &[u8]) -> EngineResult<()> {
    if data.len() < RtpHeader::BASE_SIZE {
        return Err(EngineError::RtpParseError(format!(
            "RTP header too short: {} bytes",
            data.len()
        )));
    }
    Ok(())
}
