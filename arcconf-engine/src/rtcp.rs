//! RTCP feedback handling
//!
//! Implements the slice of RFC 3550/4585/5104 the conference core needs:
//! receiver-report loss extraction, and construction/detection of the
//! Full Intra Request and Picture Loss Indication messages used to request
//! key frames on publisher switches.
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

/// Sender Report packet type
pub const PT_SENDER_REPORT: u8 = 200;
/// Receiver Report packet type
pub const PT_RECEIVER_REPORT: u8 = 201;
/// Transport-layer feedback (NACK et al.)
pub const PT_RTPFB: u8 = 205;
/// Payload-specific feedback (PLI/FIR)
pub const PT_PSFB: u8 = 206;

/// PSFB feedback message type for Picture Loss Indication
pub const FMT_PLI: u8 = 1;
/// PSFB feedback message type for Full Intra Request
pub const FMT_FIR: u8 = 4;

/// One reception report block from a Receiver Report (RFC 3550 Section 6.4.2)
#[derive(Debug, Clone)]
pub struct ReceptionReport {
    /// SSRC of the source this block reports on
    pub ssrc: u32,
    /// Fraction of packets lost since the previous report (out of 256)
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits, signed)
    pub cumulative_packets_lost: i32,
    /// Extended highest sequence number received
    pub extended_sequence_number: u32,
    /// Interarrival jitter
    pub jitter: u32,
}

impl ReceptionReport {
    /// Fraction lost expressed as a percentage (0-100)
    pub fn loss_percent(&self) -> i32 {
        (self.fraction_lost as i32 * 100) / 256
    }
}

/// Parse the reception report blocks out of a Receiver Report packet.
///
/// Returns an empty vector for a valid RR carrying zero blocks.
pub fn parse_receiver_report(data: &[u8]) -> EngineResult<Vec<ReceptionReport>> {
    if data.len() < 8 {
        return Err(EngineError::RtcpParseError(
            "RTCP packet too short".to_string(),
        ));
    }
    if data[1] != PT_RECEIVER_REPORT {
        return Err(EngineError::RtcpParseError(format!(
            "Not a receiver report: PT={}",
            data[1]
        )));
    }

    let count = (data[0] & 0x1F) as usize;
    let mut reports = Vec::with_capacity(count);
    let mut offset = 8; // header + reporter SSRC
    for _ in 0..count {
        if data.len() < offset + 24 {
            return Err(EngineError::RtcpParseError(
                "Truncated reception report block".to_string(),
            ));
        }
        let block = &data[offset..offset + 24];
        let cumulative = i32::from_be_bytes([0, block[5], block[6], block[7]]);
        reports.push(ReceptionReport {
            ssrc: u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
            fraction_lost: block[4],
            cumulative_packets_lost: cumulative,
            extended_sequence_number: u32::from_be_bytes([
                block[8], block[9], block[10], block[11],
            ]),
            jitter: u32::from_be_bytes([block[12], block[13], block[14], block[15]]),
        });
        offset += 24;
    }
    Ok(reports)
}

/// Build a Full Intra Request (RFC 5104 Section 4.3.1).
///
/// `fir_seq` is the caller's rolling command sequence number for this media
/// sender; it is incremented here so retransmitted FIRs are distinguishable.
pub fn build_fir(sender_ssrc: u32, media_ssrc: u32, fir_seq: &mut u8) -> Bytes {
    *fir_seq = fir_seq.wrapping_add(1);

    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0x80 | FMT_FIR); // V=2, P=0, FMT=4
    buf.put_u8(PT_PSFB);
    buf.put_u16(4); // length: 5 words minus 1
    buf.put_u32(sender_ssrc);
    buf.put_u32(0); // media source is zero for FIR; targets live in the FCI
    buf.put_u32(media_ssrc);
    buf.put_u8(*fir_seq);
    buf.put_u8(0);
    buf.put_u16(0);
    buf.freeze()
}

/// Build a Picture Loss Indication (RFC 4585 Section 6.3.1)
pub fn build_pli(sender_ssrc: u32, media_ssrc: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(0x80 | FMT_PLI); // V=2, P=0, FMT=1
    buf.put_u8(PT_PSFB);
    buf.put_u16(2); // length: 3 words minus 1
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    buf.freeze()
}

/// Whether a compound RTCP packet contains a Full Intra Request
pub fn has_fir(data: &[u8]) -> bool {
    scan_compound(data, PT_PSFB, FMT_FIR)
}

/// Whether a compound RTCP packet contains a Picture Loss Indication
pub fn has_pli(data: &[u8]) -> bool {
    scan_compound(data, PT_PSFB, FMT_PLI)
}

/// Walk the blocks of a compound packet looking for (packet type, fmt).
fn scan_compound(data: &[u8], packet_type: u8, fmt: u8) -> bool {
    let mut offset = 0;
    while data.len() >= offset + 4 {
        let block = &data[offset..];
        if block[0] >> 6 != 2 {
            return false;
        }
        let words = u16::from_be_bytes([block[2], block[3]]) as usize;
        let block_len = (words + 1) * 4;
        if block[1] == packet_type && (block[0] & 0x1F) == fmt {
            return true;
        }
        if block_len == 0 || data.len() < offset + block_len {
            return false;
        }
        offset += block_len;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_receiver_report(fraction_lost: u8) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x81); // V=2, RC=1
        buf.put_u8(PT_RECEIVER_REPORT);
        buf.put_u16(7); // 8 words total
        buf.put_u32(0x1111); // reporter SSRC
        buf.put_u32(0x2222); // reported SSRC
        buf.put_u8(fraction_lost);
        buf.put_u8(0);
        buf.put_u16(42); // cumulative lost (24 bits)
        buf.put_u32(5000); // extended highest sequence
        buf.put_u32(12); // jitter
        buf.put_u32(0); // LSR
        buf.put_u32(0); // DLSR
        buf.to_vec()
    }

    #[test]
    fn test_parse_receiver_report() {
        let data = sample_receiver_report(128);
        let reports = parse_receiver_report(&data).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ssrc, 0x2222);
        assert_eq!(reports[0].fraction_lost, 128);
        assert_eq!(reports[0].cumulative_packets_lost, 42);
        assert_eq!(reports[0].loss_percent(), 50);
    }

    #[test]
    fn test_fir_layout_and_sequence() {
        let mut seq = 0u8;
        let fir = build_fir(0xAAAA, 0xBBBB, &mut seq);
        assert_eq!(seq, 1);
        assert_eq!(fir.len(), 20);
        assert_eq!(fir[0] & 0x1F, FMT_FIR);
        assert_eq!(fir[1], PT_PSFB);
        assert_eq!(&fir[4..8], &0xAAAAu32.to_be_bytes());
        assert_eq!(&fir[12..16], &0xBBBBu32.to_be_bytes());
        assert_eq!(fir[16], 1);
        assert!(has_fir(&fir));
        assert!(!has_pli(&fir));

        let again = build_fir(0xAAAA, 0xBBBB, &mut seq);
        assert_eq!(again[16], 2);
    }

    #[test]
    fn test_pli_layout() {
        let pli = build_pli(0xAAAA, 0xBBBB);
        assert_eq!(pli.len(), 12);
        assert_eq!(pli[0] & 0x1F, FMT_PLI);
        assert!(has_pli(&pli));
        assert!(!has_fir(&pli));
    }

    #[test]
    fn test_compound_scan() {
        let mut compound = sample_receiver_report(0);
        let mut seq = 0u8;
        compound.extend_from_slice(&build_fir(1, 2, &mut seq));
        assert!(has_fir(&compound));
        assert!(!has_pli(&compound));
    }

    #[test]
    fn test_wrong_packet_type_rejected() {
        let pli = build_pli(1, 2);
        assert!(parse_receiver_report(&pli).is_err());
    }
}
