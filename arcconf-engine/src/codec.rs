//! Per-participant Opus codec adapter
//!
//! Every participant owns its own encoder/decoder pair: Opus carries
//! inter-frame state for error concealment, so codec instances are never
//! shared between streams. Decode and encode failures degrade to "no
//! frame" — the caller substitutes silence or skips the packet, the
//! stream continues.
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
use arcconf_config::MediaConfig;
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::warn;

/// Largest encoded Opus frame we ever expect
const MAX_ENCODED_BYTES: usize = 4000;
/// Decoder scratch capacity: 120 ms at 48 kHz
const MAX_DECODED_SAMPLES: usize = 5760;

/// Loss percentages below this do not adjust the encoder; light loss is
/// handled by FEC already in flight.
const MIN_ACTIONABLE_LOSS: i32 = 20;

fn sample_rate(rate: u32) -> EngineResult<SampleRate> {
    match rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        other => Err(EngineError::ConfigError(format!(
            "Invalid sample rate: {other} (must be 8/12/16/24/48 kHz)"
        ))),
    }
}

fn channels(count: u8) -> EngineResult<Channels> {
    match count {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(EngineError::ConfigError(format!(
            "Invalid channel count: {other} (must be 1 or 2)"
        ))),
    }
}

/// Outbound Opus encoder with a loss-adaptive FEC/bitrate target
pub struct AudioEncoder {
    encoder: Encoder,
    loss_percent: i32,
    scratch: Vec<u8>,
}

impl AudioEncoder {
    /// Create a VoIP-tuned encoder from the media configuration
    pub fn new(media: &MediaConfig) -> EngineResult<Self> {
        let mut encoder = Encoder::new(
            sample_rate(media.sampling_rate)?,
            channels(media.channels)?,
            Application::Voip,
        )
        .map_err(|e| EngineError::CodecError(format!("Failed to create encoder: {e:?}")))?;

        encoder
            .set_bitrate(Bitrate::BitsPerSecond(media.bitrate as i32))
            .map_err(|e| EngineError::CodecError(format!("Failed to set bitrate: {e:?}")))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| EngineError::CodecError(format!("Failed to enable FEC: {e:?}")))?;
        encoder
            .set_packet_loss_perc(media.default_loss_percent as u8)
            .map_err(|e| EngineError::CodecError(format!("Failed to set loss target: {e:?}")))?;

        Ok(AudioEncoder {
            encoder,
            loss_percent: media.default_loss_percent,
            scratch: vec![0u8; MAX_ENCODED_BYTES],
        })
    }

    /// Encode one PCM block. Failure is logged and yields `None`; the
    /// caller must not emit a packet for this block.
    pub fn encode(&mut self, pcm: &[i16]) -> Option<Bytes> {
        match self.encoder.encode(pcm, &mut self.scratch) {
            Ok(len) => Some(Bytes::copy_from_slice(&self.scratch[..len])),
            Err(e) => {
                warn!(error = ?e, "Opus encode failed");
                None
            }
        }
    }

    /// Adjust the encoder's expected-loss target from observed downlink
    /// loss. Values under 20 % are ignored.
    pub fn set_loss_percent(&mut self, percent: i32) {
        if percent < MIN_ACTIONABLE_LOSS {
            return;
        }
        let clamped = percent.min(100);
        if self.encoder.set_packet_loss_perc(clamped as u8).is_ok() {
            self.loss_percent = clamped;
        }
    }

    /// Current expected-loss target in percent
    pub fn loss_percent(&self) -> i32 {
        self.loss_percent
    }
}

/// Inbound Opus decoder producing fixed-size tick blocks
pub struct AudioDecoder {
    decoder: Decoder,
    samples_per_tick: usize,
    scratch: Vec<i16>,
}

impl AudioDecoder {
    /// Create a decoder from the media configuration
    pub fn new(media: &MediaConfig) -> EngineResult<Self> {
        let decoder = Decoder::new(sample_rate(media.sampling_rate)?, channels(media.channels)?)
            .map_err(|e| EngineError::CodecError(format!("Failed to create decoder: {e:?}")))?;

        Ok(AudioDecoder {
            decoder,
            samples_per_tick: media.samples_per_tick(),
            scratch: vec![0i16; MAX_DECODED_SAMPLES],
        })
    }

    /// Decode one Opus payload to exactly samples-per-tick PCM samples.
    ///
    /// Short decodes are zero-padded, long ones truncated; a decode error
    /// is logged and yields `None` so the caller treats the tick as
    /// silence for this stream.
    pub fn decode(&mut self, payload: &[u8]) -> Option<Vec<i16>> {
        match self.decoder.decode(Some(payload), &mut self.scratch, false) {
            Ok(decoded) => {
                let mut block = self.scratch[..decoded.min(self.samples_per_tick)].to_vec();
                block.resize(self.samples_per_tick, 0);
                Some(block)
            }
            Err(e) => {
                warn!(error = ?e, "Opus decode failed");
                None
            }
        }
    }

    /// Samples produced per tick
    pub fn samples_per_tick(&self) -> usize {
        self.samples_per_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media() -> MediaConfig {
        MediaConfig::default()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = AudioEncoder::new(&media()).unwrap();
        let mut decoder = AudioDecoder::new(&media()).unwrap();

        let tone: Vec<i16> = (0..480)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();

        let encoded = encoder.encode(&tone).expect("encode failed");
        assert!(!encoded.is_empty());

        let decoded = decoder.decode(&encoded).expect("decode failed");
        assert_eq!(decoded.len(), 480);
    }

    #[test]
    fn test_decode_garbage_yields_none_and_recovers() {
        let mut encoder = AudioEncoder::new(&media()).unwrap();
        let mut decoder = AudioDecoder::new(&media()).unwrap();

        assert!(decoder.decode(&[0xFF; 3]).is_none());

        let encoded = encoder.encode(&[0i16; 480]).unwrap();
        assert!(decoder.decode(&encoded).is_some());
    }

    #[test]
    fn test_loss_percent_gating() {
        let mut encoder = AudioEncoder::new(&media()).unwrap();
        let initial = encoder.loss_percent();

        encoder.set_loss_percent(5);
        assert_eq!(encoder.loss_percent(), initial);

        encoder.set_loss_percent(60);
        assert_eq!(encoder.loss_percent(), 60);

        encoder.set_loss_percent(400);
        assert_eq!(encoder.loss_percent(), 100);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = media();
        bad.sampling_rate = 44100;
        assert!(AudioEncoder::new(&bad).is_err());
        assert!(AudioDecoder::new(&bad).is_err());
    }
}
