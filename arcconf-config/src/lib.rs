//! Configuration management for arcconf services

use serde::Deserialize;
use std::env;

/// Media parameters for the per-room audio pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Audio sampling rate in Hz (8000/12000/16000/24000/48000)
    pub sampling_rate: u32,
    /// Number of audio channels (1 = mono)
    pub channels: u8,
    /// Mixer tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Opus encoder bitrate in bits per second
    pub bitrate: u32,
    /// Default expected packet loss fed to the encoder, in percent
    pub default_loss_percent: i32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            sampling_rate: 48000,
            channels: 1,
            tick_interval_ms: 10,
            bitrate: 48000,
            default_loss_percent: 20,
        }
    }
}

impl MediaConfig {
    /// PCM samples produced per mixer tick, derived from rate and interval
    pub fn samples_per_tick(&self) -> usize {
        (self.sampling_rate as u64 * self.tick_interval_ms / 1000) as usize
    }
}

/// Jitter queue tuning
#[derive(Debug, Clone, Deserialize)]
pub struct JitterConfig {
    /// Target buffered duration in seconds before depth-gated pops release data
    pub depth_seconds: f64,
    /// Maximum buffered duration in seconds before oldest entries are dropped
    pub max_depth_seconds: f64,
    /// Packets buffered before the decode stage starts draining a stream
    pub prebuffer_packets: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        JitterConfig {
            depth_seconds: 3.0,
            max_depth_seconds: 5.0,
            prebuffer_packets: 15,
        }
    }
}

/// Mute-detection heuristic tuning
#[derive(Debug, Clone, Deserialize)]
pub struct MuteConfig {
    /// Inbound payloads shorter than this (bytes) count as mute candidates.
    /// Reference: with ptime=50ms the muted packet length is 17 bytes, with
    /// ptime=20ms it is 15 bytes.
    pub mute_packet_length: usize,
    /// Consecutive short packets before the stream is considered muted
    pub continue_mute_packets: u32,
}

impl Default for MuteConfig {
    fn default() -> Self {
        MuteConfig {
            mute_packet_length: 20,
            continue_mute_packets: 10,
        }
    }
}

/// Mixer / encode-pool tuning
#[derive(Debug, Clone, Deserialize)]
pub struct MixerConfig {
    /// Encode worker count; 0 = half of available hardware concurrency
    pub encode_workers: usize,
    /// Capacity of the bounded encode task queue
    pub encode_queue_capacity: usize,
    /// Run the decode stage on its own thread instead of inline in the mixer
    pub decode_stage_thread: bool,
    /// Retransmit encoded audio on alternating ticks when downlink loss is high
    pub repeat_on_loss: bool,
    /// Let silent participants share one encoded all-mix packet
    pub share_silent_encode: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        MixerConfig {
            encode_workers: 0,
            encode_queue_capacity: 64,
            decode_stage_thread: false,
            repeat_on_loss: true,
            share_silent_encode: true,
        }
    }
}

/// Speaker estimation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakerConfig {
    /// Ticks per estimation window
    pub window_ticks: u32,
    /// Energy below this is treated as silence and never wins a tick
    pub silence_floor: i32,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        SpeakerConfig {
            window_ticks: 50,
            silence_floor: 10_000_000,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    pub media: MediaConfig,
    pub jitter: JitterConfig,
    pub mute: MuteConfig,
    pub mixer: MixerConfig,
    pub speaker: SpeakerConfig,
    pub log_level: Option<String>,
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut cfg = EngineConfig::default();

        if let Some(rate) = read_var("ARCCONF_SAMPLING_RATE")? {
            cfg.media.sampling_rate = rate;
        }
        if let Some(tick) = read_var("ARCCONF_TICK_INTERVAL_MS")? {
            cfg.media.tick_interval_ms = tick;
        }
        if let Some(bitrate) = read_var("ARCCONF_AUDIO_BITRATE")? {
            cfg.media.bitrate = bitrate;
        }
        if let Some(depth) = read_var("ARCCONF_JITTER_DEPTH_SECONDS")? {
            cfg.jitter.depth_seconds = depth;
        }
        if let Some(max_depth) = read_var("ARCCONF_JITTER_MAX_SECONDS")? {
            cfg.jitter.max_depth_seconds = max_depth;
        }
        if let Some(prebuffer) = read_var("ARCCONF_JITTER_PREBUFFER_PACKETS")? {
            cfg.jitter.prebuffer_packets = prebuffer;
        }
        if let Some(len) = read_var("ARCCONF_MUTE_PACKET_LENGTH")? {
            cfg.mute.mute_packet_length = len;
        }
        if let Some(count) = read_var("ARCCONF_CONTINUE_MUTE_PACKETS")? {
            cfg.mute.continue_mute_packets = count;
        }
        if let Some(workers) = read_var("ARCCONF_ENCODE_WORKERS")? {
            cfg.mixer.encode_workers = workers;
        }
        if let Some(window) = read_var("ARCCONF_SPEAKER_WINDOW_TICKS")? {
            cfg.speaker.window_ticks = window;
        }

        cfg.log_level = Some(env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

        Ok(cfg)
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

fn read_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, config::ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| config::ConfigError::Message(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.media.sampling_rate, 48000);
        assert_eq!(cfg.media.samples_per_tick(), 480);
        assert_eq!(cfg.mute.continue_mute_packets, 10);
        assert_eq!(cfg.speaker.window_ticks, 50);
    }

    #[test]
    fn test_samples_per_tick_scales_with_rate() {
        let media = MediaConfig {
            sampling_rate: 16000,
            tick_interval_ms: 20,
            ..MediaConfig::default()
        };
        assert_eq!(media.samples_per_tick(), 320);
    }
}
