//! Per-stream downlink status registry
//!
//! Explicit per-room context object fed by the transport/RTCP side and
//! read by the mixer for loss-adaptive encoding and packet repetition.
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


use arcconf_types::StreamId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const BITRATE_WINDOW: Duration = Duration::from_secs(1);

/// Snapshot of one stream's downlink condition
#[derive(Debug, Clone, Copy, Default)]
pub struct DownlinkStats {
    /// Most recent fraction lost, in percent
    pub fraction_lost_percent: i32,
    /// Observed outbound bitrate over the last completed window, bits/s
    pub send_bitrate: u32,
    /// Receiver-advertised bitrate target, bits/s (0 = unknown)
    pub target_bitrate: u32,
}

struct StreamStatus {
    fraction_lost_percent: i32,
    target_bitrate: u32,
    window_start: Instant,
    window_bytes: u64,
    last_bitrate: u32,
}

impl StreamStatus {
    fn new() -> Self {
        StreamStatus {
            fraction_lost_percent: 0,
            target_bitrate: 0,
            window_start: Instant::now(),
            window_bytes: 0,
            last_bitrate: 0,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= BITRATE_WINDOW {
            let secs = elapsed.as_secs_f64();
            self.last_bitrate = ((self.window_bytes as f64 * 8.0) / secs) as u32;
            self.window_bytes = 0;
            self.window_start = now;
        }
    }
}

/// Downlink stats for every stream in one room
pub struct NetworkStatusRegistry {
    streams: Mutex<HashMap<StreamId, StreamStatus>>,
}

impl NetworkStatusRegistry {
    pub fn new() -> Self {
        NetworkStatusRegistry {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Record the fraction lost reported by the stream's receiver
    pub fn update_loss(&self, stream_id: StreamId, percent: i32) {
        let mut streams = self.streams.lock();
        streams
            .entry(stream_id)
            .or_insert_with(StreamStatus::new)
            .fraction_lost_percent = percent.clamp(0, 100);
    }

    /// Record a receiver-advertised bitrate target (REMB et al.)
    pub fn set_target_bitrate(&self, stream_id: StreamId, bitrate: u32) {
        let mut streams = self.streams.lock();
        streams
            .entry(stream_id)
            .or_insert_with(StreamStatus::new)
            .target_bitrate = bitrate;
    }

    /// Account outbound bytes toward the stream's send bitrate
    pub fn record_sent(&self, stream_id: StreamId, bytes: usize) {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream_id).or_insert_with(StreamStatus::new);
        status.roll_window(Instant::now());
        status.window_bytes += bytes as u64;
    }

    /// Current snapshot for one stream; defaults for unknown streams
    pub fn snapshot(&self, stream_id: StreamId) -> DownlinkStats {
        let mut streams = self.streams.lock();
        match streams.get_mut(&stream_id) {
            Some(status) => {
                status.roll_window(Instant::now());
                DownlinkStats {
                    fraction_lost_percent: status.fraction_lost_percent,
                    send_bitrate: status.last_bitrate,
                    target_bitrate: status.target_bitrate,
                }
            }
            None => DownlinkStats::default(),
        }
    }

    /// Drop a departed stream's state
    pub fn remove(&self, stream_id: StreamId) {
        self.streams.lock().remove(&stream_id);
    }
}

impl Default for NetworkStatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_update_and_snapshot() {
        let registry = NetworkStatusRegistry::new();
        registry.update_loss(StreamId(1), 35);
        assert_eq!(registry.snapshot(StreamId(1)).fraction_lost_percent, 35);
        // Unknown stream gives defaults
        assert_eq!(registry.snapshot(StreamId(2)).fraction_lost_percent, 0);
    }

    #[test]
    fn test_loss_is_clamped() {
        let registry = NetworkStatusRegistry::new();
        registry.update_loss(StreamId(1), 250);
        assert_eq!(registry.snapshot(StreamId(1)).fraction_lost_percent, 100);
    }

    #[test]
    fn test_target_bitrate() {
        let registry = NetworkStatusRegistry::new();
        registry.set_target_bitrate(StreamId(3), 256_000);
        assert_eq!(registry.snapshot(StreamId(3)).target_bitrate, 256_000);
    }

    #[test]
    fn test_remove_clears_state() {
        let registry = NetworkStatusRegistry::new();
        registry.update_loss(StreamId(1), 40);
        registry.remove(StreamId(1));
        assert_eq!(registry.snapshot(StreamId(1)).fraction_lost_percent, 0);
    }
}
