//! Active speaker estimation
//!
//! Consumes the per-tick frame energy of every stream and tallies, per
//! estimation window, how often each stream was the loudest. At window
//! boundaries the dominant stream is computed and the listener is notified
//! only when it differs from the previously reported speaker.
//!
//! Single-threaded contract: driven exclusively by the mixer thread;
//! callers must serialize access.
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


use arcconf_config::SpeakerConfig;
use arcconf_types::StreamId;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback fired when the estimated dominant speaker changes
pub trait SpeakerChangeListener: Send + Sync {
    fn on_speaker_changed(&self, stream_id: StreamId);
}

#[derive(Default)]
struct EnergyTally {
    /// Ticks this stream was the loudest in the current window
    hits: u32,
    /// Summed energy of those winning ticks, used as a tie-breaker
    total_energy: i64,
}

/// Rolling per-stream energy history with hysteresis against flapping
pub struct SpeakerEstimator {
    window_ticks: u32,
    silence_floor: i32,
    frame_count: u32,
    intra_frame: Vec<(StreamId, i32)>,
    window_tally: HashMap<StreamId, EnergyTally>,
    last_reported: Option<StreamId>,
    listener: Option<Arc<dyn SpeakerChangeListener>>,
}

impl SpeakerEstimator {
    pub fn new(config: &SpeakerConfig) -> Self {
        SpeakerEstimator {
            window_ticks: config.window_ticks.max(1),
            silence_floor: config.silence_floor,
            frame_count: 0,
            intra_frame: Vec::new(),
            window_tally: HashMap::new(),
            last_reported: None,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn SpeakerChangeListener>) {
        self.listener = Some(listener);
    }

    /// Record one stream's frame energy for the current tick
    pub fn update_audio_energy(&mut self, stream_id: StreamId, energy: i32) {
        self.intra_frame.push((stream_id, energy));
    }

    /// Close the current tick: tally the loudest stream, and at window
    /// boundaries report a change of dominant speaker.
    pub fn next_frame(&mut self) {
        if self.intra_frame.is_empty() {
            return;
        }

        let mut max_stream: Option<StreamId> = None;
        let mut max_energy = 0i32;
        for (stream_id, energy) in self.intra_frame.drain(..) {
            if energy > max_energy {
                max_stream = Some(stream_id);
                max_energy = energy;
            }
        }

        if max_energy > self.silence_floor {
            if let Some(stream_id) = max_stream {
                let tally = self.window_tally.entry(stream_id).or_default();
                tally.hits += 1;
                tally.total_energy += max_energy as i64;
            }
        }

        self.frame_count += 1;
        if self.frame_count >= self.window_ticks {
            self.frame_count = 0;
            self.close_window();
        }
    }

    /// Stream most recently reported as the dominant speaker
    pub fn current_speaker(&self) -> Option<StreamId> {
        self.last_reported
    }

    fn close_window(&mut self) {
        let mut dominant: Option<StreamId> = None;
        let mut best_hits = 0u32;
        let mut best_energy = 0i64;
        for (stream_id, tally) in &self.window_tally {
            if tally.hits > best_hits
                || (tally.hits == best_hits && tally.total_energy > best_energy)
            {
                dominant = Some(*stream_id);
                best_hits = tally.hits;
                best_energy = tally.total_energy;
            }
        }
        self.window_tally.clear();

        if let Some(speaker) = dominant {
            if self.last_reported != Some(speaker) {
                self.last_reported = Some(speaker);
                if let Some(listener) = &self.listener {
                    listener.on_speaker_changed(speaker);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingListener {
        changes: Mutex<Vec<StreamId>>,
    }

    impl SpeakerChangeListener for RecordingListener {
        fn on_speaker_changed(&self, stream_id: StreamId) {
            self.changes.lock().push(stream_id);
        }
    }

    fn estimator(window: u32) -> (SpeakerEstimator, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener {
            changes: Mutex::new(Vec::new()),
        });
        let mut est = SpeakerEstimator::new(&SpeakerConfig {
            window_ticks: window,
            silence_floor: 10_000_000,
        });
        est.set_listener(listener.clone());
        (est, listener)
    }

    fn run_window(est: &mut SpeakerEstimator, loud: StreamId, quiet: StreamId, ticks: u32) {
        for _ in 0..ticks {
            est.update_audio_energy(loud, 50_000_000);
            est.update_audio_energy(quiet, 20_000_000);
            est.next_frame();
        }
    }

    #[test]
    fn test_dominant_speaker_reported_once() {
        let (mut est, listener) = estimator(10);
        run_window(&mut est, StreamId(1), StreamId(2), 10);
        assert_eq!(est.current_speaker(), Some(StreamId(1)));
        assert_eq!(listener.changes.lock().as_slice(), &[StreamId(1)]);

        // Same dominant speaker in the next window: no further callback
        run_window(&mut est, StreamId(1), StreamId(2), 10);
        assert_eq!(listener.changes.lock().len(), 1);
    }

    #[test]
    fn test_speaker_change_fires_again() {
        let (mut est, listener) = estimator(10);
        run_window(&mut est, StreamId(1), StreamId(2), 10);
        run_window(&mut est, StreamId(2), StreamId(1), 10);
        assert_eq!(
            listener.changes.lock().as_slice(),
            &[StreamId(1), StreamId(2)]
        );
    }

    #[test]
    fn test_silence_never_wins() {
        let (mut est, listener) = estimator(5);
        for _ in 0..5 {
            est.update_audio_energy(StreamId(1), 1000);
            est.next_frame();
        }
        assert_eq!(est.current_speaker(), None);
        assert!(listener.changes.lock().is_empty());
    }

    #[test]
    fn test_tie_broken_by_total_energy() {
        let (mut est, _listener) = estimator(2);
        est.update_audio_energy(StreamId(1), 90_000_000);
        est.update_audio_energy(StreamId(2), 20_000_000);
        est.next_frame();
        est.update_audio_energy(StreamId(1), 20_000_000);
        est.update_audio_energy(StreamId(2), 30_000_000);
        est.next_frame();
        // One winning tick each; stream 1 won with more energy
        assert_eq!(est.current_speaker(), Some(StreamId(1)));
    }
}
