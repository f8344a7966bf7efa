//! Fixed-tick audio mixing engine
//!
//! One instance per room. A mixer thread runs on a monotonic 10 ms tick:
//! it drains one decoded frame per participant, sums everything into a
//! wide all-mix accumulator, derives each participant's output as
//! `all-mix − own contribution`, stamps sequence/timestamp at mix time and
//! fans the encoding out to a bounded worker pool. The mixer thread never
//! blocks on a participant or on a slow encoder.
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


use crate::codec::AudioEncoder;
use crate::error::{EngineError, EngineResult};
use crate::media_packet::{DecodedFrame, MediaOutputPacket, MediaPacket};
use crate::net_status::{DownlinkStats, NetworkStatusRegistry};
use crate::speaker::{SpeakerChangeListener, SpeakerEstimator};
use crate::stream_buffer::AudioStreamBuffer;
use arcconf_config::EngineConfig;
use arcconf_types::{SessionId, StreamId};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval for encode workers taking from the task queue
const WORKER_POLL: Duration = Duration::from_millis(5);
/// Sleep granularity of the tick scheduler
const TICK_SLEEP: Duration = Duration::from_millis(1);
/// Downlink loss above which repetition kicks in, in percent
const REPEAT_LOSS_THRESHOLD: i32 = 30;
/// Bounded repetition factor for lossy downlinks
const REPEAT_COUNT: u32 = 3;

/// Receives each participant's mixed output packet
pub trait MixerOutputListener: Send + Sync {
    fn on_audio_mixed(&self, packet: &MediaOutputPacket);
}

/// One participant's codec lanes. The inbound buffer is touched by the
/// transport callback and the mixer/decode thread; the encoder only by
/// encode workers.
struct Participant {
    buffer: Mutex<AudioStreamBuffer>,
    encoder: Mutex<AudioEncoder>,
}

/// Unit of encode work: one PCM block to encode once and deliver to every
/// listed participant, stamped at mix time.
struct EncodeTask {
    /// (participant, energy of that participant's own frame this tick)
    targets: Vec<(StreamId, i32)>,
    pcm: Vec<i16>,
    seq: u16,
    timestamp: u32,
}

type ParticipantMap = BTreeMap<StreamId, Arc<Participant>>;
type ListenerMap = BTreeMap<StreamId, Arc<dyn MixerOutputListener>>;

/// Fixed-tick mixer with an encode worker pool
pub struct MixerEngine {
    session_id: SessionId,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    participants: Arc<Mutex<ParticipantMap>>,
    listeners: Arc<Mutex<ListenerMap>>,
    mix_all_listener: Arc<Mutex<Option<Arc<dyn MixerOutputListener>>>>,
    speaker_listener: Mutex<Option<Arc<dyn SpeakerChangeListener>>>,
    net: Arc<NetworkStatusRegistry>,
    task_tx: Sender<EncodeTask>,
    task_rx: Receiver<EncodeTask>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MixerEngine {
    pub fn new(
        session_id: SessionId,
        config: EngineConfig,
        net: Arc<NetworkStatusRegistry>,
    ) -> Self {
        let (task_tx, task_rx) = bounded(config.mixer.encode_queue_capacity.max(1));
        MixerEngine {
            session_id,
            config,
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            participants: Arc::new(Mutex::new(BTreeMap::new())),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            mix_all_listener: Arc::new(Mutex::new(None)),
            speaker_listener: Mutex::new(None),
            net,
            task_tx,
            task_rx,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Register the speaker-change callback; effective at `start()`.
    pub fn set_speaker_listener(&self, listener: Arc<dyn SpeakerChangeListener>) {
        *self.speaker_listener.lock() = Some(listener);
    }

    /// Create the inbound buffer and encoder for a new participant.
    ///
    /// Codec allocation failure is fatal to this participant only.
    pub fn add_audio_buffer(&self, stream_id: StreamId) -> EngineResult<()> {
        let mut participants = self.participants.lock();
        if participants.contains_key(&stream_id) {
            return Err(EngineError::StreamExists {
                stream_id: stream_id.value(),
            });
        }
        let participant = Participant {
            buffer: Mutex::new(AudioStreamBuffer::new(&self.config)?),
            encoder: Mutex::new(AudioEncoder::new(&self.config.media)?),
        };
        participants.insert(stream_id, Arc::new(participant));
        Ok(())
    }

    /// Detach a participant. Codec state is released when the last encode
    /// task referencing it finishes.
    pub fn remove_audio_buffer(&self, stream_id: StreamId) {
        self.participants.lock().remove(&stream_id);
        self.net.remove(stream_id);
    }

    /// Register the output listener for one participant
    pub fn register_mix_result_listener(
        &self,
        stream_id: StreamId,
        listener: Arc<dyn MixerOutputListener>,
    ) {
        self.listeners.lock().insert(stream_id, listener);
    }

    /// Unregister a participant's output listener
    pub fn unregister_mix_result_listener(&self, stream_id: StreamId) {
        self.listeners.lock().remove(&stream_id);
    }

    /// Register the single listener receiving the encoded all-mix packet
    /// (recording / live-stream collaborators).
    pub fn set_mix_all_listener(&self, listener: Arc<dyn MixerOutputListener>) {
        *self.mix_all_listener.lock() = Some(listener);
    }

    /// Hand one inbound audio packet to the participant's jitter lane.
    /// Non-blocking; called from the transport receive thread.
    pub fn push_packet(&self, stream_id: StreamId, packet: MediaPacket) {
        let participant = self.participants.lock().get(&stream_id).cloned();
        if let Some(participant) = participant {
            participant.buffer.lock().push_packet(packet);
        }
    }

    /// Administrative mute: the stream stops contributing to the mix
    pub fn mute(&self, stream_id: StreamId, muted: bool) -> EngineResult<()> {
        let participant = self.participants.lock().get(&stream_id).cloned();
        match participant {
            Some(participant) => {
                participant.buffer.lock().set_muted(muted);
                Ok(())
            }
            None => Err(EngineError::StreamNotFound {
                stream_id: stream_id.value(),
            }),
        }
    }

    /// Downlink loss feedback for a participant's outbound stream.
    /// Doubled before reaching the encoder: reported fraction lost lags
    /// the bursts that matter for FEC.
    pub fn on_packet_loss(&self, stream_id: StreamId, percent: i32) {
        let participant = self.participants.lock().get(&stream_id).cloned();
        if let Some(participant) = participant {
            participant
                .encoder
                .lock()
                .set_loss_percent((percent * 2).min(100));
        }
    }

    /// Whether `start()` has run and `destroy()` has not
    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of registered participants
    pub fn participant_count(&self) -> usize {
        self.participants.lock().len()
    }

    /// Spawn the mixer thread, the optional decode-stage thread and the
    /// encode worker pool.
    pub fn start(&self) -> EngineResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        info!(session_id = %self.session_id, "Starting audio mixer");

        let mut threads = self.threads.lock();

        let worker_count = if self.config.mixer.encode_workers > 0 {
            self.config.mixer.encode_workers
        } else {
            let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
            (cpus / 2).max(1)
        };
        for index in 0..worker_count {
            let worker = EncodeWorker {
                running: self.running.clone(),
                tasks: self.task_rx.clone(),
                participants: self.participants.clone(),
                listeners: self.listeners.clone(),
                net: self.net.clone(),
                repeat_on_loss: self.config.mixer.repeat_on_loss,
            };
            let handle = thread::Builder::new()
                .name(format!("encode-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| EngineError::ConfigError(format!("spawn failed: {e}")))?;
            threads.push(handle);
        }

        let (decoded_tx, decoded_rx) = if self.config.mixer.decode_stage_thread {
            let (tx, rx) = bounded::<BTreeMap<StreamId, DecodedFrame>>(4);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        if let Some(tx) = decoded_tx {
            let stage = DecodeStage {
                running: self.running.clone(),
                participants: self.participants.clone(),
                tick: Duration::from_millis(self.config.media.tick_interval_ms),
                out: tx,
            };
            let handle = thread::Builder::new()
                .name("audio-decode".to_string())
                .spawn(move || stage.run())
                .map_err(|e| EngineError::ConfigError(format!("spawn failed: {e}")))?;
            threads.push(handle);
        }

        let loop_body = MixerLoop {
            session_id: self.session_id,
            running: self.running.clone(),
            participants: self.participants.clone(),
            mix_all_listener: self.mix_all_listener.clone(),
            net: self.net.clone(),
            task_tx: self.task_tx.clone(),
            config: self.config.clone(),
            speaker_listener: self.speaker_listener.lock().clone(),
            decoded_rx,
        };
        let handle = thread::Builder::new()
            .name("audio-mixer".to_string())
            .spawn(move || loop_body.run())
            .map_err(|e| EngineError::ConfigError(format!("spawn failed: {e}")))?;
        threads.push(handle);

        Ok(())
    }

    /// Flip the stop flag and join every owned thread. Idempotent; returns
    /// only once no thread of this engine is live and no encode task can
    /// execute afterwards.
    pub fn destroy(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(session_id = %self.session_id, "Mixer thread panicked during join");
            }
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

impl Drop for MixerEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Optional decode stage: drains and decodes every participant once per
/// tick and hands the frame map to the mixer thread.
struct DecodeStage {
    running: Arc<AtomicBool>,
    participants: Arc<Mutex<ParticipantMap>>,
    tick: Duration,
    out: Sender<BTreeMap<StreamId, DecodedFrame>>,
}

impl DecodeStage {
    fn run(self) {
        let mut next_tick = Instant::now() + self.tick;
        while self.running.load(Ordering::SeqCst) {
            if Instant::now() < next_tick {
                thread::sleep(TICK_SLEEP);
                continue;
            }
            next_tick += self.tick;

            let frames = decode_all(&self.participants);
            if frames.is_empty() {
                continue;
            }
            if let Err(TrySendError::Full(_)) = self.out.try_send(frames) {
                warn!("Decode stage output full, dropping one tick");
            }
        }
    }
}

fn decode_all(participants: &Mutex<ParticipantMap>) -> BTreeMap<StreamId, DecodedFrame> {
    let snapshot: Vec<(StreamId, Arc<Participant>)> = participants
        .lock()
        .iter()
        .map(|(id, p)| (*id, p.clone()))
        .collect();

    let mut frames = BTreeMap::new();
    for (stream_id, participant) in snapshot {
        if let Some(frame) = participant.buffer.lock().pop_and_decode() {
            frames.insert(stream_id, frame);
        }
    }
    frames
}

/// The fixed-tick mixer loop state, moved onto the mixer thread
struct MixerLoop {
    session_id: SessionId,
    running: Arc<AtomicBool>,
    participants: Arc<Mutex<ParticipantMap>>,
    mix_all_listener: Arc<Mutex<Option<Arc<dyn MixerOutputListener>>>>,
    net: Arc<NetworkStatusRegistry>,
    task_tx: Sender<EncodeTask>,
    config: EngineConfig,
    speaker_listener: Option<Arc<dyn SpeakerChangeListener>>,
    decoded_rx: Option<Receiver<BTreeMap<StreamId, DecodedFrame>>>,
}

impl MixerLoop {
    fn run(self) {
        let samples = self.config.media.samples_per_tick();
        let tick = Duration::from_millis(self.config.media.tick_interval_ms);
        let mut speaker = SpeakerEstimator::new(&self.config.speaker);
        if let Some(listener) = &self.speaker_listener {
            speaker.set_listener(listener.clone());
        }
        // Encoder for the all-mix lane, owned by the mixer thread
        let mut mix_all_encoder = AudioEncoder::new(&self.config.media).ok();

        let mut seq: u16 = 0;
        let mut ts: u32 = 0;
        let mut next_tick = Instant::now() + tick;

        while self.running.load(Ordering::SeqCst) {
            let frames = match &self.decoded_rx {
                // Decode stage runs on its own thread and paces us
                Some(rx) => match rx.recv_timeout(tick) {
                    Ok(frames) => frames,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                // Inline decode, driven by elapsed wall-clock time
                None => {
                    if Instant::now() < next_tick {
                        thread::sleep(TICK_SLEEP);
                        continue;
                    }
                    next_tick += tick;
                    decode_all(&self.participants)
                }
            };

            if frames.is_empty() {
                continue;
            }

            let started = Instant::now();
            self.mix_tick(frames, samples, &mut seq, &mut ts, &mut speaker, &mut mix_all_encoder);
            let elapsed = started.elapsed();
            if elapsed > Duration::from_millis(5) {
                warn!(
                    session_id = %self.session_id,
                    elapsed_us = elapsed.as_micros() as u64,
                    "Mixer tick ran long"
                );
            }
        }
        debug!(session_id = %self.session_id, "Mixer loop exited");
    }

    fn mix_tick(
        &self,
        frames: BTreeMap<StreamId, DecodedFrame>,
        samples: usize,
        seq: &mut u16,
        ts: &mut u32,
        speaker: &mut SpeakerEstimator,
        mix_all_encoder: &mut Option<AudioEncoder>,
    ) {
        *seq = seq.wrapping_add(1);
        *ts = ts.wrapping_add(samples as u32);

        let mix = accumulate(&frames, samples);

        // Every registered participant gets output this tick, contributor
        // or not; the table snapshot keeps the id set consistent.
        let ids: Vec<StreamId> = self.participants.lock().keys().copied().collect();

        let mut shared_targets: Vec<(StreamId, i32)> = Vec::new();
        for stream_id in ids {
            let stats = self.net.snapshot(stream_id);
            self.update_encoder_loss(stream_id, &stats);

            match frames.get(&stream_id) {
                Some(frame) => {
                    let pcm = subtract_own(&mix, Some(&frame.samples));
                    speaker.update_audio_energy(stream_id, frame.energy);
                    self.submit(EncodeTask {
                        targets: vec![(stream_id, frame.energy)],
                        pcm,
                        seq: *seq,
                        timestamp: *ts,
                    });
                }
                None => {
                    speaker.update_audio_energy(stream_id, 0);
                    if self.config.mixer.share_silent_encode {
                        shared_targets.push((stream_id, 0));
                    } else {
                        self.submit(EncodeTask {
                            targets: vec![(stream_id, 0)],
                            pcm: subtract_own(&mix, None),
                            seq: *seq,
                            timestamp: *ts,
                        });
                    }
                }
            }
        }

        if !shared_targets.is_empty() {
            self.submit(EncodeTask {
                targets: shared_targets,
                pcm: subtract_own(&mix, None),
                seq: *seq,
                timestamp: *ts,
            });
        }

        speaker.next_frame();

        let mix_all = self.mix_all_listener.lock().clone();
        if let (Some(listener), Some(encoder)) = (mix_all, mix_all_encoder.as_mut()) {
            let pcm = subtract_own(&mix, None);
            if let Some(payload) = encoder.encode(&pcm) {
                let energy = frames.values().next().map(|f| f.energy).unwrap_or(0);
                listener.on_audio_mixed(&MediaOutputPacket {
                    payload,
                    seq: *seq,
                    timestamp: *ts,
                    ssrc: 0,
                    marker: false,
                    audio_energy: energy,
                });
            }
        }
    }

    fn update_encoder_loss(&self, stream_id: StreamId, stats: &DownlinkStats) {
        if stats.fraction_lost_percent == 0 {
            return;
        }
        let participant = self.participants.lock().get(&stream_id).cloned();
        if let Some(participant) = participant {
            participant
                .encoder
                .lock()
                .set_loss_percent((stats.fraction_lost_percent * 2).min(100));
        }
    }

    /// Push a task to the bounded queue; a full queue means encoding is
    /// behind, so the tick is dropped for these targets rather than
    /// stalling the mixer.
    fn submit(&self, task: EncodeTask) {
        if let Err(TrySendError::Full(task)) = self.task_tx.try_send(task) {
            warn!(
                session_id = %self.session_id,
                seq = task.seq,
                targets = task.targets.len(),
                "Encode queue full, dropping tick output"
            );
        }
    }
}

/// Encode worker: takes tasks with a short timeout so shutdown always
/// makes progress, encodes once per task and fans the packet out to the
/// task's target participants.
struct EncodeWorker {
    running: Arc<AtomicBool>,
    tasks: Receiver<EncodeTask>,
    participants: Arc<Mutex<ParticipantMap>>,
    listeners: Arc<Mutex<ListenerMap>>,
    net: Arc<NetworkStatusRegistry>,
    repeat_on_loss: bool,
}

impl EncodeWorker {
    fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            match self.tasks.recv_timeout(WORKER_POLL) {
                Ok(task) => self.handle(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle(&self, task: EncodeTask) {
        let mut encoded: Option<Bytes> = None;

        for (stream_id, energy) in &task.targets {
            let participant = self.participants.lock().get(stream_id).cloned();
            let Some(participant) = participant else {
                continue; // participant left between mix and encode
            };

            if encoded.is_none() {
                encoded = participant.encoder.lock().encode(&task.pcm);
                if encoded.is_none() {
                    // This participant's encoder failed; the next target's
                    // encoder gets a chance with the same block.
                    continue;
                }
            }
            let payload = encoded.as_ref().cloned().unwrap_or_default();

            let listener = self.listeners.lock().get(stream_id).cloned();
            let Some(listener) = listener else { continue };

            let packet = MediaOutputPacket {
                payload,
                seq: task.seq,
                timestamp: task.timestamp,
                ssrc: 0,
                marker: false,
                audio_energy: *energy,
            };
            let repeats =
                repeat_count(self.repeat_on_loss, task.seq, &self.net.snapshot(*stream_id));
            for _ in 0..repeats {
                listener.on_audio_mixed(&packet);
            }
        }
    }
}

/// Cheap redundancy for lossy downlinks: on alternating sequence numbers,
/// a stream with heavy loss and spare bitrate headroom gets the same
/// packet a bounded number of times.
fn repeat_count(repeat_on_loss: bool, seq: u16, stats: &DownlinkStats) -> u32 {
    if !repeat_on_loss || seq % 2 != 0 {
        return 1;
    }
    if stats.fraction_lost_percent > REPEAT_LOSS_THRESHOLD
        && (stats.target_bitrate == 0
            || stats.target_bitrate as u64 * 2 > stats.send_bitrate as u64 * 3)
    {
        REPEAT_COUNT
    } else {
        1
    }
}

/// Sum every contribution into a 32-bit-per-sample accumulator; wide
/// enough that no combination of 16-bit inputs can overflow before the
/// per-output subtraction.
fn accumulate(frames: &BTreeMap<StreamId, DecodedFrame>, samples: usize) -> Vec<i32> {
    let mut mix = vec![0i32; samples];
    for frame in frames.values() {
        for (slot, sample) in mix.iter_mut().zip(frame.samples.iter()) {
            *slot += *sample as i32;
        }
    }
    mix
}

/// Derive one participant's output block: the all-mix minus their own
/// contribution when they contributed, the plain all-mix otherwise.
fn subtract_own(mix: &[i32], own: Option<&[i16]>) -> Vec<i16> {
    match own {
        Some(own) => mix
            .iter()
            .zip(own.iter())
            .map(|(total, own)| (*total - *own as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect(),
        None => mix
            .iter()
            .map(|total| (*total).clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpHeader, OPUS_48000_PT};
    use bytes::{BufMut, BytesMut};
    use std::sync::atomic::AtomicUsize;

    fn engine_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.jitter.prebuffer_packets = 1;
        cfg.mixer.encode_workers = 2;
        cfg
    }

    fn tone(step: f32) -> Vec<i16> {
        (0..480)
            .map(|i| ((i as f32 * step).sin() * 9000.0) as i16)
            .collect()
    }

    fn frame(samples: Vec<i16>) -> DecodedFrame {
        let energy = crate::energy::frame_energy(&samples);
        DecodedFrame { samples, energy }
    }

    struct CountingListener {
        packets: AtomicUsize,
    }

    impl MixerOutputListener for CountingListener {
        fn on_audio_mixed(&self, _packet: &MediaOutputPacket) {
            self.packets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rtp_audio_packet(seq: u16, payload: &[u8]) -> MediaPacket {
        let header = RtpHeader {
            payload_type: OPUS_48000_PT,
            sequence_number: seq,
            timestamp: seq as u32 * 480,
            ssrc: 7,
            ..RtpHeader::default()
        };
        let mut bytes = BytesMut::from(&header.serialize()[..]);
        bytes.put_slice(payload);
        MediaPacket::audio(Bytes::from(bytes.to_vec()))
    }

    #[test]
    fn test_no_self_echo() {
        let a = tone(0.05);
        let b = tone(0.09);
        let mut frames = BTreeMap::new();
        frames.insert(StreamId(1), frame(a.clone()));
        frames.insert(StreamId(2), frame(b.clone()));

        let mix = accumulate(&frames, 480);
        let out_a = subtract_own(&mix, Some(&a));
        let out_b = subtract_own(&mix, Some(&b));

        assert_eq!(out_a, b, "participant A must hear exactly B");
        assert_eq!(out_b, a, "participant B must hear exactly A");
    }

    #[test]
    fn test_silent_participant_receives_full_mix() {
        let a = tone(0.05);
        let mut frames = BTreeMap::new();
        frames.insert(StreamId(1), frame(a.clone()));

        let mix = accumulate(&frames, 480);
        let out_silent = subtract_own(&mix, None);
        assert_eq!(out_silent, a);
    }

    #[test]
    fn test_subtract_saturates() {
        let mix = vec![i16::MAX as i32 + 1000; 4];
        let out = subtract_own(&mix, None);
        assert!(out.iter().all(|s| *s == i16::MAX));
    }

    #[test]
    fn test_repeat_count_rules() {
        let lossy = DownlinkStats {
            fraction_lost_percent: 50,
            send_bitrate: 10_000,
            target_bitrate: 0,
        };
        let clean = DownlinkStats::default();

        assert_eq!(repeat_count(true, 2, &lossy), REPEAT_COUNT);
        // Odd sequence numbers never repeat
        assert_eq!(repeat_count(true, 3, &lossy), 1);
        // Clean downlink never repeats
        assert_eq!(repeat_count(true, 2, &clean), 1);
        // Lossy but already saturating its target: no extra copies
        let saturated = DownlinkStats {
            fraction_lost_percent: 50,
            send_bitrate: 100_000,
            target_bitrate: 100_000,
        };
        assert_eq!(repeat_count(true, 2, &saturated), 1);
        // Feature disabled
        assert_eq!(repeat_count(false, 2, &lossy), 1);
    }

    #[test]
    fn test_start_destroy_idempotent() {
        let engine = MixerEngine::new(
            SessionId(1),
            engine_config(),
            Arc::new(NetworkStatusRegistry::new()),
        );
        engine.start().unwrap();
        assert!(engine.is_started());
        engine.start().unwrap(); // second start is a no-op
        engine.destroy();
        assert!(!engine.is_started());
        engine.destroy(); // second destroy is a no-op
    }

    #[test]
    fn test_mixes_and_dispatches_to_listeners() {
        let engine = MixerEngine::new(
            SessionId(2),
            engine_config(),
            Arc::new(NetworkStatusRegistry::new()),
        );
        let listener_a = Arc::new(CountingListener {
            packets: AtomicUsize::new(0),
        });
        let listener_b = Arc::new(CountingListener {
            packets: AtomicUsize::new(0),
        });

        engine.add_audio_buffer(StreamId(1)).unwrap();
        engine.add_audio_buffer(StreamId(2)).unwrap();
        assert!(engine.add_audio_buffer(StreamId(1)).is_err());
        engine.register_mix_result_listener(StreamId(1), listener_a.clone());
        engine.register_mix_result_listener(StreamId(2), listener_b.clone());
        engine.start().unwrap();

        let mut encoder = AudioEncoder::new(&engine_config().media).unwrap();
        let payload = encoder.encode(&tone(0.05)).unwrap();
        for seq in 0..30u16 {
            engine.push_packet(StreamId(1), rtp_audio_packet(seq, &payload));
            engine.push_packet(StreamId(2), rtp_audio_packet(seq, &payload));
            thread::sleep(Duration::from_millis(10));
        }

        engine.destroy();
        assert!(listener_a.packets.load(Ordering::SeqCst) > 0);
        assert!(listener_b.packets.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_destroy_mid_tick_stops_all_work() {
        let engine = MixerEngine::new(
            SessionId(3),
            engine_config(),
            Arc::new(NetworkStatusRegistry::new()),
        );
        let listener = Arc::new(CountingListener {
            packets: AtomicUsize::new(0),
        });
        engine.add_audio_buffer(StreamId(1)).unwrap();
        engine.register_mix_result_listener(StreamId(1), listener.clone());
        engine.start().unwrap();

        let mut encoder = AudioEncoder::new(&engine_config().media).unwrap();
        let payload = encoder.encode(&tone(0.07)).unwrap();
        for seq in 0..5u16 {
            engine.push_packet(StreamId(1), rtp_audio_packet(seq, &payload));
        }
        thread::sleep(Duration::from_millis(25));

        engine.destroy();
        let after_destroy = listener.packets.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        // No encode task may run once destroy() has returned
        assert_eq!(listener.packets.load(Ordering::SeqCst), after_destroy);
    }

    #[test]
    fn test_mute_gates_contribution() {
        let engine = MixerEngine::new(
            SessionId(4),
            engine_config(),
            Arc::new(NetworkStatusRegistry::new()),
        );
        engine.add_audio_buffer(StreamId(1)).unwrap();
        engine.mute(StreamId(1), true).unwrap();
        assert!(engine.mute(StreamId(9), true).is_err());

        let mut encoder = AudioEncoder::new(&engine_config().media).unwrap();
        let payload = encoder.encode(&tone(0.07)).unwrap();
        for seq in 0..4u16 {
            engine.push_packet(StreamId(1), rtp_audio_packet(seq, &payload));
        }
        // Muted stream hands out nothing to the decode stage
        let frames = decode_all(&engine.participants);
        assert!(frames.is_empty());
    }
}
