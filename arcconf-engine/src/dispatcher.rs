//! Publisher-switch video forwarding (SFU)
//!
//! One publisher's video is forwarded, without re-encoding, to every other
//! participant. A dedicated forward thread drains the publisher's queue,
//! rebases sequence numbers and timestamps onto one continuous output
//! series, and fans the packet out. Switching publishers splices the new
//! source into that series and immediately requests a key frame so the
//! window of undecodable downstream video stays bounded.
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
use crate::media_packet::{MediaOutputPacket, PacketKind};
use crate::plugin::Plugin;
use crate::rebase::StreamRebaser;
use crate::rtp::RtpHeader;
use arcconf_types::{SessionId, StreamId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum spacing of key-frame requests per publisher
const KEY_FRAME_REQUEST_INTERVAL: Duration = Duration::from_secs(2);
/// Safety refresh: re-request a key frame from the publisher this often
const KEY_FRAME_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
/// Idle sleep of the forward loop
const FORWARD_IDLE_SLEEP: Duration = Duration::from_millis(1);

pub type PluginTable = Arc<Mutex<BTreeMap<StreamId, Arc<Plugin>>>>;

/// Forwarding core of a publisher-switch room
pub struct VideoDispatcher {
    session_id: SessionId,
    running: Arc<AtomicBool>,
    participants: PluginTable,
    publisher: Arc<Mutex<Option<StreamId>>>,
    rebaser: Arc<Mutex<StreamRebaser>>,
    last_key_frame_request: Mutex<HashMap<StreamId, Instant>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoDispatcher {
    /// The dispatcher shares the room's participant table; every lookup is
    /// by stream id, never a retained reference.
    pub fn new(session_id: SessionId, participants: PluginTable) -> Self {
        VideoDispatcher {
            session_id,
            running: Arc::new(AtomicBool::new(false)),
            participants,
            publisher: Arc::new(Mutex::new(None)),
            rebaser: Arc::new(Mutex::new(StreamRebaser::new())),
            last_key_frame_request: Mutex::new(HashMap::new()),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the forward thread
    pub fn start(&self) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(session_id = %self.session_id, "Starting video dispatcher");

        let forward = ForwardLoop {
            running: self.running.clone(),
            participants: self.participants.clone(),
            publisher: self.publisher.clone(),
            rebaser: self.rebaser.clone(),
        };
        let handle = thread::Builder::new()
            .name("video-forward".to_string())
            .spawn(move || forward.run())
            .map_err(|e| EngineError::ConfigError(format!("spawn failed: {e}")))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Flip the stop flag and join the forward thread. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!(session_id = %self.session_id, "Forward thread panicked during join");
            }
        }
    }

    /// Current publisher, if any
    pub fn publisher(&self) -> Option<StreamId> {
        *self.publisher.lock()
    }

    /// Make `stream_id` the forwarded publisher.
    ///
    /// The output series is spliced (never reset) and the new publisher is
    /// asked for a key frame immediately.
    pub fn switch_publisher(&self, stream_id: StreamId) -> EngineResult<()> {
        let plugin = self
            .participants
            .lock()
            .get(&stream_id)
            .cloned()
            .ok_or(EngineError::StreamNotFound {
                stream_id: stream_id.value(),
            })?;

        {
            let mut publisher = self.publisher.lock();
            if *publisher != Some(stream_id) {
                self.rebaser.lock().relink();
                *publisher = Some(stream_id);
            }
        }

        self.last_key_frame_request
            .lock()
            .insert(stream_id, Instant::now());
        plugin.send_fir_packet();
        info!(session_id = %self.session_id, publisher = %stream_id, "Publisher switched");
        Ok(())
    }

    /// A receiver asked for a key frame (FIR/PLI on its RTCP lane):
    /// forward the request to the current publisher, rate-limited.
    pub fn request_key_frame(&self, requester: StreamId) {
        let Some(publisher_id) = self.publisher() else {
            return;
        };
        if publisher_id == requester {
            return;
        }

        {
            let mut last = self.last_key_frame_request.lock();
            let now = Instant::now();
            if let Some(previous) = last.get(&publisher_id) {
                if now.duration_since(*previous) < KEY_FRAME_REQUEST_INTERVAL {
                    return;
                }
            }
            last.insert(publisher_id, now);
        }

        let plugin = self.participants.lock().get(&publisher_id).cloned();
        if let Some(plugin) = plugin {
            plugin.send_fir_packet();
        }
    }

    /// Bookkeeping when a participant leaves: a departing publisher stops
    /// the forwarding until the next switch.
    pub fn on_participant_removed(&self, stream_id: StreamId) {
        let mut publisher = self.publisher.lock();
        if *publisher == Some(stream_id) {
            *publisher = None;
            debug!(session_id = %self.session_id, stream_id = %stream_id, "Publisher left");
        }
        self.last_key_frame_request.lock().remove(&stream_id);
    }
}

impl Drop for VideoDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ForwardLoop {
    running: Arc<AtomicBool>,
    participants: PluginTable,
    publisher: Arc<Mutex<Option<StreamId>>>,
    rebaser: Arc<Mutex<StreamRebaser>>,
}

impl ForwardLoop {
    fn run(self) {
        let mut last_refresh = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let Some(publisher_id) = *self.publisher.lock() else {
                thread::sleep(FORWARD_IDLE_SLEEP);
                continue;
            };

            let publisher = self.participants.lock().get(&publisher_id).cloned();
            let Some(publisher) = publisher else {
                thread::sleep(FORWARD_IDLE_SLEEP);
                continue;
            };

            // Safety net against lost key frames downstream
            if last_refresh.elapsed() > KEY_FRAME_REFRESH_INTERVAL {
                last_refresh = Instant::now();
                publisher.send_fir_packet();
            }

            let Some(packet) = publisher.pop_video() else {
                thread::sleep(FORWARD_IDLE_SLEEP);
                continue;
            };

            let Ok((header, payload)) = RtpHeader::parse(&packet.data) else {
                continue;
            };
            let (seq, timestamp) = self
                .rebaser
                .lock()
                .rebase(header.sequence_number, header.timestamp);

            let output = MediaOutputPacket {
                payload: Bytes::copy_from_slice(payload),
                seq,
                timestamp,
                ssrc: 0,
                marker: header.marker,
                audio_energy: 0,
            };

            let subscribers: Vec<Arc<Plugin>> = self
                .participants
                .lock()
                .iter()
                .filter(|(id, _)| **id != publisher_id)
                .map(|(_, plugin)| plugin.clone())
                .collect();
            for subscriber in subscribers {
                subscriber.relay_media_output(&output, PacketKind::Video);
            }
        }
    }
}
