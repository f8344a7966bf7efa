//! Room: one conference session's participants and topology
//!
//! A room exclusively owns its participants as entries in an id-indexed
//! table; every cross-reference anywhere in the engine is a lookup by
//! stream id. The room picks the packet-routing topology, drives the
//! plugin lifecycle and fans inbound packets to the mixer, dispatcher or
//! peer plugins.
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


use crate::dispatcher::{PluginTable, VideoDispatcher};
use crate::error::{EngineError, EngineResult};
use crate::jitter::JitterQueue;
use crate::media_packet::{MediaPacket, PacketKind};
use crate::mixer::MixerEngine;
use crate::net_status::NetworkStatusRegistry;
use crate::plugin::{
    ClassroomSlots, PacketSink, Plugin, PluginKind, StreamVideoEntry, TransportState,
};
use crate::rtcp;
use crate::speaker::SpeakerChangeListener;
use arcconf_config::EngineConfig;
use arcconf_types::{
    Event, EventType, ParticipantJoinedPayload, ParticipantLeftPayload, PublisherSwitchedPayload,
    SessionId, SpeakerChangedPayload, StreamId,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Packet-routing topology of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomTopology {
    /// Loopback smoke test
    Echo,
    /// Exactly two participants, verbatim relay
    Bridge,
    /// N-way audio mixing; video goes to an external compositing collaborator
    AudioMixer,
    /// Publisher-switch SFU video forwarding
    VideoDispatcher,
    /// Audio mixing plus multi-SSRC video fan-in
    Classroom,
}

/// Room lifecycle; `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomState {
    Created,
    Running,
    Destroyed,
}

/// Receives the room's conference events (speaker changes, membership)
pub trait ConferenceEventListener: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Event fan-out shared with the mixer's speaker estimator
struct RoomEvents {
    session_id: SessionId,
    listener: Mutex<Option<Arc<dyn ConferenceEventListener>>>,
}

impl RoomEvents {
    fn emit(&self, event_type: EventType, payload: impl Serialize) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            match Event::new(event_type, "arcconf-engine", payload) {
                Ok(event) => listener.on_event(event),
                Err(e) => warn!(error = %e, "Failed to build conference event"),
            }
        }
    }
}

impl SpeakerChangeListener for RoomEvents {
    fn on_speaker_changed(&self, stream_id: StreamId) {
        self.emit(
            EventType::SpeakerChanged,
            SpeakerChangedPayload {
                session_id: self.session_id,
                stream_id,
            },
        );
    }
}

/// One conference session on this worker
pub struct Room {
    session_id: SessionId,
    topology: RoomTopology,
    config: EngineConfig,
    state: Mutex<RoomState>,
    plugins: PluginTable,
    mixer: Option<Arc<MixerEngine>>,
    dispatcher: Option<Arc<VideoDispatcher>>,
    net: Arc<NetworkStatusRegistry>,
    events: Arc<RoomEvents>,
    /// External video-compositing collaborator for mixing rooms
    video_collaborator: Mutex<Option<Arc<dyn PacketSink>>>,
}

impl Room {
    /// Create a room with its topology-specific engines. Threads are not
    /// spawned until `start()` / the first ready transport.
    pub fn new(session_id: SessionId, topology: RoomTopology, config: EngineConfig) -> Self {
        let plugins: PluginTable = Arc::new(Mutex::new(BTreeMap::new()));
        let net = Arc::new(NetworkStatusRegistry::new());
        let events = Arc::new(RoomEvents {
            session_id,
            listener: Mutex::new(None),
        });

        let mixer = match topology {
            RoomTopology::AudioMixer | RoomTopology::Classroom => {
                let mixer = Arc::new(MixerEngine::new(session_id, config.clone(), net.clone()));
                mixer.set_speaker_listener(events.clone());
                Some(mixer)
            }
            _ => None,
        };
        let dispatcher = match topology {
            RoomTopology::VideoDispatcher => {
                Some(Arc::new(VideoDispatcher::new(session_id, plugins.clone())))
            }
            _ => None,
        };

        Room {
            session_id,
            topology,
            config,
            state: Mutex::new(RoomState::Created),
            plugins,
            mixer,
            dispatcher,
            net,
            events,
            video_collaborator: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn topology(&self) -> RoomTopology {
        self.topology
    }

    /// Register the conference event consumer (signaling collaborator)
    pub fn set_event_listener(&self, listener: Arc<dyn ConferenceEventListener>) {
        *self.events.listener.lock() = Some(listener);
    }

    /// Register the external video-compositing collaborator of a mixing
    /// room; inbound video is handed over verbatim.
    pub fn set_video_collaborator(&self, sink: Arc<dyn PacketSink>) {
        *self.video_collaborator.lock() = Some(sink);
    }

    /// Transition Created → Running and start the forward thread of a
    /// dispatcher room. The audio mixer starts lazily with the first
    /// ready transport.
    pub fn start(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        match *state {
            RoomState::Created | RoomState::Running => {
                *state = RoomState::Running;
            }
            RoomState::Destroyed => {
                return Err(EngineError::InvalidState {
                    state: "destroyed".to_string(),
                });
            }
        }
        drop(state);

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.start()?;
        }
        info!(session_id = %self.session_id, topology = ?self.topology, "Room started");
        Ok(())
    }

    /// Add one participant, registering it with the topology engines.
    /// Returns the plugin handle for transport wiring (SSRCs, state).
    pub fn add_participant(
        &self,
        stream_id: StreamId,
        sink: Arc<dyn PacketSink>,
    ) -> EngineResult<Arc<Plugin>> {
        if *self.state.lock() == RoomState::Destroyed {
            return Err(EngineError::InvalidState {
                state: "destroyed".to_string(),
            });
        }

        let kind = match self.topology {
            RoomTopology::Echo => PluginKind::Echo,
            RoomTopology::Bridge => PluginKind::Bridge,
            RoomTopology::AudioMixer => PluginKind::Mixer,
            RoomTopology::VideoDispatcher => PluginKind::Dispatcher {
                video_queue: Mutex::new(JitterQueue::from_config(&self.config.jitter)),
            },
            RoomTopology::Classroom => PluginKind::Classroom {
                slots: Mutex::new(ClassroomSlots::default()),
            },
        };

        let plugin = {
            let mut plugins = self.plugins.lock();
            if plugins.contains_key(&stream_id) {
                return Err(EngineError::StreamExists {
                    stream_id: stream_id.value(),
                });
            }
            if self.topology == RoomTopology::Bridge && plugins.len() >= 2 {
                return Err(EngineError::InvalidState {
                    state: "bridge already has two participants".to_string(),
                });
            }
            let plugin = Arc::new(Plugin::new(self.session_id, stream_id, kind));
            plugin.set_sink(sink);
            plugins.insert(stream_id, plugin.clone());
            plugin
        };

        if let Some(mixer) = &self.mixer {
            mixer.add_audio_buffer(stream_id)?;
            mixer.register_mix_result_listener(stream_id, plugin.clone());
        }

        self.events.emit(
            EventType::ParticipantJoined,
            ParticipantJoinedPayload {
                session_id: self.session_id,
                stream_id,
            },
        );
        debug!(session_id = %self.session_id, stream_id = %stream_id, "Participant added");
        Ok(plugin)
    }

    /// Remove one participant. Detaches synchronously; the participant's
    /// codec state is torn down exactly once, when the last in-flight
    /// encode task drops its handle.
    pub fn remove_participant(&self, stream_id: StreamId) -> EngineResult<()> {
        let plugin = self
            .plugins
            .lock()
            .remove(&stream_id)
            .ok_or(EngineError::StreamNotFound {
                stream_id: stream_id.value(),
            })?;
        plugin.stop();

        if let Some(mixer) = &self.mixer {
            mixer.unregister_mix_result_listener(stream_id);
            mixer.remove_audio_buffer(stream_id);
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.on_participant_removed(stream_id);
        }
        if self.topology == RoomTopology::Classroom {
            let departed_ssrc = plugin.upstream_ssrc();
            for other in self.plugins.lock().values() {
                other.unlink_ssrc(departed_ssrc);
            }
        }
        self.net.remove(stream_id);

        self.events.emit(
            EventType::ParticipantLeft,
            ParticipantLeftPayload {
                session_id: self.session_id,
                stream_id,
            },
        );
        debug!(session_id = %self.session_id, stream_id = %stream_id, "Participant removed");
        Ok(())
    }

    /// Idempotent teardown: stops every owned thread and blocks until all
    /// of them have joined, then stops and drops every plugin.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state == RoomState::Destroyed {
                return;
            }
            *state = RoomState::Destroyed;
        }

        if let Some(mixer) = &self.mixer {
            mixer.destroy();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.stop();
        }

        let plugins: Vec<Arc<Plugin>> = self.plugins.lock().values().cloned().collect();
        for plugin in &plugins {
            plugin.stop();
        }
        self.plugins.lock().clear();
        info!(session_id = %self.session_id, "Room destroyed");
    }

    /// Transport state callback for one participant.
    ///
    /// The first ready transport starts the audio mixer; a ready classroom
    /// participant gets its video slots linked and everyone re-keys.
    pub fn on_transport_state_change(
        &self,
        stream_id: StreamId,
        state: TransportState,
    ) -> EngineResult<()> {
        let plugin = self.plugin(stream_id)?;
        match state {
            TransportState::Ready => {
                plugin.mark_ready()?;
                plugin.activate()?;

                if let Some(mixer) = &self.mixer {
                    if !mixer.is_started() {
                        mixer.start()?;
                    }
                }
                match self.topology {
                    RoomTopology::Classroom => {
                        self.link_classroom_ssrcs(&plugin);
                        self.request_key_frame_from_all();
                    }
                    RoomTopology::VideoDispatcher => {
                        if let Some(dispatcher) = &self.dispatcher {
                            dispatcher.request_key_frame(stream_id);
                        }
                    }
                    _ => {}
                }
            }
            TransportState::Failed | TransportState::Closed => {
                debug!(session_id = %self.session_id, stream_id = %stream_id, ?state,
                    "Transport gone");
            }
            TransportState::Connecting => {}
        }
        Ok(())
    }

    /// Inbound RTP from the transport receive callback
    pub fn incoming_rtp_packet(&self, stream_id: StreamId, packet: MediaPacket) -> EngineResult<()> {
        let plugin = self.plugin(stream_id)?;
        plugin.incoming_rtp_packet(packet.clone());

        match self.topology {
            RoomTopology::Echo => {}
            RoomTopology::Bridge => self.bridge_relay(stream_id, &packet, PacketRelay::Rtp),
            RoomTopology::AudioMixer => match packet.kind {
                PacketKind::Audio => self.push_to_mixer(stream_id, packet),
                PacketKind::Video => {
                    let collaborator = self.video_collaborator.lock().clone();
                    if let Some(collaborator) = collaborator {
                        collaborator.relay_packet(&packet);
                    }
                }
            },
            RoomTopology::VideoDispatcher => {
                // Video is queued by the plugin for the forward thread;
                // dispatcher rooms carry no audio.
            }
            RoomTopology::Classroom => match packet.kind {
                PacketKind::Audio => self.push_to_mixer(stream_id, packet),
                PacketKind::Video => self.mux_video(stream_id, &packet),
            },
        }
        Ok(())
    }

    /// Inbound RTCP from the transport receive callback
    pub fn incoming_rtcp_packet(
        &self,
        stream_id: StreamId,
        packet: MediaPacket,
    ) -> EngineResult<()> {
        let plugin = self.plugin(stream_id)?;
        plugin.incoming_rtcp_packet(packet.clone());

        if let Ok(reports) = rtcp::parse_receiver_report(&packet.data) {
            for report in reports {
                let percent = report.loss_percent();
                self.net.update_loss(stream_id, percent);
                if let Some(mixer) = &self.mixer {
                    mixer.on_packet_loss(stream_id, percent);
                }
            }
        }

        if self.topology == RoomTopology::Bridge {
            self.bridge_relay(stream_id, &packet, PacketRelay::Rtcp);
            return Ok(());
        }

        if packet.kind == PacketKind::Video
            && (rtcp::has_fir(&packet.data) || rtcp::has_pli(&packet.data))
        {
            match self.topology {
                RoomTopology::VideoDispatcher => {
                    if let Some(dispatcher) = &self.dispatcher {
                        dispatcher.request_key_frame(stream_id);
                    }
                }
                RoomTopology::Classroom => self.request_key_frame_from_all(),
                _ => {}
            }
        }
        Ok(())
    }

    /// Administrative mute for one stream
    pub fn mute_stream(&self, stream_id: StreamId, muted: bool) -> EngineResult<()> {
        match &self.mixer {
            Some(mixer) => mixer.mute(stream_id, muted),
            None => Err(EngineError::InvalidState {
                state: "room has no audio mixer".to_string(),
            }),
        }
    }

    /// Switch the forwarded publisher of a dispatcher room
    pub fn switch_publisher(&self, stream_id: StreamId) -> EngineResult<()> {
        let dispatcher = self.dispatcher.as_ref().ok_or(EngineError::InvalidState {
            state: "room has no dispatcher".to_string(),
        })?;
        dispatcher.switch_publisher(stream_id)?;
        self.events.emit(
            EventType::PublisherSwitched,
            PublisherSwitchedPayload {
                session_id: self.session_id,
                stream_id,
            },
        );
        Ok(())
    }

    /// Classroom slot occupancy for one participant
    pub fn stream_video_map(&self, stream_id: StreamId) -> EngineResult<Vec<StreamVideoEntry>> {
        Ok(self.plugin(stream_id)?.stream_video_map())
    }

    /// Participant handle for transport wiring
    pub fn plugin(&self, stream_id: StreamId) -> EngineResult<Arc<Plugin>> {
        self.plugins
            .lock()
            .get(&stream_id)
            .cloned()
            .ok_or(EngineError::StreamNotFound {
                stream_id: stream_id.value(),
            })
    }

    pub fn participant_count(&self) -> usize {
        self.plugins.lock().len()
    }

    fn push_to_mixer(&self, stream_id: StreamId, packet: MediaPacket) {
        if let Some(mixer) = &self.mixer {
            mixer.push_packet(stream_id, packet);
        }
    }

    fn bridge_relay(&self, from: StreamId, packet: &MediaPacket, relay: PacketRelay) {
        let peers: Vec<Arc<Plugin>> = self.plugins.lock().values().cloned().collect();
        if peers.len() != 2 {
            return;
        }
        for peer in peers {
            if peer.stream_id() == from {
                continue;
            }
            match relay {
                PacketRelay::Rtp => peer.relay_rtp_packet(packet),
                PacketRelay::Rtcp => peer.relay_rtcp_packet(packet),
            }
        }
    }

    /// Classroom fan-in: hand the source packet to every other
    /// participant; each one rewrites it onto its own slot, or drops it if
    /// the source is not linked there.
    fn mux_video(&self, from: StreamId, packet: &MediaPacket) {
        let peers: Vec<Arc<Plugin>> = self.plugins.lock().values().cloned().collect();
        for peer in peers {
            if peer.stream_id() == from {
                continue;
            }
            if let Err(e) = peer.relay_classroom_video(packet) {
                warn!(error = %e, "Classroom relay failed");
            }
        }
    }

    /// Bind a freshly ready classroom participant into everyone's slot
    /// tables, both directions.
    fn link_classroom_ssrcs(&self, new_plugin: &Arc<Plugin>) {
        let peers: Vec<Arc<Plugin>> = self.plugins.lock().values().cloned().collect();
        for peer in peers {
            if peer.stream_id() == new_plugin.stream_id() {
                continue;
            }
            peer.link_to_ssrc(new_plugin.upstream_ssrc(), new_plugin.stream_id());
            new_plugin.link_to_ssrc(peer.upstream_ssrc(), peer.stream_id());
        }
    }

    fn request_key_frame_from_all(&self) {
        let peers: Vec<Arc<Plugin>> = self.plugins.lock().values().cloned().collect();
        for peer in peers {
            peer.send_fir_packet();
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[derive(Clone, Copy)]
enum PacketRelay {
    Rtp,
    Rtcp,
}
