//! Transport plugins: one per participant, polymorphic over the room
//! topology
//!
//! A plugin owns one participant's media endpoints inside a room. The
//! topology-specific behavior is a closed set of variants over a single
//! capability surface (incoming RTP/RTCP, relay RTP/RTCP, transport state
//! change) rather than a virtual hierarchy: rooms dispatch on the variant.
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
use crate::jitter::JitterQueue;
use crate::media_packet::{MediaOutputPacket, MediaPacket, PacketKind};
use crate::mixer::MixerOutputListener;
use crate::rebase::StreamRebaser;
use crate::rtcp;
use crate::rtp::{self, RtpHeader, OPUS_48000_PT, VP8_90000_PT};
use arcconf_types::{SessionId, StreamId};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Transport (ICE/DTLS) state reported by the transport collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Ready,
    Failed,
    Closed,
}

/// Outbound delegate registered by the transport layer. Invoked from the
/// mixer, worker and dispatcher threads; implementations must either be
/// thread-safe or provide their own hand-off queue.
pub trait PacketSink: Send + Sync {
    fn relay_packet(&self, packet: &MediaPacket);
}

/// Plugin lifecycle; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Created,
    Ready,
    Active,
    Stopped,
}

/// Entry of the stream/video-slot map reported to the RPC collaborator
#[derive(Debug, Clone, Serialize)]
pub struct StreamVideoEntry {
    pub stream_id: StreamId,
    pub video_id: u32,
    pub mslabel: String,
}

struct SlotContext {
    rebaser: StreamRebaser,
    source_stream_id: StreamId,
}

/// Classroom downstream slot table: K pre-negotiated SSRCs, each bindable
/// to one source stream at a time.
#[derive(Default)]
pub struct ClassroomSlots {
    /// (slot downstream SSRC, bound source SSRC; 0 = free)
    slots: Vec<(u32, u32)>,
    /// Rebase context per slot SSRC, kept across rebinds so the slot's
    /// outbound series never jumps backwards
    contexts: HashMap<u32, SlotContext>,
}

impl ClassroomSlots {
    fn set_slot_ssrcs(&mut self, ssrcs: Vec<u32>) {
        self.slots = ssrcs.into_iter().map(|ssrc| (ssrc, 0)).collect();
    }

    fn link(&mut self, source_ssrc: u32, source_stream_id: StreamId) {
        self.unlink(source_ssrc);
        for (slot_ssrc, bound) in self.slots.iter_mut() {
            if *bound == 0 {
                *bound = source_ssrc;
                match self.contexts.get_mut(slot_ssrc) {
                    Some(context) => {
                        // Reused slot: splice the new source into the
                        // existing outbound series
                        context.rebaser.relink();
                        context.source_stream_id = source_stream_id;
                    }
                    None => {
                        self.contexts.insert(
                            *slot_ssrc,
                            SlotContext {
                                rebaser: StreamRebaser::new(),
                                source_stream_id,
                            },
                        );
                    }
                }
                return;
            }
        }
        debug!(source_ssrc, "No free classroom slot for source");
    }

    fn unlink(&mut self, source_ssrc: u32) {
        for (_, bound) in self.slots.iter_mut() {
            if *bound == source_ssrc {
                *bound = 0;
            }
        }
    }

    fn slot_for_source(&mut self, source_ssrc: u32) -> Option<(u32, &mut SlotContext)> {
        let slot_ssrc = self
            .slots
            .iter()
            .find(|(_, bound)| *bound == source_ssrc)
            .map(|(slot, _)| *slot)?;
        self.contexts
            .get_mut(&slot_ssrc)
            .map(|context| (slot_ssrc, context))
    }

    fn video_map(&self) -> Vec<StreamVideoEntry> {
        let mut entries = Vec::new();
        for (index, (slot_ssrc, bound)) in self.slots.iter().enumerate() {
            let video_id = index as u32 + 1;
            if *bound != 0 {
                if let Some(context) = self.contexts.get(slot_ssrc) {
                    entries.push(StreamVideoEntry {
                        stream_id: context.source_stream_id,
                        video_id,
                        mslabel: format!("v{video_id}"),
                    });
                }
            }
        }
        entries
    }
}

/// Topology-specific plugin state
pub enum PluginKind {
    /// Loopback smoke test: every RTP packet is relayed straight back
    Echo,
    /// Exactly two participants, verbatim relay each to the other
    Bridge,
    /// Participant of a mixing room; audio arrives via the mixer output
    Mixer,
    /// Participant of a publisher-switch SFU; inbound video is queued for
    /// the forward thread
    Dispatcher { video_queue: Mutex<JitterQueue> },
    /// Classroom participant with multi-SSRC downstream fan-in
    Classroom { slots: Mutex<ClassroomSlots> },
}

/// One participant's endpoint in a room. Exclusively owned by its room and
/// removed exactly once.
pub struct Plugin {
    session_id: SessionId,
    stream_id: StreamId,
    state: Mutex<PluginState>,
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    downstream_ssrc: AtomicU32,
    upstream_ssrc: AtomicU32,
    /// Most recent inbound video payload type (VP8/VP9/H264), echoed on
    /// forwarded output
    video_payload: AtomicU8,
    fir_seq: Mutex<u8>,
    kind: PluginKind,
}

impl Plugin {
    pub fn new(session_id: SessionId, stream_id: StreamId, kind: PluginKind) -> Self {
        Plugin {
            session_id,
            stream_id,
            state: Mutex::new(PluginState::Created),
            sink: Mutex::new(None),
            downstream_ssrc: AtomicU32::new(rand::random::<u32>() | 1),
            upstream_ssrc: AtomicU32::new(0),
            video_payload: AtomicU8::new(0),
            fir_seq: Mutex::new(0),
            kind,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn kind(&self) -> &PluginKind {
        &self.kind
    }

    pub fn state(&self) -> PluginState {
        *self.state.lock()
    }

    /// Whether the plugin currently relays media
    pub fn active(&self) -> bool {
        *self.state.lock() == PluginState::Active
    }

    /// Transition Created → Ready once the transport has negotiated media
    /// directions and SSRCs. SSRC-dependent setup happens after this.
    pub fn mark_ready(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        match *state {
            PluginState::Created | PluginState::Ready => {
                *state = PluginState::Ready;
                Ok(())
            }
            other => Err(EngineError::InvalidState {
                state: format!("{other:?}"),
            }),
        }
    }

    /// Transition Ready → Active: media starts flowing
    pub fn activate(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        match *state {
            PluginState::Ready | PluginState::Active => {
                *state = PluginState::Active;
                Ok(())
            }
            other => Err(EngineError::InvalidState {
                state: format!("{other:?}"),
            }),
        }
    }

    /// Terminal stop: detach from the transport delegate. Relay calls
    /// afterwards are no-ops.
    pub fn stop(&self) {
        *self.state.lock() = PluginState::Stopped;
        *self.sink.lock() = None;
        info!(session_id = %self.session_id, stream_id = %self.stream_id, "Plugin stopped");
    }

    pub fn set_sink(&self, sink: Arc<dyn PacketSink>) {
        *self.sink.lock() = Some(sink);
    }

    pub fn downstream_ssrc(&self) -> u32 {
        self.downstream_ssrc.load(Ordering::Relaxed)
    }

    pub fn set_downstream_ssrc(&self, ssrc: u32) {
        self.downstream_ssrc.store(ssrc, Ordering::Relaxed);
    }

    pub fn upstream_ssrc(&self) -> u32 {
        self.upstream_ssrc.load(Ordering::Relaxed)
    }

    pub fn set_upstream_ssrc(&self, ssrc: u32) {
        self.upstream_ssrc.store(ssrc, Ordering::Relaxed);
    }

    /// Inbound RTP from the transport. Topology-local handling only; the
    /// room routes everything that crosses participants.
    pub fn incoming_rtp_packet(&self, packet: MediaPacket) {
        if !self.active() {
            return;
        }
        if packet.kind == PacketKind::Video {
            if let Ok(payload_type) = rtp::peek_payload_type(&packet.data) {
                self.video_payload.store(payload_type, Ordering::Relaxed);
            }
        }
        match &self.kind {
            PluginKind::Echo => self.relay_rtp_packet(&packet),
            PluginKind::Dispatcher { video_queue } => {
                if packet.kind == PacketKind::Video {
                    let mut queue = video_queue.lock();
                    queue.set_timebase(90000);
                    queue.push(packet);
                }
            }
            _ => {}
        }
    }

    /// Inbound RTCP from the transport. Topology-local handling only.
    pub fn incoming_rtcp_packet(&self, packet: MediaPacket) {
        if let PluginKind::Echo = &self.kind {
            if packet.kind == PacketKind::Video {
                self.relay_rtcp_packet(&packet);
            }
        }
    }

    /// Relay one RTP packet to the participant through the transport
    /// delegate. No-op unless Active.
    pub fn relay_rtp_packet(&self, packet: &MediaPacket) {
        if !self.active() {
            return;
        }
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.relay_packet(packet);
        }
    }

    /// Relay one RTCP packet. Allowed from Ready on (key-frame requests
    /// precede media), never after Stopped.
    pub fn relay_rtcp_packet(&self, packet: &MediaPacket) {
        if self.state() == PluginState::Stopped {
            return;
        }
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.relay_packet(packet);
        }
    }

    /// Wrap an encoded output frame in an RTP header and relay it.
    ///
    /// The classroom variant additionally rewrites nothing here: mixed
    /// audio always goes out on the participant's own downstream SSRC.
    pub fn relay_media_output(&self, packet: &MediaOutputPacket, kind: PacketKind) {
        if packet.payload.is_empty() {
            return;
        }
        let payload_type = match kind {
            PacketKind::Audio => OPUS_48000_PT,
            PacketKind::Video => {
                let seen = self.video_payload.load(Ordering::Relaxed);
                if seen == 0 {
                    VP8_90000_PT
                } else {
                    seen
                }
            }
        };
        let ssrc = if packet.ssrc != 0 {
            packet.ssrc
        } else {
            self.downstream_ssrc()
        };

        let header = RtpHeader {
            marker: packet.marker,
            payload_type,
            sequence_number: packet.seq,
            timestamp: packet.timestamp,
            ssrc,
            ..RtpHeader::default()
        };
        let mut bytes = BytesMut::from(&header.serialize()[..]);
        bytes.put_slice(&packet.payload);

        self.relay_rtp_packet(&MediaPacket {
            kind,
            data: Bytes::from(bytes.to_vec()),
            received_time_ms: 0,
        });
    }

    /// Ask this participant's sender for a fresh key frame: one FIR plus a
    /// PLI, aimed at its upstream video SSRC.
    pub fn send_fir_packet(&self) {
        let media_ssrc = self.upstream_ssrc();
        let fir = {
            let mut seq = self.fir_seq.lock();
            rtcp::build_fir(self.downstream_ssrc(), media_ssrc, &mut seq)
        };
        self.relay_rtcp_packet(&MediaPacket::video(fir));

        let pli = rtcp::build_pli(self.downstream_ssrc(), media_ssrc);
        self.relay_rtcp_packet(&MediaPacket::video(pli));
    }

    /// Dispatcher lane: pop the next queued video packet for forwarding
    pub fn pop_video(&self) -> Option<MediaPacket> {
        match &self.kind {
            PluginKind::Dispatcher { video_queue } => {
                let mut queue = video_queue.lock();
                if queue.is_empty() {
                    None
                } else {
                    queue.pop(true)
                }
            }
            _ => None,
        }
    }

    /// Classroom: install the pre-negotiated downstream slot SSRCs
    pub fn set_extended_video_ssrcs(&self, ssrcs: Vec<u32>) {
        if let PluginKind::Classroom { slots } = &self.kind {
            slots.lock().set_slot_ssrcs(ssrcs);
        }
    }

    /// Classroom: bind a source stream's video SSRC to a free local slot
    pub fn link_to_ssrc(&self, source_ssrc: u32, source_stream_id: StreamId) {
        if let PluginKind::Classroom { slots } = &self.kind {
            slots.lock().link(source_ssrc, source_stream_id);
        }
    }

    /// Classroom: release whatever slot the source SSRC occupies
    pub fn unlink_ssrc(&self, source_ssrc: u32) {
        if let PluginKind::Classroom { slots } = &self.kind {
            slots.lock().unlink(source_ssrc);
        }
    }

    /// Classroom: rewrite a forwarded video packet's sequence number,
    /// timestamp and SSRC onto the slot's contiguous counters, then relay.
    pub fn relay_classroom_video(&self, packet: &MediaPacket) -> EngineResult<()> {
        let PluginKind::Classroom { slots } = &self.kind else {
            return Err(EngineError::InvalidState {
                state: "not a classroom plugin".to_string(),
            });
        };
        if !self.active() {
            return Ok(());
        }

        let source_ssrc = rtp::peek_ssrc(&packet.data)?;
        let source_seq = rtp::peek_sequence(&packet.data)?;
        let source_ts = rtp::peek_timestamp(&packet.data)?;

        let mut data = packet.data.to_vec();
        {
            let mut slots = slots.lock();
            let Some((slot_ssrc, context)) = slots.slot_for_source(source_ssrc) else {
                // Source not mapped onto this participant; nothing to send
                return Ok(());
            };
            let (seq, ts) = context.rebaser.rebase(source_seq, source_ts);
            rtp::patch_ssrc(&mut data, slot_ssrc)?;
            rtp::patch_sequence(&mut data, seq)?;
            rtp::patch_timestamp(&mut data, ts)?;
        }

        self.relay_rtp_packet(&MediaPacket {
            kind: PacketKind::Video,
            data: Bytes::from(data),
            received_time_ms: packet.received_time_ms,
        });
        Ok(())
    }

    /// Classroom: current slot occupancy for the RPC collaborator
    pub fn stream_video_map(&self) -> Vec<StreamVideoEntry> {
        match &self.kind {
            PluginKind::Classroom { slots } => slots.lock().video_map(),
            _ => Vec::new(),
        }
    }
}

impl MixerOutputListener for Plugin {
    fn on_audio_mixed(&self, packet: &MediaOutputPacket) {
        self.relay_media_output(packet, PacketKind::Audio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        packets: Mutex<Vec<MediaPacket>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                packets: Mutex::new(Vec::new()),
            })
        }
    }

    impl PacketSink for RecordingSink {
        fn relay_packet(&self, packet: &MediaPacket) {
            self.packets.lock().push(packet.clone());
        }
    }

    fn video_packet(ssrc: u32, seq: u16, ts: u32) -> MediaPacket {
        let header = RtpHeader {
            payload_type: VP8_90000_PT,
            sequence_number: seq,
            timestamp: ts,
            ssrc,
            ..RtpHeader::default()
        };
        let mut bytes = BytesMut::from(&header.serialize()[..]);
        bytes.put_slice(b"frame");
        MediaPacket::video(Bytes::from(bytes.to_vec()))
    }

    fn active_plugin(kind: PluginKind) -> (Plugin, Arc<RecordingSink>) {
        let plugin = Plugin::new(SessionId(1), StreamId(10), kind);
        let sink = RecordingSink::new();
        plugin.set_sink(sink.clone());
        plugin.mark_ready().unwrap();
        plugin.activate().unwrap();
        (plugin, sink)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let plugin = Plugin::new(SessionId(1), StreamId(1), PluginKind::Mixer);
        assert_eq!(plugin.state(), PluginState::Created);
        assert!(plugin.activate().is_err()); // must pass through Ready
        plugin.mark_ready().unwrap();
        plugin.activate().unwrap();
        assert!(plugin.active());

        plugin.stop();
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(plugin.mark_ready().is_err()); // terminal
    }

    #[test]
    fn test_relay_after_stop_is_noop() {
        let (plugin, sink) = active_plugin(PluginKind::Mixer);
        plugin.stop();
        plugin.relay_rtp_packet(&video_packet(1, 1, 1));
        plugin.relay_rtcp_packet(&video_packet(1, 1, 1));
        assert!(sink.packets.lock().is_empty());
    }

    #[test]
    fn test_echo_loops_rtp_back() {
        let (plugin, sink) = active_plugin(PluginKind::Echo);
        plugin.incoming_rtp_packet(video_packet(5, 7, 700));
        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(rtp::peek_sequence(&packets[0].data).unwrap(), 7);
    }

    #[test]
    fn test_mixed_audio_is_packetized() {
        let (plugin, sink) = active_plugin(PluginKind::Mixer);
        plugin.set_downstream_ssrc(0xABCD);
        plugin.on_audio_mixed(&MediaOutputPacket {
            payload: Bytes::from_static(b"opus"),
            seq: 42,
            timestamp: 4800,
            ssrc: 0,
            marker: false,
            audio_energy: 0,
        });

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        assert_eq!(rtp::peek_sequence(data).unwrap(), 42);
        assert_eq!(rtp::peek_timestamp(data).unwrap(), 4800);
        assert_eq!(rtp::peek_ssrc(data).unwrap(), 0xABCD);
        assert_eq!(rtp::peek_payload_type(data).unwrap(), OPUS_48000_PT);
        assert_eq!(&data[12..], b"opus");
    }

    #[test]
    fn test_fir_request_carries_upstream_ssrc() {
        let (plugin, sink) = active_plugin(PluginKind::Dispatcher {
            video_queue: Mutex::new(JitterQueue::new(0.0, 5.0)),
        });
        plugin.set_upstream_ssrc(0x7777);
        plugin.send_fir_packet();

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 2); // FIR plus PLI
        assert!(rtcp::has_fir(&packets[0].data));
        assert!(rtcp::has_pli(&packets[1].data));
        assert_eq!(&packets[0].data[12..16], &0x7777u32.to_be_bytes());
    }

    #[test]
    fn test_dispatcher_queues_video() {
        let (plugin, _sink) = active_plugin(PluginKind::Dispatcher {
            video_queue: Mutex::new(JitterQueue::new(0.0, 5.0)),
        });
        assert!(plugin.pop_video().is_none());
        plugin.incoming_rtp_packet(video_packet(9, 1, 90));
        plugin.incoming_rtp_packet(video_packet(9, 2, 180));
        let first = plugin.pop_video().unwrap();
        assert_eq!(rtp::peek_sequence(&first.data).unwrap(), 1);
    }

    #[test]
    fn test_classroom_rewrite_and_video_map() {
        let (plugin, sink) = active_plugin(PluginKind::Classroom {
            slots: Mutex::new(ClassroomSlots::default()),
        });
        plugin.set_extended_video_ssrcs(vec![0x1000, 0x2000]);
        plugin.link_to_ssrc(0xAAAA, StreamId(33));

        plugin
            .relay_classroom_video(&video_packet(0xAAAA, 100, 1000))
            .unwrap();
        plugin
            .relay_classroom_video(&video_packet(0xAAAA, 101, 1010))
            .unwrap();
        // Unlinked source produces nothing
        plugin
            .relay_classroom_video(&video_packet(0xBBBB, 5, 50))
            .unwrap();

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 2);
        assert_eq!(rtp::peek_ssrc(&packets[0].data).unwrap(), 0x1000);
        let seq_a = rtp::peek_sequence(&packets[0].data).unwrap();
        let seq_b = rtp::peek_sequence(&packets[1].data).unwrap();
        assert_eq!(seq_b, seq_a.wrapping_add(1));

        let map = plugin.stream_video_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].stream_id, StreamId(33));
        assert_eq!(map[0].video_id, 1);
        assert_eq!(map[0].mslabel, "v1");
    }

    #[test]
    fn test_classroom_relink_keeps_series_increasing() {
        let (plugin, sink) = active_plugin(PluginKind::Classroom {
            slots: Mutex::new(ClassroomSlots::default()),
        });
        plugin.set_extended_video_ssrcs(vec![0x1000]);

        plugin.link_to_ssrc(0xAAAA, StreamId(1));
        plugin
            .relay_classroom_video(&video_packet(0xAAAA, 100, 1000))
            .unwrap();
        plugin
            .relay_classroom_video(&video_packet(0xAAAA, 101, 1010))
            .unwrap();

        // New source takes over the slot with lower raw numbering
        plugin.unlink_ssrc(0xAAAA);
        plugin.link_to_ssrc(0xBBBB, StreamId(2));
        plugin
            .relay_classroom_video(&video_packet(0xBBBB, 50, 500))
            .unwrap();
        plugin
            .relay_classroom_video(&video_packet(0xBBBB, 51, 510))
            .unwrap();

        let packets = sink.packets.lock();
        let seqs: Vec<u16> = packets
            .iter()
            .map(|p| rtp::peek_sequence(&p.data).unwrap())
            .collect();
        let tss: Vec<u32> = packets
            .iter()
            .map(|p| rtp::peek_timestamp(&p.data).unwrap())
            .collect();
        for pair in seqs.windows(2) {
            assert!(pair[1] > pair[0], "sequence must increase: {seqs:?}");
        }
        for pair in tss.windows(2) {
            assert!(pair[1] > pair[0], "timestamp must increase: {tss:?}");
        }
    }
}
