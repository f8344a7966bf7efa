//! Conference media core for the arcconf gateway
//!
//! This crate is the real-time relay/mixing heart of a multi-party
//! conference: per room it receives RTP from every participant, mixes,
//! bridges or selectively forwards each stream, and re-emits correctly
//! sequenced, re-stamped RTP within a bounded per-tick latency.
//!
//! The pieces:
//! - Per-stream jitter queues feeding the decode stage
//! - A fixed-tick mixer with an encode worker pool
//! - Active speaker estimation
//! - Room/plugin topologies: echo, bridge, mixer, publisher-switch SFU,
//!   classroom multi-SSRC fan-in
//!
//! ICE/DTLS/SRTP, SDP and the RPC surface live in collaborating services;
//! this crate consumes and produces plain RTP/RTCP at the transport
//! boundary.
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


pub mod codec;
pub mod dispatcher;
pub mod energy;
pub mod error;
pub mod jitter;
pub mod media_packet;
pub mod mixer;
pub mod net_status;
pub mod plugin;
pub mod rebase;
pub mod room;
pub mod rtcp;
pub mod rtp;
pub mod speaker;
pub mod stream_buffer;

// Re-export main types
pub use codec::{AudioDecoder, AudioEncoder};
pub use dispatcher::VideoDispatcher;
pub use energy::frame_energy;
pub use error::{EngineError, EngineResult};
pub use jitter::JitterQueue;
pub use media_packet::{DecodedFrame, MediaOutputPacket, MediaPacket, PacketKind};
pub use mixer::{MixerEngine, MixerOutputListener};
pub use net_status::{DownlinkStats, NetworkStatusRegistry};
pub use plugin::{
    PacketSink, Plugin, PluginKind, PluginState, StreamVideoEntry, TransportState,
};
pub use rebase::StreamRebaser;
pub use room::{ConferenceEventListener, Room, RoomTopology};
pub use rtp::{RtpHeader, RtpPacket};
pub use speaker::{SpeakerChangeListener, SpeakerEstimator};
pub use stream_buffer::AudioStreamBuffer;
