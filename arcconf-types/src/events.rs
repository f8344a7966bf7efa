//! Conference event definitions surfaced to the signaling collaborator
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ArcconfError, Result};
use crate::ids::{SessionId, StreamId};

/// Event type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "conference.speaker_changed")]
    SpeakerChanged,
    #[serde(rename = "conference.participant_joined")]
    ParticipantJoined,
    #[serde(rename = "conference.participant_left")]
    ParticipantLeft,
    #[serde(rename = "conference.publisher_switched")]
    PublisherSwitched,
}

/// Payload for `conference.speaker_changed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerChangedPayload {
    pub session_id: SessionId,
    /// Stream currently estimated as the dominant speaker
    pub stream_id: StreamId,
}

/// Payload for `conference.participant_joined`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantJoinedPayload {
    pub session_id: SessionId,
    pub stream_id: StreamId,
}

/// Payload for `conference.participant_left`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantLeftPayload {
    pub session_id: SessionId,
    pub stream_id: StreamId,
}

/// Payload for `conference.publisher_switched`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherSwitchedPayload {
    pub session_id: SessionId,
    /// Stream whose video is now forwarded to the other participants
    pub stream_id: StreamId,
}

/// Base event structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type identifier
    pub event_type: EventType,

    /// Unique event identifier
    pub event_id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Source service that published the event
    pub source: String,

    /// Event payload (type depends on event_type)
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self> {
        let payload_value = serde_json::to_value(payload)?;

        Ok(Self {
            event_type,
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload: payload_value,
        })
    }

    /// Deserialize the payload into a specific type
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ArcconfError::InvalidPayload(e.to_string()))
    }

    /// Validate that the payload matches the event type
    pub fn validate(&self) -> Result<()> {
        match self.event_type {
            EventType::SpeakerChanged => {
                let _: SpeakerChangedPayload = self.payload_as()?;
            }
            EventType::ParticipantJoined => {
                let _: ParticipantJoinedPayload = self.payload_as()?;
            }
            EventType::ParticipantLeft => {
                let _: ParticipantLeftPayload = self.payload_as()?;
            }
            EventType::PublisherSwitched => {
                let _: PublisherSwitchedPayload = self.payload_as()?;
            }
        }
        Ok(())
    }
}
