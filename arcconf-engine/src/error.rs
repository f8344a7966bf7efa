//! Error types for the conference media engine
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


use thiserror::Error;

/// Result type for media engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the media engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// RTP packet parsing error
    #[error("RTP packet parse error: {0}")]
    RtpParseError(String),

    /// RTCP packet parsing error
    #[error("RTCP packet parse error: {0}")]
    RtcpParseError(String),

    /// Invalid packet format
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    /// Stream not found
    #[error("Stream not found: {stream_id}")]
    StreamNotFound { stream_id: u32 },

    /// Stream already exists
    #[error("Stream already exists: {stream_id}")]
    StreamExists { stream_id: u32 },

    /// Invalid room or plugin state
    #[error("Invalid state: {state}")]
    InvalidState { state: String },

    /// Codec error
    #[error("Codec error: {0}")]
    CodecError(String),

    /// Queue error
    #[error("Queue error: {0}")]
    QueueError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}
