//! Defines the WebSocket message protocol between the browser client and the relay.
//!
//! Every frame is a JSON object tagged by its `type` field. Field names are
//! camelCase on the wire.

use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser) to the relay.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Attaches the session configuration and opens the upstream connection.
    #[serde(rename = "session.start")]
    SessionStart {
        #[serde(default)]
        config: SessionConfig,
    },
    /// A chunk of base64 encoded PCM16 audio captured from the microphone.
    #[serde(rename = "audio.input")]
    AudioInput { audio: String },
    /// Ends the current call. Always answered with `session.ended`.
    #[serde(rename = "session.end")]
    SessionEnd,
}

/// Who produced a transcript.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Token accounting for one completed upstream response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub audio_input_ms: u64,
    pub audio_output_ms: u64,
}

/// Messages sent from the relay to the client (browser).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once, right after the client connection is accepted.
    #[serde(rename = "session.created")]
    SessionCreated { session_id: String },
    /// The upstream connection is open and negotiated.
    #[serde(rename = "session.ready")]
    SessionReady,
    /// A chunk of base64 encoded PCM16 audio spoken by the assistant.
    #[serde(rename = "audio.output")]
    AudioOutput { audio: String },
    /// An incremental transcript fragment.
    #[serde(rename = "transcript.partial")]
    TranscriptPartial {
        role: Role,
        text: String,
        item_id: Option<String>,
    },
    /// A completed transcript.
    #[serde(rename = "transcript.final")]
    TranscriptFinal {
        role: Role,
        text: String,
        item_id: Option<String>,
    },
    #[serde(rename = "usage.update")]
    UsageUpdate(UsageReport),
    /// A human readable failure description.
    #[serde(rename = "error")]
    Error { message: String },
    /// The call is over; the client may send a new `session.start`.
    #[serde(rename = "session.ended")]
    SessionEnded,
}

impl ServerMessage {
    /// Shorthand for building an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
