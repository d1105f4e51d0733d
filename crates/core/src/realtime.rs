//! Wire types for the upstream real-time speech API.
//!
//! Only the subset the relay actually uses is modelled. Inbound events that the
//! relay does not forward are still named so they can be logged by kind.

use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful, friendly voice assistant. Keep your answers short and conversational.";
pub const GREETING_INSTRUCTIONS: &str =
    "Greet the caller warmly in one short sentence, then ask how you can help them today.";
pub const TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Server-side voice activity detection knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnDetectionSettings {
    /// Activation threshold in `[0, 1]`. Higher is less sensitive.
    pub threshold: f32,
    /// Audio kept before detected speech, in milliseconds.
    pub prefix_padding_ms: u32,
    /// Silence required before the turn is considered complete, in milliseconds.
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionSettings {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            prefix_padding_ms: 300,
            silence_duration_ms: 800,
        }
    }
}

// --- Outbound (relay -> upstream) ---

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    #[serde(rename = "pcm16")]
    Pcm16,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

impl From<TurnDetectionSettings> for TurnDetection {
    fn from(s: TurnDetectionSettings) -> Self {
        TurnDetection::ServerVad {
            threshold: s.threshold,
            prefix_padding_ms: s.prefix_padding_ms,
            silence_duration_ms: s.silence_duration_ms,
        }
    }
}

/// Body of the `session.update` negotiation message.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionParameters {
    pub modalities: Vec<Modality>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: TurnDetection,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ResponseParameters {
    pub modalities: Vec<Modality>,
    pub instructions: String,
}

/// Instructions the relay sends to the upstream API.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum UpstreamInstruction {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParameters },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseParameters },
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl UpstreamInstruction {
    /// Builds the single negotiation message sent right after the upstream opens.
    pub fn negotiate(config: &SessionConfig, turn_detection: TurnDetectionSettings) -> Self {
        UpstreamInstruction::SessionUpdate {
            session: SessionParameters {
                modalities: vec![Modality::Text, Modality::Audio],
                instructions: non_empty(config.instructions.as_deref())
                    .unwrap_or(DEFAULT_INSTRUCTIONS)
                    .to_string(),
                voice: non_empty(config.voice.as_deref())
                    .unwrap_or(DEFAULT_VOICE)
                    .to_string(),
                input_audio_format: AudioFormat::Pcm16,
                output_audio_format: AudioFormat::Pcm16,
                input_audio_transcription: TranscriptionSettings {
                    model: TRANSCRIPTION_MODEL.to_string(),
                },
                turn_detection: turn_detection.into(),
            },
        }
    }

    /// The "agent speaks first" kickoff.
    pub fn greeting() -> Self {
        UpstreamInstruction::ResponseCreate {
            response: ResponseParameters {
                modalities: vec![Modality::Text, Modality::Audio],
                instructions: GREETING_INSTRUCTIONS.to_string(),
            },
        }
    }

    pub fn append_audio(audio: String) -> Self {
        UpstreamInstruction::InputAudioBufferAppend { audio }
    }
}

// --- Inbound (upstream -> relay) ---

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenDetails {
    #[serde(default)]
    pub audio_tokens: Option<u64>,
    #[serde(default)]
    pub text_tokens: Option<u64>,
    #[serde(default)]
    pub cached_tokens: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageStats {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub input_token_details: Option<TokenDetails>,
    #[serde(default)]
    pub output_token_details: Option<TokenDetails>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSummary {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageStats>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Events received from the upstream API.
///
/// Both the beta and the GA names of the audio events are accepted.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum UpstreamEvent {
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta { delta: String },
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta"
    )]
    AssistantTranscriptDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done"
    )]
    AssistantTranscriptDone {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscriptCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseSummary,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "input_audio_buffer.committed")]
    AudioBufferCommitted,
    #[serde(rename = "conversation.item.created")]
    ItemCreated,
    #[serde(rename = "response.content_part.added")]
    ContentPartAdded,
    #[serde(rename = "response.content_part.done")]
    ContentPartDone,
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated,
    #[serde(other)]
    Unrecognized,
}

impl UpstreamEvent {
    /// Decodes one upstream text frame, returning its raw `type` alongside the event.
    pub fn decode(text: &str) -> serde_json::Result<(String, Self)> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let event = serde_json::from_value(value)?;
        Ok((kind, event))
    }
}
