//! Event Translator
//!
//! Stateless mapping between the upstream event vocabulary and the client
//! protocol, in both directions. Each call yields at most one message.

use crate::{
    protocol::{ClientMessage, Role, ServerMessage, UsageReport},
    realtime::{UpstreamEvent, UpstreamInstruction, UsageStats},
    session::SessionConfig,
};
use chrono::Utc;
use tracing::debug;

const UPSTREAM_ERROR_FALLBACK: &str = "The speech service reported an unknown error.";

/// What the coordinator should do with one client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Attach the configuration and open the upstream connection.
    Start(SessionConfig),
    /// Forward the instruction upstream if the link is open.
    Forward(UpstreamInstruction),
    /// Close the upstream link and report `session.ended`.
    End,
}

pub fn translate_client(message: ClientMessage) -> ClientAction {
    match message {
        ClientMessage::SessionStart { config } => ClientAction::Start(config),
        ClientMessage::AudioInput { audio } => {
            ClientAction::Forward(UpstreamInstruction::append_audio(audio))
        }
        ClientMessage::SessionEnd => ClientAction::End,
    }
}

/// Maps one upstream event to the message the client should see, if any.
pub fn translate_upstream(event: UpstreamEvent) -> Option<ServerMessage> {
    match event {
        UpstreamEvent::AudioDelta { delta } => Some(ServerMessage::AudioOutput { audio: delta }),
        UpstreamEvent::AssistantTranscriptDelta { item_id, delta } => {
            (!delta.is_empty()).then(|| ServerMessage::TranscriptPartial {
                role: Role::Assistant,
                text: delta,
                item_id,
            })
        }
        UpstreamEvent::AssistantTranscriptDone {
            item_id,
            transcript,
        } => (!transcript.trim().is_empty()).then(|| ServerMessage::TranscriptFinal {
            role: Role::Assistant,
            text: transcript,
            item_id,
        }),
        UpstreamEvent::UserTranscriptCompleted {
            item_id,
            transcript,
        } => {
            if transcript.trim().is_empty() {
                return None;
            }
            let item_id =
                item_id.unwrap_or_else(|| format!("user-{}", Utc::now().timestamp_millis()));
            Some(ServerMessage::TranscriptFinal {
                role: Role::User,
                text: transcript,
                item_id: Some(item_id),
            })
        }
        UpstreamEvent::ResponseDone { response } => Some(ServerMessage::UsageUpdate(
            usage_report(response.usage.unwrap_or_default()),
        )),
        UpstreamEvent::Error { error } => Some(ServerMessage::Error {
            message: error
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| UPSTREAM_ERROR_FALLBACK.to_string()),
        }),
        UpstreamEvent::SessionCreated
        | UpstreamEvent::SessionUpdated
        | UpstreamEvent::SpeechStarted
        | UpstreamEvent::SpeechStopped
        | UpstreamEvent::AudioBufferCommitted
        | UpstreamEvent::ItemCreated
        | UpstreamEvent::ContentPartAdded
        | UpstreamEvent::ContentPartDone
        | UpstreamEvent::RateLimitsUpdated => {
            debug!(event = ?event, "Dropping upstream acknowledgement.");
            None
        }
        UpstreamEvent::Unrecognized => None,
    }
}

/// Flattens upstream usage statistics, zero-filling anything missing.
///
/// Audio token counts are reported as the audio duration estimates.
pub fn usage_report(usage: UsageStats) -> UsageReport {
    let audio_tokens = |details: Option<crate::realtime::TokenDetails>| {
        details.and_then(|d| d.audio_tokens).unwrap_or(0)
    };
    UsageReport {
        input_tokens: usage.input_tokens.unwrap_or(0),
        output_tokens: usage.output_tokens.unwrap_or(0),
        audio_input_ms: audio_tokens(usage.input_token_details),
        audio_output_ms: audio_tokens(usage.output_token_details),
    }
}
