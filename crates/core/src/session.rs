//! Per-session relay state.
//!
//! A `Session` is created when a client connects and lives until that
//! connection closes. Its lifecycle is tracked by [`SessionState`], an explicit
//! state machine rather than a set of nullable handles.

use crate::protocol::UsageReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a session, unique for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-chosen settings for one call, sent with `session.start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Upstream voice id. Falls back to a fixed voice when unset or empty.
    #[serde(default)]
    pub voice: Option<String>,
    /// System instructions. Falls back to a generic prompt when unset or empty.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Whether the assistant should greet the caller before they speak.
    #[serde(default)]
    pub agent_speaks_first: bool,
}

/// Lifecycle of a session.
///
/// ```text
/// Created -> Configuring -> Connecting -> Ready -> Active -> Ended
///                               |                    |
///                               +------> Failed <----+
/// ```
///
/// `Ended` and `Failed` close the current call. A later `session.start` on the
/// same connection re-enters `Configuring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Configuring,
    Connecting,
    Ready,
    Active,
    Ended,
    Failed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid session transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// True once the current call is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }

    /// True while an upstream connection is attached.
    pub fn has_upstream(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Active)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created | Ended | Failed, Configuring) => true,
            (Configuring, Connecting) => true,
            (Connecting, Ready | Failed) => true,
            (Ready, Active) => true,
            (Active, Failed) => true,
            // Ending is always allowed: client end, upstream close or transport close.
            (_, Ended) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: SessionState) -> Result<SessionState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

/// Running token totals for a session, summed over every `usage.update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub audio_input_ms: u64,
    pub audio_output_ms: u64,
    pub responses: u64,
}

impl UsageTotals {
    pub fn record(&mut self, report: &UsageReport) {
        self.input_tokens += report.input_tokens;
        self.output_tokens += report.output_tokens;
        self.audio_input_ms += report.audio_input_ms;
        self.audio_output_ms += report.audio_output_ms;
        self.responses += 1;
    }
}

/// The mutable state of one session, owned by its coordinator.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    config: Option<SessionConfig>,
    state: SessionState,
    pub usage: UsageTotals,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            config: None,
            state: SessionState::Created,
            usage: UsageTotals::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The configuration of the current call, if one was started.
    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// Attaches the configuration for a new call and moves to `Configuring`.
    ///
    /// Fails, leaving the session untouched, while a call is in progress.
    pub fn configure(&mut self, config: SessionConfig) -> Result<(), TransitionError> {
        self.state = self.state.transition(SessionState::Configuring)?;
        self.config = Some(config);
        Ok(())
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), TransitionError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }
}
