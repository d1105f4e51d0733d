//! Axum Handlers for the plain HTTP endpoints.

use crate::state::AppState;
use axum::{Json, extract::State};
use relay_core::session::SessionState;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Number of client connections currently registered.
    pub sessions: usize,
    /// Registered sessions per lifecycle state, e.g. `{"ready": 2}`.
    pub states: BTreeMap<SessionState, usize>,
}

/// Liveness probe.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let states = state.registry.state_counts();
    Json(HealthResponse {
        status: "ok",
        sessions: states.values().sum(),
        states,
    })
}
