//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the process-wide
//! resources every connection needs: configuration, the session registry and
//! the upstream connector.

use crate::{
    config::Config,
    registry::SessionRegistry,
    ws::upstream::{OpenAiDialer, UpstreamConnector, UpstreamDialer},
};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<UpstreamConnector>,
}

impl AppState {
    /// State wired to the real upstream API.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let dialer = Arc::new(OpenAiDialer::new(config.clone()));
        Self::with_dialer(config, dialer)
    }

    pub fn with_dialer(config: Arc<Config>, dialer: Arc<dyn UpstreamDialer>) -> Self {
        let connector = Arc::new(UpstreamConnector::new(dialer, config.turn_detection));
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            connector,
        }
    }
}
