//! Voice Relay Library Crate
//!
//! Everything the relay service needs: configuration, the session registry,
//! the HTTP/WebSocket router and the per-session relay logic. The `relay`
//! binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;
