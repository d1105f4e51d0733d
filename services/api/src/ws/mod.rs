//! WebSocket relay
//!
//! - `relay`: accepts client connections and owns their registry entries.
//! - `coordinator`: runs one session's lifecycle between client and upstream.
//! - `upstream`: dials and negotiates the upstream real-time speech API.

pub mod coordinator;
pub mod relay;
pub mod upstream;

pub use relay::ws_handler;
