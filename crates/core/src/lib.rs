//! Transport-free core of the voice relay.
//!
//! This crate knows the two message vocabularies the relay speaks (the browser
//! client protocol and the upstream real-time speech API), the per-session state
//! machine, and the pure translation between both sides. It performs no I/O.

pub mod protocol;
pub mod realtime;
pub mod session;
pub mod translator;
