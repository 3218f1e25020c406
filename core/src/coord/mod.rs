//! Coordination service: directory, tokens, relay hub, REST surface, and
//! the typed client peers use to talk to it.

pub mod auth;
pub mod client;
pub mod directory;
pub mod relay;
pub mod server;
