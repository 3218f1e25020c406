//! Peer-side tunnel machinery: the relay client, the route table, the
//! transport variants, and the per-peer connection lifecycle.

pub mod dataplane;
pub mod dns;
pub mod frame;
pub mod lifecycle;
pub mod relay;
pub mod router;
pub mod transport;
