// TunnelMesh Core - Overlay Mesh Spine
//
// A set of peer daemons coordinate through a central directory to form a
// full mesh of authenticated, encrypted tunnels carrying IP traffic over a
// virtual subnet. This crate holds everything except the platform device
// layer: the coordination service (directory, tokens, relay hub), the
// peer-side routing and connection lifecycle, and the in-band benchmark
// protocol.

pub mod benchmark;
pub mod bytesize;
pub mod coord;
pub mod proto;
pub mod shutdown;
pub mod tunnel;

pub use coord::client::{Client, RetryConfig};
pub use coord::directory::Directory;
pub use coord::server::CoordServer;
pub use proto::{DnsRecord, PeerInfo, PeerStats};
pub use tunnel::relay::PersistentRelay;
pub use tunnel::router::TunnelRouter;
