//! Wire types for the coordination REST API
//!
//! Shared between the coordinator server and the peer control client.
//! Timestamps travel as Unix seconds.

use serde::{Deserialize, Serialize};

/// Registration request body for `POST /api/v1/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub private_ips: Vec<String>,
    #[serde(default)]
    pub ssh_port: u16,
    #[serde(default)]
    pub udp_port: u16,
    #[serde(default)]
    pub behind_nat: bool,
    #[serde(default)]
    pub version: String,
}

/// Registration response: the assigned address plus a bearer token for the
/// relay websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub mesh_ip: String,
    pub mesh_cidr: String,
    pub domain: String,
    pub token: String,
}

/// Traffic counters reported by a peer. Running totals, not deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

/// Heartbeat request body for `POST /api/v1/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub stats: Option<PeerStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

/// A peer as seen by other peers via `GET /api/v1/peers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub mesh_ip: String,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub private_ips: Vec<String>,
    #[serde(default)]
    pub ssh_port: u16,
    #[serde(default)]
    pub udp_port: u16,
    /// Unix seconds of the peer's last registration or heartbeat.
    pub last_seen: u64,
    pub online: bool,
    pub public_key: String,
    #[serde(default)]
    pub behind_nat: bool,
    #[serde(default)]
    pub version: String,
}

/// Peer list responses come in two historical shapes: a bare array and a
/// `{"peers": [...]}` wrapper. Deserialize either.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerListResponse {
    Wrapped { peers: Vec<PeerInfo> },
    Bare(Vec<PeerInfo>),
}

impl PeerListResponse {
    pub fn into_peers(self) -> Vec<PeerInfo> {
        match self {
            PeerListResponse::Wrapped { peers } => peers,
            PeerListResponse::Bare(peers) => peers,
        }
    }
}

/// One DNS record from `GET /api/v1/dns`: `hostname = name + domain_suffix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub hostname: String,
    pub mesh_ip: String,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Server-wide summary for the admin overview endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminOverview {
    pub server_uptime_secs: u64,
    pub server_version: String,
    pub total_peers: usize,
    pub online_peers: usize,
    pub total_heartbeats: u64,
    pub mesh_cidr: String,
    pub domain_suffix: String,
    pub peers: Vec<AdminPeerInfo>,
}

/// Per-peer detail for the admin overview, including traffic rates derived
/// from the two most recent heartbeat samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminPeerInfo {
    pub name: String,
    pub mesh_ip: String,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub private_ips: Vec<String>,
    pub ssh_port: u16,
    pub udp_port: u16,
    pub last_seen: u64,
    pub online: bool,
    pub behind_nat: bool,
    pub registered_at: u64,
    pub heartbeat_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PeerStats>,
    pub bytes_sent_rate: f64,
    pub bytes_received_rate: f64,
    pub packets_sent_rate: f64,
    pub packets_received_rate: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

// ============================================================================
// TESTS
// ============================================================================
