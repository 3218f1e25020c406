//! Peer directory - registry, mesh IP allocation, and liveness
//!
//! The directory is in-memory and single-writer: registrations serialize
//! under one write lock, reads take the shared side. There is no
//! persistence; state rebuilds from peer re-registration after a restart.

use crate::proto::{AdminPeerInfo, DnsRecord, PeerInfo, PeerStats, RegisterRequest};
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// A peer is online if it registered or heartbeated within this window.
pub const ONLINE_THRESHOLD: Duration = Duration::from_secs(120);

/// Heartbeat cadence peers are expected to keep; traffic rates in the
/// admin overview are computed per this interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Directory error types.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid peer name {0:?}: must be 1-63 DNS-safe characters")]
    InvalidName(String),
    #[error("peer {0} is already registered with a different public key")]
    KeyConflict(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("public key mismatch for peer {0}")]
    KeyMismatch(String),
    #[error("mesh address pool exhausted")]
    PoolExhausted,
    #[error("mesh CIDR {0} has no usable host range")]
    UnusableCidr(Ipv4Net),
}

#[derive(Debug, Clone)]
struct PeerRecord {
    name: String,
    public_key: String,
    mesh_ip: Ipv4Addr,
    public_ips: Vec<String>,
    private_ips: Vec<String>,
    ssh_port: u16,
    udp_port: u16,
    behind_nat: bool,
    version: String,
    registered_at: u64,
    last_seen: u64,
    heartbeat_count: u64,
    stats: Option<PeerStats>,
    // Previous sample retained so the admin view can show rates.
    prev_stats: Option<PeerStats>,
}

struct Inner {
    peers: HashMap<String, PeerRecord>,
    by_ip: HashMap<Ipv4Addr, String>,
    total_heartbeats: u64,
}

/// The coordinator's registry of live peers.
pub struct Directory {
    mesh_cidr: Ipv4Net,
    domain_suffix: String,
    inner: RwLock<Inner>,
}

impl Directory {
    pub fn new(mesh_cidr: Ipv4Net, domain_suffix: impl Into<String>) -> Result<Self, DirectoryError> {
        // /31 and /32 have no room for hosts once network and broadcast
        // are reserved.
        if mesh_cidr.prefix_len() >= 31 {
            return Err(DirectoryError::UnusableCidr(mesh_cidr));
        }
        Ok(Directory {
            mesh_cidr,
            domain_suffix: domain_suffix.into(),
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                by_ip: HashMap::new(),
                total_heartbeats: 0,
            }),
        })
    }

    pub fn mesh_cidr(&self) -> Ipv4Net {
        self.mesh_cidr
    }

    pub fn domain_suffix(&self) -> &str {
        &self.domain_suffix
    }

    /// Register a peer, or update it if the name is already present.
    /// Re-registration preserves the mesh IP and registration time. A name
    /// bound to a different public key is rejected.
    pub fn register(&self, req: &RegisterRequest) -> Result<Ipv4Addr, DirectoryError> {
        validate_name(&req.name)?;

        let now = unix_now();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.peers.get_mut(&req.name) {
            if existing.public_key != req.public_key {
                return Err(DirectoryError::KeyConflict(req.name.clone()));
            }

            existing.public_ips = req.public_ips.clone();
            existing.private_ips = req.private_ips.clone();
            existing.ssh_port = req.ssh_port;
            existing.udp_port = req.udp_port;
            existing.behind_nat = req.behind_nat;
            existing.version = req.version.clone();
            existing.last_seen = existing.last_seen.max(now);

            debug!(peer = %req.name, mesh_ip = %existing.mesh_ip, "peer re-registered");
            return Ok(existing.mesh_ip);
        }

        let mesh_ip = self.allocate_ip(&inner, &req.name)?;
        inner.by_ip.insert(mesh_ip, req.name.clone());
        inner.peers.insert(
            req.name.clone(),
            PeerRecord {
                name: req.name.clone(),
                public_key: req.public_key.clone(),
                mesh_ip,
                public_ips: req.public_ips.clone(),
                private_ips: req.private_ips.clone(),
                ssh_port: req.ssh_port,
                udp_port: req.udp_port,
                behind_nat: req.behind_nat,
                version: req.version.clone(),
                registered_at: now,
                last_seen: now,
                heartbeat_count: 0,
                stats: None,
                prev_stats: None,
            },
        );

        info!(peer = %req.name, mesh_ip = %mesh_ip, "peer registered");
        Ok(mesh_ip)
    }

    /// Record a heartbeat. The public key must match the registration.
    pub fn heartbeat(
        &self,
        name: &str,
        public_key: &str,
        stats: Option<PeerStats>,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write();
        let record = inner
            .peers
            .get_mut(name)
            .ok_or_else(|| DirectoryError::UnknownPeer(name.to_string()))?;

        if record.public_key != public_key {
            return Err(DirectoryError::KeyMismatch(name.to_string()));
        }

        apply_heartbeat(record, stats);
        inner.total_heartbeats += 1;
        Ok(())
    }

    /// Heartbeat arriving over an authenticated relay session. The session
    /// token already bound the name, so no key check.
    pub fn heartbeat_relay(&self, name: &str, stats: Option<PeerStats>) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write();
        let record = inner
            .peers
            .get_mut(name)
            .ok_or_else(|| DirectoryError::UnknownPeer(name.to_string()))?;

        apply_heartbeat(record, stats);
        inner.total_heartbeats += 1;
        Ok(())
    }

    /// Remove a peer and free its mesh IP for future reassignment.
    /// Returns false if the peer was not registered.
    pub fn deregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.peers.remove(name) {
            Some(record) => {
                inner.by_ip.remove(&record.mesh_ip);
                info!(peer = %name, mesh_ip = %record.mesh_ip, "peer deregistered");
                true
            }
            None => false,
        }
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let now = unix_now();
        let inner = self.inner.read();
        let mut peers: Vec<PeerInfo> = inner
            .peers
            .values()
            .map(|r| peer_info(r, now))
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn get_peer(&self, name: &str) -> Option<PeerInfo> {
        let now = unix_now();
        let inner = self.inner.read();
        inner.peers.get(name).map(|r| peer_info(r, now))
    }

    /// The DNS view: `hostname = name + domain_suffix`.
    pub fn dns_records(&self) -> Vec<DnsRecord> {
        let inner = self.inner.read();
        let mut records: Vec<DnsRecord> = inner
            .peers
            .values()
            .map(|r| DnsRecord {
                hostname: format!("{}{}", r.name, self.domain_suffix),
                mesh_ip: r.mesh_ip.to_string(),
            })
            .collect();
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        records
    }

    /// Per-peer admin detail with traffic rates over the heartbeat
    /// interval, derived from the retained previous sample.
    pub fn admin_peers(&self) -> Vec<AdminPeerInfo> {
        let now = unix_now();
        let interval = HEARTBEAT_INTERVAL.as_secs_f64();
        let inner = self.inner.read();

        let mut peers: Vec<AdminPeerInfo> = inner
            .peers
            .values()
            .map(|r| {
                let mut info = AdminPeerInfo {
                    name: r.name.clone(),
                    mesh_ip: r.mesh_ip.to_string(),
                    public_ips: r.public_ips.clone(),
                    private_ips: r.private_ips.clone(),
                    ssh_port: r.ssh_port,
                    udp_port: r.udp_port,
                    last_seen: r.last_seen,
                    online: is_online(r.last_seen, now),
                    behind_nat: r.behind_nat,
                    registered_at: r.registered_at,
                    heartbeat_count: r.heartbeat_count,
                    stats: r.stats,
                    bytes_sent_rate: 0.0,
                    bytes_received_rate: 0.0,
                    packets_sent_rate: 0.0,
                    packets_received_rate: 0.0,
                    version: r.version.clone(),
                };
                if let (Some(stats), Some(prev)) = (r.stats, r.prev_stats) {
                    info.bytes_sent_rate =
                        stats.bytes_sent.saturating_sub(prev.bytes_sent) as f64 / interval;
                    info.bytes_received_rate =
                        stats.bytes_received.saturating_sub(prev.bytes_received) as f64 / interval;
                    info.packets_sent_rate =
                        stats.packets_sent.saturating_sub(prev.packets_sent) as f64 / interval;
                    info.packets_received_rate = stats
                        .packets_received
                        .saturating_sub(prev.packets_received)
                        as f64
                        / interval;
                }
                info
            })
            .collect();
        peers.sort_by(|a, b| a.mesh_ip.cmp(&b.mesh_ip));
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn online_count(&self) -> usize {
        let now = unix_now();
        self.inner
            .read()
            .peers
            .values()
            .filter(|r| is_online(r.last_seen, now))
            .count()
    }

    pub fn total_heartbeats(&self) -> u64 {
        self.inner.read().total_heartbeats
    }

    /// Deterministic allocation: hash the name into the usable host range
    /// and probe forward until a free slot. The same name always lands on
    /// the same address while its slot is free, so a deregister followed
    /// by a re-register gets the identical IP back.
    fn allocate_ip(&self, inner: &Inner, name: &str) -> Result<Ipv4Addr, DirectoryError> {
        let network = u32::from(self.mesh_cidr.network());
        let broadcast = u32::from(self.mesh_cidr.broadcast());
        let first = network + 1;
        let range = broadcast - network - 1;
        if range == 0 {
            return Err(DirectoryError::PoolExhausted);
        }

        let offset = (name_hash(name) % u64::from(range)) as u32;
        for probe in 0..range {
            let candidate = Ipv4Addr::from(first + (offset + probe) % range);
            if !inner.by_ip.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DirectoryError::PoolExhausted)
    }
}

fn apply_heartbeat(record: &mut PeerRecord, stats: Option<PeerStats>) {
    let now = unix_now();
    record.last_seen = record.last_seen.max(now);
    record.heartbeat_count += 1;
    if let Some(stats) = stats {
        record.prev_stats = record.stats;
        record.stats = Some(stats);
    }
}

fn peer_info(r: &PeerRecord, now: u64) -> PeerInfo {
    PeerInfo {
        name: r.name.clone(),
        mesh_ip: r.mesh_ip.to_string(),
        public_ips: r.public_ips.clone(),
        private_ips: r.private_ips.clone(),
        ssh_port: r.ssh_port,
        udp_port: r.udp_port,
        last_seen: r.last_seen,
        online: is_online(r.last_seen, now),
        public_key: r.public_key.clone(),
        behind_nat: r.behind_nat,
        version: r.version.clone(),
    }
}

fn is_online(last_seen: u64, now: u64) -> bool {
    now.saturating_sub(last_seen) < ONLINE_THRESHOLD.as_secs()
}

/// Stable 64-bit hash of a peer name. SHA-256 truncated, so allocation is
/// reproducible across processes and restarts.
fn name_hash(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"))
}

fn validate_name(name: &str) -> Result<(), DirectoryError> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(DirectoryError::InvalidName(name.to_string()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// TESTS
// ============================================================================
