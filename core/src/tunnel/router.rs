//! Tunnel router - destination mesh IP to peer name to live tunnel
//!
//! Routes are installed when a peer authenticates (directly or learned
//! from an inbound connection) and removed on final disconnect. A small
//! LRU of last-known addresses lets inbound auth proceed when the
//! directory is briefly unreachable.

use super::transport::Tunnel;
use crate::coord::client::{Client, ClientError};
use crate::proto::PeerInfo;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Capacity of the last-known-address cache.
const IP_CACHE_CAPACITY: usize = 128;

/// Directory fetch retry ladder for `ensure_peer_route`.
const ENSURE_BACKOFF: [Duration; 5] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Router error types.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no such peer: {0}")]
    UnknownPeer(String),
    #[error("directory unreachable for {name} after {attempts} attempts and no cached address")]
    Unreachable { name: String, attempts: u32 },
    #[error("peer {name} has invalid mesh address {addr:?}")]
    BadAddress { name: String, addr: String },
}

struct Inner {
    by_ip: HashMap<Ipv4Addr, String>,
    tunnels: HashMap<String, Arc<Tunnel>>,
}

/// Bounded LRU of peer name to last known mesh IP. Hand-rolled over a
/// map plus an access-ordered queue; 128 entries is far past any real
/// mesh this serves.
struct IpCache {
    entries: HashMap<String, Ipv4Addr>,
    order: VecDeque<String>,
}

impl IpCache {
    fn new() -> Self {
        IpCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, name: &str, ip: Ipv4Addr) {
        if self.entries.insert(name.to_string(), ip).is_some() {
            self.order.retain(|n| n != name);
        } else if self.entries.len() > IP_CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.order.push_back(name.to_string());
    }

    fn get(&mut self, name: &str) -> Option<Ipv4Addr> {
        let ip = self.entries.get(name).copied()?;
        self.order.retain(|n| n != name);
        self.order.push_back(name.to_string());
        Some(ip)
    }
}

/// Thread-safe mapping from destination mesh IP to the tunnel that
/// carries it.
pub struct TunnelRouter {
    inner: RwLock<Inner>,
    recent: Mutex<IpCache>,
}

impl TunnelRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(TunnelRouter {
            inner: RwLock::new(Inner {
                by_ip: HashMap::new(),
                tunnels: HashMap::new(),
            }),
            recent: Mutex::new(IpCache::new()),
        })
    }

    /// Bind a mesh IP to a peer name. Also refreshes the LRU cache.
    pub fn add_route(&self, mesh_ip: Ipv4Addr, name: &str) {
        self.inner.write().by_ip.insert(mesh_ip, name.to_string());
        self.recent.lock().insert(name, mesh_ip);
        debug!(mesh_ip = %mesh_ip, peer = %name, "route added");
    }

    /// Drop the binding for a mesh IP. The LRU keeps the address for
    /// directory-outage fallback.
    pub fn remove_route(&self, mesh_ip: Ipv4Addr) -> Option<String> {
        let removed = self.inner.write().by_ip.remove(&mesh_ip);
        if let Some(name) = &removed {
            debug!(mesh_ip = %mesh_ip, peer = %name, "route removed");
        }
        removed
    }

    /// Install the live tunnel for a peer, replacing any previous one.
    pub fn install_tunnel(&self, name: &str, tunnel: Arc<Tunnel>) {
        self.inner.write().tunnels.insert(name.to_string(), tunnel);
    }

    /// Remove a peer's tunnel and every route pointing at it.
    pub fn remove_peer(&self, name: &str) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.write();
        inner.by_ip.retain(|_, n| n != name);
        inner.tunnels.remove(name)
    }

    /// Resolve a destination to its peer and tunnel.
    pub fn lookup(&self, mesh_ip: Ipv4Addr) -> Option<(String, Arc<Tunnel>)> {
        let inner = self.inner.read();
        let name = inner.by_ip.get(&mesh_ip)?;
        let tunnel = inner.tunnels.get(name)?;
        Some((name.clone(), Arc::clone(tunnel)))
    }

    pub fn tunnel_for(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.inner.read().tunnels.get(name).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.inner.read().by_ip.len()
    }

    /// Soft-update name/IP bindings from a directory snapshot without
    /// touching tunnels.
    pub fn sync_routes(&self, peers: &[PeerInfo]) {
        for peer in peers {
            if let Ok(ip) = peer.mesh_ip.parse::<Ipv4Addr>() {
                if self.inner.read().tunnels.contains_key(&peer.name) {
                    self.add_route(ip, &peer.name);
                } else {
                    self.recent.lock().insert(&peer.name, ip);
                }
            }
        }
    }

    pub fn cached_ip(&self, name: &str) -> Option<Ipv4Addr> {
        self.recent.lock().get(name)
    }

    /// Make sure a route exists for the named peer, fetching its record
    /// from the directory. Up to five attempts with doubling backoff;
    /// an unknown name is not retried. If every attempt fails, the
    /// last-known-address cache is consulted before giving up.
    pub async fn ensure_peer_route(
        &self,
        name: &str,
        client: &Client,
    ) -> Result<(Ipv4Addr, Option<PeerInfo>), RouterError> {
        for (attempt, backoff) in ENSURE_BACKOFF.iter().enumerate() {
            match client.get_peer(name).await {
                Ok(peer) => {
                    let ip = peer.mesh_ip.parse::<Ipv4Addr>().map_err(|_| {
                        RouterError::BadAddress {
                            name: name.to_string(),
                            addr: peer.mesh_ip.clone(),
                        }
                    })?;
                    self.add_route(ip, name);
                    return Ok((ip, Some(peer)));
                }
                Err(ClientError::Status { status: 404, .. }) => {
                    return Err(RouterError::UnknownPeer(name.to_string()));
                }
                Err(err) => {
                    warn!(
                        peer = %name,
                        attempt = attempt + 1,
                        error = %err,
                        "directory fetch failed"
                    );
                    if attempt + 1 < ENSURE_BACKOFF.len() {
                        tokio::time::sleep(*backoff).await;
                    }
                }
            }
        }

        // Directory is down; fall back to the last address we knew.
        if let Some(ip) = self.cached_ip(name) {
            warn!(peer = %name, mesh_ip = %ip, "directory unreachable, using cached address");
            self.add_route(ip, name);
            return Ok((ip, None));
        }

        Err(RouterError::Unreachable {
            name: name.to_string(),
            attempts: ENSURE_BACKOFF.len() as u32,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
