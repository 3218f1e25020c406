//! Connection lifecycle - per-peer state machine and tunnel management
//!
//! Each peer walks Idle -> Dialing -> Authenticating -> Established, with
//! Rekeying looping back to Established, Failed terminal on auth errors,
//! and Closing -> Idle on any disconnect. The manager observes
//! transitions: Established installs the tunnel into the router, Closing
//! removes it. Transport selection tries the direct stream first, then
//! UDP with hole-punch hints, then the relay.

use super::dns::ResolverCache;
use super::relay::PersistentRelay;
use super::router::TunnelRouter;
use super::transport::{
    dial_udp, AuthorizedKeys, DirectStream, StreamIdentity, TransportError, Tunnel,
};
use crate::coord::client::Client;
use crate::proto::{PeerInfo, PeerStats};
use crate::shutdown::ShutdownWatch;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Directory heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-transport dial deadline during fallback.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP probe deadline.
const UDP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection states for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Dialing,
    Authenticating,
    Established,
    Rekeying,
    /// Terminal: unrecoverable (authentication) failure. No retry.
    Failed,
    Closing,
}

impl ConnState {
    /// The legal transition edges.
    fn can_transition(self, to: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, to),
            (Idle, Dialing)
                | (Dialing, Authenticating)
                | (Dialing, Failed)
                | (Authenticating, Established)
                | (Authenticating, Dialing)
                | (Authenticating, Failed)
                | (Established, Rekeying)
                | (Rekeying, Established)
                | (Rekeying, Failed)
                | (Closing, Idle)
                | (_, Closing)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Idle => "idle",
            ConnState::Dialing => "dialing",
            ConnState::Authenticating => "authenticating",
            ConnState::Established => "established",
            ConnState::Rekeying => "rekeying",
            ConnState::Failed => "failed",
            ConnState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Lifecycle error types.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: ConnState, to: ConnState },
    #[error("authentication failed for {0}")]
    AuthFailed(String),
    #[error("no transport available for {0}")]
    NoTransportAvailable(String),
    #[error("peer {0} has no usable mesh address")]
    NoAddress(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// One peer's connection state.
pub struct PeerConnection {
    peer_name: String,
    state: RwLock<ConnState>,
    tunnel: RwLock<Option<Arc<Tunnel>>>,
    reconnect_pending: AtomicBool,
}

impl PeerConnection {
    fn new(peer_name: &str) -> Arc<Self> {
        Arc::new(PeerConnection {
            peer_name: peer_name.to_string(),
            state: RwLock::new(ConnState::Idle),
            tunnel: RwLock::new(None),
            reconnect_pending: AtomicBool::new(false),
        })
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn tunnel(&self) -> Option<Arc<Tunnel>> {
        self.tunnel.read().clone()
    }

    /// Apply a transition, enforcing the legal edge set.
    pub fn transition(&self, to: ConnState) -> Result<(), LifecycleError> {
        let mut state = self.state.write();
        if !state.can_transition(to) {
            return Err(LifecycleError::InvalidTransition { from: *state, to });
        }
        debug!(peer = %self.peer_name, from = %*state, to = %to, "connection transition");
        *state = to;
        Ok(())
    }
}

/// Hooks on the lifecycle's route-affecting transitions.
pub trait LifecycleObserver: Send + Sync {
    /// A tunnel reached Established.
    fn tunnel_established(&self, peer: &str, mesh_ip: Ipv4Addr, tunnel: &Arc<Tunnel>);
    /// A tunnel left Established (Closing entered).
    fn tunnel_closed(&self, peer: &str, reason: &str);
}

impl LifecycleObserver for TunnelRouter {
    fn tunnel_established(&self, peer: &str, mesh_ip: Ipv4Addr, tunnel: &Arc<Tunnel>) {
        self.add_route(mesh_ip, peer);
        self.install_tunnel(peer, Arc::clone(tunnel));
    }

    fn tunnel_closed(&self, peer: &str, _reason: &str) {
        if let Some(tunnel) = self.remove_peer(peer) {
            tunnel.close();
        }
    }
}

/// Everything a dial attempt needs besides the target's directory record.
pub struct DialContext {
    pub local: StreamIdentity,
    pub keys: Arc<AuthorizedKeys>,
    pub relay: Option<Arc<PersistentRelay>>,
    /// Pre-shared secret for UDP session key derivation.
    pub udp_secret: Vec<u8>,
}

/// Drives per-peer connections and keeps the router consistent with
/// them. Reconnect requests surface on the discovery channel; the daemon
/// drains it and re-dials.
pub struct LifecycleManager {
    connections: RwLock<HashMap<String, Arc<PeerConnection>>>,
    observer: Arc<dyn LifecycleObserver>,
    discovery_tx: mpsc::Sender<String>,
}

impl LifecycleManager {
    pub fn new(observer: Arc<dyn LifecycleObserver>) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (discovery_tx, discovery_rx) = mpsc::channel(64);
        (
            Arc::new(LifecycleManager {
                connections: RwLock::new(HashMap::new()),
                observer,
                discovery_tx,
            }),
            discovery_rx,
        )
    }

    /// Get or create the connection record for a peer.
    pub fn connection(&self, peer_name: &str) -> Arc<PeerConnection> {
        if let Some(conn) = self.connections.read().get(peer_name) {
            return Arc::clone(conn);
        }
        let mut connections = self.connections.write();
        Arc::clone(
            connections
                .entry(peer_name.to_string())
                .or_insert_with(|| PeerConnection::new(peer_name)),
        )
    }

    /// Establish a tunnel to a peer, trying transports in priority
    /// order: direct stream, UDP, relay. Authentication failures are
    /// terminal; everything else falls through to the next transport.
    pub async fn connect_peer(
        self: &Arc<Self>,
        peer: &PeerInfo,
        ctx: &DialContext,
    ) -> Result<Arc<Tunnel>, LifecycleError> {
        let mesh_ip: Ipv4Addr = peer
            .mesh_ip
            .parse()
            .map_err(|_| LifecycleError::NoAddress(peer.name.clone()))?;

        let conn = self.connection(&peer.name);
        conn.transition(ConnState::Dialing)?;

        // 1. Direct stream to the first public address.
        if peer.ssh_port > 0 {
            if let Some(addr) = first_addr(&peer.public_ips, peer.ssh_port) {
                conn.transition(ConnState::Authenticating)?;
                match tokio::time::timeout(
                    DIAL_TIMEOUT,
                    DirectStream::connect(addr, &ctx.local, &peer.name, &ctx.keys),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        return self.finish_established(&conn, mesh_ip, Tunnel::Ssh(stream));
                    }
                    Ok(Err(TransportError::NotAuthorized(who))) => {
                        conn.transition(ConnState::Failed)?;
                        return Err(LifecycleError::AuthFailed(who));
                    }
                    Ok(Err(err)) => {
                        debug!(peer = %peer.name, error = %err, "direct dial failed");
                        conn.transition(ConnState::Dialing)?;
                    }
                    Err(_) => {
                        debug!(peer = %peer.name, "direct dial timed out");
                        conn.transition(ConnState::Dialing)?;
                    }
                }
            }
        }

        // 2. UDP with hole-punch hints: every known address is a
        // candidate.
        if peer.udp_port > 0 {
            conn.transition(ConnState::Authenticating)?;
            let hints: Vec<SocketAddr> = peer
                .public_ips
                .iter()
                .chain(peer.private_ips.iter())
                .filter_map(|ip| format!("{}:{}", ip, peer.udp_port).parse().ok())
                .collect();

            if !hints.is_empty() {
                match dial_udp(
                    &ctx.local.name,
                    &peer.name,
                    &hints,
                    &ctx.udp_secret,
                    UDP_PROBE_TIMEOUT,
                )
                .await
                {
                    Ok(session) => {
                        let manager = Arc::downgrade(self);
                        session.set_session_invalid_callback(Arc::new(move |peer_name| {
                            // Weak back-reference: the session must not
                            // keep the manager alive.
                            if let Some(manager) = Weak::upgrade(&manager) {
                                manager.handle_session_invalidated(peer_name);
                            }
                        }));
                        return self.finish_established(&conn, mesh_ip, Tunnel::Udp(session));
                    }
                    Err(err) => {
                        debug!(peer = %peer.name, error = %err, "udp dial failed");
                        conn.transition(ConnState::Dialing)?;
                    }
                }
            } else {
                conn.transition(ConnState::Dialing)?;
            }
        }

        // 3. Relay through the coordinator.
        if let Some(relay) = &ctx.relay {
            if relay.is_connected() {
                conn.transition(ConnState::Authenticating)?;
                let tunnel = relay.new_peer_tunnel(&peer.name);
                return self.finish_established(&conn, mesh_ip, Tunnel::Relay(tunnel));
            }
        }

        conn.transition(ConnState::Closing)?;
        conn.transition(ConnState::Idle)?;
        Err(LifecycleError::NoTransportAvailable(peer.name.clone()))
    }

    fn finish_established(
        &self,
        conn: &Arc<PeerConnection>,
        mesh_ip: Ipv4Addr,
        tunnel: Tunnel,
    ) -> Result<Arc<Tunnel>, LifecycleError> {
        let tunnel = Arc::new(tunnel);
        conn.transition(ConnState::Established)?;
        *conn.tunnel.write() = Some(Arc::clone(&tunnel));
        conn.reconnect_pending.store(false, Ordering::SeqCst);

        info!(
            peer = %conn.peer_name,
            mesh_ip = %mesh_ip,
            transport = %tunnel.kind(),
            "tunnel established"
        );
        self.observer
            .tunnel_established(&conn.peer_name, mesh_ip, &tunnel);
        Ok(tunnel)
    }

    /// Tear a peer's tunnel down: Closing, observer cleanup, Idle.
    pub fn disconnect(&self, peer_name: &str, reason: &str) {
        let Some(conn) = self.connections.read().get(peer_name).cloned() else {
            return;
        };

        if conn.transition(ConnState::Closing).is_err() {
            // Already closing or idle.
            return;
        }
        info!(peer = %peer_name, reason = %reason, "disconnecting tunnel");

        if let Some(tunnel) = conn.tunnel.write().take() {
            tunnel.close();
        }
        self.observer.tunnel_closed(peer_name, reason);
        let _ = conn.transition(ConnState::Idle);
    }

    /// Mark a peer's connection unrecoverable.
    pub fn fail(&self, peer_name: &str, reason: &str) {
        let conn = self.connection(peer_name);
        warn!(peer = %peer_name, reason = %reason, "connection failed");
        let _ = conn.transition(ConnState::Failed);
        if let Some(tunnel) = conn.tunnel.write().take() {
            tunnel.close();
        }
        self.observer.tunnel_closed(peer_name, reason);
    }

    /// The remote declared our UDP session stale. Tear down, then ask
    /// the discovery loop to re-dial. Multiple invalidations for the
    /// same peer collapse into a single reconnect.
    pub fn handle_session_invalidated(&self, peer_name: &str) {
        let conn = self.connection(peer_name);
        if conn.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!(peer = %peer_name, "reconnect already pending");
            return;
        }

        info!(peer = %peer_name, "session invalidated by peer, reconnecting");
        self.disconnect(peer_name, "session invalidated by peer");
        self.trigger_discovery(peer_name);
    }

    /// Queue a peer for re-dial by the discovery loop.
    pub fn trigger_discovery(&self, peer_name: &str) {
        if self.discovery_tx.try_send(peer_name.to_string()).is_err() {
            warn!(peer = %peer_name, "discovery queue full");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

/// The 30 second heartbeat ticker: report liveness and traffic counters
/// to the directory, then refresh the local DNS view. Failures are
/// logged and the loop continues.
pub fn spawn_heartbeat_loop(
    client: Arc<Client>,
    peer_name: String,
    public_key: String,
    stats: Arc<dyn Fn() -> PeerStats + Send + Sync>,
    resolver: Arc<ResolverCache>,
    mut shutdown: ShutdownWatch,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    if let Err(err) = client
                        .heartbeat(&peer_name, &public_key, Some(stats()))
                        .await
                    {
                        warn!(error = %err, "heartbeat failed");
                        continue;
                    }
                    match client.dns_records().await {
                        Ok(records) => resolver.sync(&records),
                        Err(err) => debug!(error = %err, "dns sync failed"),
                    }
                }
            }
        }
        debug!("heartbeat loop stopped");
    })
}

fn first_addr(ips: &[String], port: u16) -> Option<SocketAddr> {
    let ip = ips.first()?;
    format!("{}:{}", ip, port).parse().ok()
}

// ============================================================================
// TESTS
// ============================================================================
