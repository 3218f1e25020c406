//! Persistent relay client - the peer-side half of the relay fabric
//!
//! One websocket session to the coordinator carries packets for every
//! peer reachable only through the relay. Frames are multiplexed by peer
//! name; `PeerTunnel` exposes a per-peer byte-stream view over the shared
//! session. Reconnecting after a drop is the connection lifecycle's job,
//! not this client's.

use super::frame::{FrameError, RelayFrame};
use crate::proto::PeerStats;
use crate::shutdown::{self, ShutdownTrigger};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};

/// Callback invoked for every packet delivered over the relay.
pub type PacketHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Outbound queue depth toward the websocket writer task.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Per-peer tunnel inbound buffer depth.
const TUNNEL_BUFFER_DEPTH: usize = 64;

/// Relay client error types.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not connected to relay")]
    NotConnected,
    #[error("already connected to relay")]
    AlreadyConnected,
    #[error("invalid relay URL: {0}")]
    BadUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("relay write failed: {0}")]
    WriteError(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// The peer's persistent websocket session to the coordinator's relay hub.
pub struct PersistentRelay {
    server_url: String,
    peer_name: String,
    token: String,
    connected: AtomicBool,
    outbound: RwLock<Option<mpsc::Sender<tungstenite::Message>>>,
    handler: RwLock<Option<PacketHandler>>,
    tunnels: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    session: Mutex<Option<ShutdownTrigger>>,
    reconnect_interval: Duration,
}

impl PersistentRelay {
    /// `server_url` is the coordinator's HTTP base URL; the websocket
    /// path and scheme are derived from it.
    pub fn new(
        server_url: impl Into<String>,
        peer_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(PersistentRelay {
            server_url: server_url.into(),
            peer_name: peer_name.into(),
            token: token.into(),
            connected: AtomicBool::new(false),
            outbound: RwLock::new(None),
            handler: RwLock::new(None),
            tunnels: RwLock::new(HashMap::new()),
            session: Mutex::new(None),
            reconnect_interval: Duration::from_secs(5),
        })
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    fn ws_url(&self) -> Result<String, RelayError> {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(RelayError::BadUrl(self.server_url.clone()));
        };
        Ok(format!("{}/api/v1/relay/persistent", ws_base))
    }

    /// Open the websocket session, attach the bearer token, and spawn the
    /// read and write pumps.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RelayError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyConnected);
        }

        let mut request = self
            .ws_url()?
            .into_client_request()
            .map_err(RelayError::WebSocket)?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.token)
                .parse()
                .map_err(|_| RelayError::BadUrl("token not header-safe".to_string()))?,
        );

        let (stream, _resp) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_tx, mut ws_rx) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<tungstenite::Message>(OUTBOUND_QUEUE_DEPTH);
        let (trigger, mut watch) = shutdown::channel();

        *self.outbound.write() = Some(out_tx);
        *self.session.lock() = Some(trigger);
        self.connected.store(true, Ordering::SeqCst);
        info!(peer = %self.peer_name, "relay session connected");

        // Writer pump: the single serialization point for the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Read pump: demultiplex inbound frames to tunnels and handler.
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch.triggered() => break,
                    msg = ws_rx.next() => {
                        let msg = match msg {
                            Some(Ok(msg)) => msg,
                            Some(Err(err)) => {
                                debug!(error = %err, "relay read error");
                                break;
                            }
                            None => break,
                        };
                        match msg {
                            tungstenite::Message::Binary(data) => relay.dispatch(&data),
                            tungstenite::Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
            }
            relay.connected.store(false, Ordering::SeqCst);
            *relay.outbound.write() = None;
            debug!(peer = %relay.peer_name, "relay read loop ended");
        });

        Ok(())
    }

    fn dispatch(&self, data: &[u8]) {
        match RelayFrame::decode(data) {
            Ok(RelayFrame::RecvPacket { source, payload }) => {
                // Per-peer tunnel buffer first, then the catch-all handler.
                if let Some(tx) = self.tunnels.read().get(&source) {
                    if tx.try_send(payload.clone()).is_err() {
                        debug!(source = %source, "tunnel buffer full, dropping packet");
                    }
                }
                if let Some(handler) = self.handler.read().as_ref() {
                    handler(&source, &payload);
                }
            }
            Ok(RelayFrame::Error { message }) => {
                warn!(message = %message, "relay server error");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "undecodable relay frame");
            }
        }
    }

    /// Send a packet to the named peer through the relay.
    pub fn send_to(&self, target: &str, payload: &[u8]) -> Result<(), RelayError> {
        let frame = RelayFrame::SendPacket {
            target: target.to_string(),
            payload: payload.to_vec(),
        };
        self.send_frame(frame)
    }

    /// Keepalive with traffic counters, delivered in-band.
    pub fn send_heartbeat(&self, stats: PeerStats) -> Result<(), RelayError> {
        self.send_frame(RelayFrame::Heartbeat { stats })
    }

    fn send_frame(&self, frame: RelayFrame) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let encoded = frame.encode()?;

        let outbound = self.outbound.read();
        let tx = outbound.as_ref().ok_or(RelayError::NotConnected)?;
        tx.try_send(tungstenite::Message::Binary(encoded))
            .map_err(|err| RelayError::WriteError(err.to_string()))
    }

    /// Install the packet callback. Replaces any previous handler.
    pub fn set_packet_handler(&self, handler: PacketHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Idempotent close: ends the read loop and drops the writer.
    pub fn close(&self) {
        if let Some(trigger) = self.session.lock().take() {
            trigger.trigger();
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.outbound.write() = None;
        debug!(peer = %self.peer_name, "relay closed");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Exponential reconnect backoff, capped at one minute.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.reconnect_interval.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(5)));
        Duration::from_millis(backoff_ms.min(60_000))
    }

    /// A per-peer byte-stream view over this relay session. Inbound
    /// packets from `target` are buffered for `read`; writes prefix the
    /// target name.
    pub fn new_peer_tunnel(self: &Arc<Self>, target: impl Into<String>) -> PeerTunnel {
        let target = target.into();
        let (tx, rx) = mpsc::channel(TUNNEL_BUFFER_DEPTH);
        self.tunnels.write().insert(target.clone(), tx);
        PeerTunnel {
            relay: Arc::clone(self),
            target,
            inbound: tokio::sync::Mutex::new(rx),
            leftover: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

/// One peer's packet stream over the shared relay session.
pub struct PeerTunnel {
    relay: Arc<PersistentRelay>,
    target: String,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    leftover: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl PeerTunnel {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Read buffered bytes from the target peer. A packet larger than
    /// `buf` carries over into the next read.
    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel closed",
            ));
        }

        {
            let mut leftover = self.leftover.lock();
            if !leftover.is_empty() {
                let n = leftover.len().min(buf.len());
                buf[..n].copy_from_slice(&leftover[..n]);
                leftover.drain(..n);
                return Ok(n);
            }
        }

        let packet = {
            let mut inbound = self.inbound.lock().await;
            inbound.recv().await.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "relay session ended")
            })?
        };

        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        if n < packet.len() {
            self.leftover.lock().extend_from_slice(&packet[n..]);
        }
        Ok(n)
    }

    /// Send one packet to the target peer.
    pub fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        if self.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel closed",
            ));
        }
        self.relay
            .send_to(&self.target, data)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        Ok(data.len())
    }

    pub fn close(&self) -> std::io::Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.relay.tunnels.write().remove(&self.target);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for PeerTunnel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::client::Client;
    use crate::coord::server::{CoordConfig, CoordServer};
    use crate::proto::RegisterRequest;

    async fn spawn_coord() -> String {
        let server = CoordServer::new(CoordConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            auth_token: "test-token".to_string(),
            mesh_cidr: "10.99.0.0/16".parse().unwrap(),
            domain_suffix: ".mesh".to_string(),
            version: "test".to_string(),
        })
        .unwrap();

        let (addr, serving) = warp::serve(server.routes()).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serving);
        format!("http://{}", addr)
    }

    async fn register(url: &str, name: &str) -> String {
        let client = Client::new(url, "test-token");
        let resp = client
            .register(&RegisterRequest {
                name: name.to_string(),
                public_key: format!("SHA256:{}", name),
                public_ips: vec![],
                private_ips: vec![],
                ssh_port: 2222,
                udp_port: 2223,
                behind_nat: false,
                version: "test".to_string(),
            })
            .await
            .unwrap();
        resp.token
    }

    async fn connected_relay(url: &str, name: &str) -> Arc<PersistentRelay> {
        let token = register(url, name).await;
        let relay = PersistentRelay::new(url, name, token);
        relay.connect().await.unwrap();
        relay
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let url = spawn_coord().await;
        let relay = connected_relay(&url, "peer1").await;

        assert!(relay.is_connected());
        relay.close();
        assert!(!relay.is_connected());
        // Idempotent.
        relay.close();
    }

    #[tokio::test]
    async fn test_connect_with_bad_token_fails() {
        let url = spawn_coord().await;
        let relay = PersistentRelay::new(&url, "peer1", "bogus-token");
        let result = relay.connect().await;
        assert!(result.is_err());
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let relay = PersistentRelay::new("http://127.0.0.1:1", "peer1", "t");
        let err = relay.send_to("peer2", b"test").unwrap_err();
        assert!(matches!(err, RelayError::NotConnected));
    }

    #[tokio::test]
    async fn test_packet_delivery_between_peers() {
        let url = spawn_coord().await;
        let relay1 = connected_relay(&url, "peer1").await;
        let relay2 = connected_relay(&url, "peer2").await;

        let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(4);
        relay2.set_packet_handler(Arc::new(move |source, payload| {
            let _ = tx.try_send((source.to_string(), payload.to_vec()));
        }));

        // Both read loops need to be registered hub-side.
        tokio::time::sleep(Duration::from_millis(50)).await;

        relay1.send_to("peer2", b"hello from peer1").unwrap();

        let (source, payload) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("delivery timed out")
                .unwrap();
        assert_eq!(source, "peer1");
        assert_eq!(payload, b"hello from peer1");
    }

    #[tokio::test]
    async fn test_send_to_offline_peer_is_silent() {
        let url = spawn_coord().await;
        let relay1 = connected_relay(&url, "peer1").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        // No error surfaces; the hub drops the frame.
        relay1.send_to("nobody-home", b"into the void").unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_over_relay() {
        let url = spawn_coord().await;
        let relay = connected_relay(&url, "peer1").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        relay
            .send_heartbeat(PeerStats {
                bytes_sent: 42,
                ..Default::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The directory saw the heartbeat: peer stats are now populated.
        let client = Client::new(&url, "test-token");
        let peer = client.get_peer("peer1").await.unwrap();
        assert!(peer.online);
    }

    #[tokio::test]
    async fn test_session_replacement() {
        let url = spawn_coord().await;
        let token = register(&url, "peer1").await;

        let first = PersistentRelay::new(&url, "peer1", token.clone());
        first.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second connection with the same identity supersedes the first.
        let second = PersistentRelay::new(&url, "peer1", token);
        second.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(second.is_connected());

        // Traffic now lands on the new session only.
        let relay2 = connected_relay(&url, "peer2").await;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
        second.set_packet_handler(Arc::new(move |_, payload| {
            let _ = tx.try_send(payload.to_vec());
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        relay2.send_to("peer1", b"to the new session").unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(payload, b"to the new session");
    }

    #[tokio::test]
    async fn test_peer_tunnel_read_write() {
        let url = spawn_coord().await;
        let relay1 = connected_relay(&url, "peer1").await;
        let relay2 = connected_relay(&url, "peer2").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tunnel_1to2 = relay1.new_peer_tunnel("peer2");
        let tunnel_2to1 = relay2.new_peer_tunnel("peer1");

        let data = b"hello via peer tunnel";
        let n = tunnel_1to2.write(data).unwrap();
        assert_eq!(n, data.len());

        let mut buf = [0u8; 100];
        let n = tokio::time::timeout(Duration::from_secs(2), tunnel_2to1.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_eq!(&buf[..n], data);
    }

    #[tokio::test]
    async fn test_peer_tunnel_filters_by_source() {
        let url = spawn_coord().await;
        let relay1 = connected_relay(&url, "peer1").await;
        let relay2 = connected_relay(&url, "peer2").await;
        let relay3 = connected_relay(&url, "peer3").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // peer1 only listens to peer2; a packet from peer3 must not
        // surface on that tunnel.
        let from_peer2 = relay1.new_peer_tunnel("peer2");
        relay3.send_to("peer1", b"wrong source").unwrap();
        relay2.send_to("peer1", b"right source").unwrap();

        let mut buf = [0u8; 100];
        let n = tokio::time::timeout(Duration::from_secs(2), from_peer2.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"right source");
    }

    #[tokio::test]
    async fn test_peer_tunnel_close() {
        let relay = PersistentRelay::new("http://127.0.0.1:1", "peer1", "t");
        let tunnel = relay.new_peer_tunnel("peer2");

        assert!(!tunnel.is_closed());
        tunnel.close().unwrap();
        assert!(tunnel.is_closed());
        assert!(tunnel.write(b"test").is_err());
    }

    #[tokio::test]
    async fn test_peer_tunnel_short_reads_carry_over() {
        let url = spawn_coord().await;
        let relay1 = connected_relay(&url, "peer1").await;
        let relay2 = connected_relay(&url, "peer2").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tunnel = relay2.new_peer_tunnel("peer1");
        relay1.send_to("peer2", b"abcdef").unwrap();

        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), tunnel.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"abcd");

        let n = tunnel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[test]
    fn test_ws_url_derivation() {
        let relay = PersistentRelay::new("http://example.com:8080/", "p", "t");
        assert_eq!(
            relay.ws_url().unwrap(),
            "ws://example.com:8080/api/v1/relay/persistent"
        );

        let relay = PersistentRelay::new("https://mesh.example.com", "p", "t");
        assert_eq!(
            relay.ws_url().unwrap(),
            "wss://mesh.example.com/api/v1/relay/persistent"
        );

        let relay = PersistentRelay::new("ftp://nope", "p", "t");
        assert!(relay.ws_url().is_err());
    }

    #[test]
    fn test_backoff_caps() {
        let relay = PersistentRelay::new("http://x", "p", "t");
        assert!(relay.backoff_duration(0) < relay.backoff_duration(3));
        assert!(relay.backoff_duration(30) <= Duration::from_secs(60));
    }
}
