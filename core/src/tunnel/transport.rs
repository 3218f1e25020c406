//! Tunnel transports - the per-peer pipes packets travel through
//!
//! Three variants share one capability set: a direct authenticated TCP
//! stream on the peer's SSH port, an encrypted UDP session with rekey
//! support, and a relay view over the coordinator websocket. Represented
//! as a tagged variant rather than a trait object so the lifecycle can
//! match on capabilities (only UDP rekeys).

use super::relay::PeerTunnel;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Upper bound for a single tunneled packet. Generous against the 1400
/// byte virtual-interface MTU.
pub const MAX_PACKET_LEN: usize = 64 * 1024;

/// Datagram flag bytes for the UDP wire format.
const UDP_FLAG_DATA: u8 = 0x00;
const UDP_FLAG_REKEY_REQUIRED: u8 = 0x01;

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tunnel closed")]
    Closed,
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),
    #[error("peer not authorized: {0}")]
    NotAuthorized(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("decryption failed")]
    BadSeal,
    #[error("replayed or stale sequence {0}")]
    Replayed(u64),
    #[error("remote requires rekey")]
    RekeyRequired,
    #[error("timed out")]
    Timeout,
}

/// Which transport a tunnel runs over, in fallback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Ssh,
    Udp,
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ssh => write!(f, "ssh"),
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

/// A live per-peer tunnel.
pub enum Tunnel {
    Ssh(DirectStream),
    Udp(UdpSession),
    Relay(PeerTunnel),
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tunnel({})", self.kind())
    }
}

impl Tunnel {
    pub fn kind(&self) -> TransportKind {
        match self {
            Tunnel::Ssh(_) => TransportKind::Ssh,
            Tunnel::Udp(_) => TransportKind::Udp,
            Tunnel::Relay(_) => TransportKind::Relay,
        }
    }

    /// Send one packet. Byte-stream ordering holds within a tunnel,
    /// never across a transport switch.
    pub async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        match self {
            Tunnel::Ssh(stream) => stream.send(packet).await,
            Tunnel::Udp(session) => session.send(packet).await,
            Tunnel::Relay(tunnel) => {
                tunnel.write(packet)?;
                Ok(())
            }
        }
    }

    /// Receive one packet, decrypted and demultiplexed.
    pub async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        match self {
            Tunnel::Ssh(stream) => stream.recv().await,
            Tunnel::Udp(session) => session.recv().await,
            Tunnel::Relay(tunnel) => {
                let mut buf = vec![0u8; MAX_PACKET_LEN];
                let n = tunnel.read(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    pub fn close(&self) {
        match self {
            Tunnel::Ssh(stream) => stream.close(),
            Tunnel::Udp(session) => session.close(),
            Tunnel::Relay(tunnel) => {
                let _ = tunnel.close();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Tunnel::Ssh(stream) => stream.is_closed(),
            Tunnel::Udp(session) => session.is_closed(),
            Tunnel::Relay(tunnel) => tunnel.is_closed(),
        }
    }

    /// Only the UDP transport refreshes key material in place.
    pub fn supports_rekey(&self) -> bool {
        matches!(self, Tunnel::Udp(_))
    }
}

/// Known peer public-key fingerprints, fed from the directory. Inbound
/// and outbound stream handshakes verify against this set.
#[derive(Default)]
pub struct AuthorizedKeys {
    keys: RwLock<HashMap<String, String>>,
}

impl AuthorizedKeys {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, name: &str, fingerprint: &str) {
        self.keys
            .write()
            .insert(name.to_string(), fingerprint.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.keys.write().remove(name);
    }

    pub fn verify(&self, name: &str, fingerprint: &str) -> bool {
        self.keys
            .read()
            .get(name)
            .is_some_and(|known| known == fingerprint)
    }
}

/// Identity a stream handshake presents: name plus key fingerprint.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub name: String,
    pub fingerprint: String,
}

/// Direct authenticated TCP stream on the peer's SSH port. Both sides
/// exchange an identity hello, verify the fingerprint against the
/// directory-fed authorized set, then carry length-framed packets.
pub struct DirectStream {
    peer_name: String,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl DirectStream {
    /// Dial a peer's stream port and authenticate.
    pub async fn connect(
        addr: SocketAddr,
        local: &StreamIdentity,
        expected_peer: &str,
        keys: &AuthorizedKeys,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        write_hello(&mut write_half, local).await?;
        let remote = read_hello(&mut read_half).await?;

        if remote.name != expected_peer {
            return Err(TransportError::Handshake(format!(
                "expected peer {}, got {}",
                expected_peer, remote.name
            )));
        }
        if !keys.verify(&remote.name, &remote.fingerprint) {
            return Err(TransportError::NotAuthorized(remote.name));
        }

        debug!(peer = %remote.name, addr = %addr, "direct stream established");
        Ok(DirectStream {
            peer_name: remote.name,
            reader: tokio::sync::Mutex::new(read_half),
            writer: tokio::sync::Mutex::new(write_half),
            closed: AtomicBool::new(false),
        })
    }

    /// Authenticate an inbound connection from the stream listener.
    pub async fn accept(
        stream: TcpStream,
        local: &StreamIdentity,
        keys: &AuthorizedKeys,
    ) -> Result<Self, TransportError> {
        let (mut read_half, mut write_half) = stream.into_split();

        let remote = read_hello(&mut read_half).await?;
        if !keys.verify(&remote.name, &remote.fingerprint) {
            return Err(TransportError::NotAuthorized(remote.name));
        }
        write_hello(&mut write_half, local).await?;

        debug!(peer = %remote.name, "inbound direct stream authenticated");
        Ok(DirectStream {
            peer_name: remote.name,
            reader: tokio::sync::Mutex::new(read_half),
            writer: tokio::sync::Mutex::new(write_half),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if packet.len() > MAX_PACKET_LEN {
            return Err(TransportError::PacketTooLarge(packet.len()));
        }

        let mut writer = self.writer.lock().await;
        writer.write_u32(packet.len() as u32).await?;
        writer.write_all(packet).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let len = reader.read_u32().await? as usize;
        if len > MAX_PACKET_LEN {
            return Err(TransportError::PacketTooLarge(len));
        }
        let mut packet = vec![0u8; len];
        reader.read_exact(&mut packet).await?;
        Ok(packet)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn write_hello(
    writer: &mut OwnedWriteHalf,
    identity: &StreamIdentity,
) -> Result<(), TransportError> {
    let name = identity.name.as_bytes();
    let fp = identity.fingerprint.as_bytes();
    writer.write_u16(name.len() as u16).await?;
    writer.write_all(name).await?;
    writer.write_u16(fp.len() as u16).await?;
    writer.write_all(fp).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_hello(reader: &mut OwnedReadHalf) -> Result<StreamIdentity, TransportError> {
    let name_len = reader.read_u16().await? as usize;
    if name_len == 0 || name_len > 255 {
        return Err(TransportError::Handshake("bad name length".to_string()));
    }
    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name).await?;

    let fp_len = reader.read_u16().await? as usize;
    if fp_len == 0 || fp_len > 1024 {
        return Err(TransportError::Handshake("bad fingerprint length".to_string()));
    }
    let mut fp = vec![0u8; fp_len];
    reader.read_exact(&mut fp).await?;

    Ok(StreamIdentity {
        name: String::from_utf8(name)
            .map_err(|_| TransportError::Handshake("name not utf-8".to_string()))?,
        fingerprint: String::from_utf8(fp)
            .map_err(|_| TransportError::Handshake("fingerprint not utf-8".to_string()))?,
    })
}

/// Anti-replay window over a 64-packet horizon behind the highest
/// accepted sequence number.
struct ReplayWindow {
    highest: u64,
    mask: u64,
}

impl ReplayWindow {
    fn new() -> Self {
        ReplayWindow {
            highest: 0,
            mask: 0,
        }
    }

    fn accept(&mut self, seq: u64) -> bool {
        if seq > self.highest {
            let shift = seq - self.highest;
            self.mask = if shift >= 64 { 0 } else { self.mask << shift };
            self.mask |= 1;
            self.highest = seq;
            return true;
        }

        let behind = self.highest - seq;
        if behind >= 64 {
            return false;
        }
        let bit = 1u64 << behind;
        if self.mask & bit != 0 {
            return false;
        }
        self.mask |= bit;
        true
    }

    fn reset(&mut self) {
        self.highest = 0;
        self.mask = 0;
    }
}

/// Session invalidation callback, fired once when the remote signals
/// that our keys are stale.
pub type SessionInvalidCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Encrypted datagram session. Wire format per datagram:
/// `flag:u8 | session_id:u64 BE | seq:u64 BE | ciphertext`, sealed with
/// ChaCha20-Poly1305 under a per-direction key; the nonce is the epoch
/// and sequence number, so a key is never reused with a nonce.
pub struct UdpSession {
    session_id: u64,
    peer_name: String,
    peer_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    send_cipher: RwLock<ChaCha20Poly1305>,
    recv_cipher: RwLock<ChaCha20Poly1305>,
    send_seq: AtomicU64,
    recv_window: Mutex<ReplayWindow>,
    epoch: AtomicU32,
    closed: AtomicBool,
    invalidated: AtomicBool,
    session_invalid: RwLock<Option<SessionInvalidCallback>>,
}

impl UdpSession {
    /// Build a session from a pre-shared secret. `initiator` decides the
    /// key direction split; both ends derive identical material.
    pub fn new(
        socket: Arc<UdpSocket>,
        local_name: &str,
        peer_name: &str,
        peer_addr: SocketAddr,
        secret: &[u8],
        initiator: bool,
    ) -> Self {
        let session_id = session_id_for(local_name, peer_name, secret);
        let (send_key, recv_key) = derive_keys(secret, session_id, 0, initiator);

        UdpSession {
            session_id,
            peer_name: peer_name.to_string(),
            peer_addr,
            socket,
            send_cipher: RwLock::new(ChaCha20Poly1305::new(Key::from_slice(&send_key))),
            recv_cipher: RwLock::new(ChaCha20Poly1305::new(Key::from_slice(&recv_key))),
            send_seq: AtomicU64::new(0),
            recv_window: Mutex::new(ReplayWindow::new()),
            epoch: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            session_invalid: RwLock::new(None),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Install the callback fired when the remote signals rekey-required.
    pub fn set_session_invalid_callback(&self, cb: SessionInvalidCallback) {
        *self.session_invalid.write() = Some(cb);
    }

    pub async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if packet.len() > MAX_PACKET_LEN {
            return Err(TransportError::PacketTooLarge(packet.len()));
        }

        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        let nonce = nonce_for(self.epoch(), seq);
        let ciphertext = self
            .send_cipher
            .read()
            .encrypt(&nonce, packet)
            .map_err(|_| TransportError::BadSeal)?;

        let mut datagram = Vec::with_capacity(17 + ciphertext.len());
        datagram.push(UDP_FLAG_DATA);
        datagram.extend_from_slice(&self.session_id.to_be_bytes());
        datagram.extend_from_slice(&seq.to_be_bytes());
        datagram.extend_from_slice(&ciphertext);

        self.socket.send_to(&datagram, self.peer_addr).await?;
        Ok(())
    }

    /// Receive and open the next datagram. Undecryptable data answers
    /// the sender with rekey-required so it can tear down stale keys.
    pub async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; MAX_PACKET_LEN + 64];
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match self.open(&buf[..len]) {
                Ok(Some(packet)) => return Ok(packet),
                Ok(None) => continue,
                Err(TransportError::RekeyRequired) => {
                    self.mark_invalidated();
                    return Err(TransportError::RekeyRequired);
                }
                Err(TransportError::BadSeal) => {
                    // Stale keys on their side: tell them to rekey.
                    warn!(peer = %self.peer_name, "undecryptable datagram, requesting rekey");
                    let _ = self.send_rekey_required(from).await;
                    continue;
                }
                Err(err) => {
                    debug!(peer = %self.peer_name, error = %err, "dropping datagram");
                    continue;
                }
            }
        }
    }

    /// Open one datagram. `Ok(None)` means silently ignorable (wrong
    /// session, replay).
    fn open(&self, datagram: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if datagram.len() < 17 {
            return Ok(None);
        }
        let flag = datagram[0];
        let session_id = u64::from_be_bytes(datagram[1..9].try_into().expect("8 bytes"));
        if session_id != self.session_id {
            return Ok(None);
        }

        if flag == UDP_FLAG_REKEY_REQUIRED {
            return Err(TransportError::RekeyRequired);
        }
        if flag != UDP_FLAG_DATA {
            return Ok(None);
        }

        let seq = u64::from_be_bytes(datagram[9..17].try_into().expect("8 bytes"));
        let nonce = nonce_for(self.epoch(), seq);
        let packet = self
            .recv_cipher
            .read()
            .decrypt(&nonce, &datagram[17..])
            .map_err(|_| TransportError::BadSeal)?;

        if !self.recv_window.lock().accept(seq) {
            return Err(TransportError::Replayed(seq));
        }
        Ok(Some(packet))
    }

    async fn send_rekey_required(&self, to: SocketAddr) -> Result<(), TransportError> {
        let mut datagram = Vec::with_capacity(17);
        datagram.push(UDP_FLAG_REKEY_REQUIRED);
        datagram.extend_from_slice(&self.session_id.to_be_bytes());
        datagram.extend_from_slice(&0u64.to_be_bytes());
        self.socket.send_to(&datagram, to).await?;
        Ok(())
    }

    /// Rotate key material in place: next epoch, fresh sequence space.
    /// Both ends must rekey from the same secret to keep talking.
    pub fn rekey(&self, secret: &[u8], initiator: bool) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (send_key, recv_key) = derive_keys(secret, self.session_id, epoch, initiator);
        *self.send_cipher.write() = ChaCha20Poly1305::new(Key::from_slice(&send_key));
        *self.recv_cipher.write() = ChaCha20Poly1305::new(Key::from_slice(&recv_key));
        self.send_seq.store(0, Ordering::SeqCst);
        self.recv_window.lock().reset();
        debug!(peer = %self.peer_name, epoch, "session rekeyed");
    }

    /// Fire the invalidation callback exactly once, however many
    /// rekey-required signals arrive.
    pub fn mark_invalidated(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = self.session_invalid.read().as_ref() {
            cb(&self.peer_name);
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Probe an address list until one answers, hole-punch style: send a
/// sealed probe to every hint, take the first address that echoes it
/// back. Returns the established session.
pub async fn dial_udp(
    local_name: &str,
    peer_name: &str,
    addr_hints: &[SocketAddr],
    secret: &[u8],
    timeout: Duration,
) -> Result<UdpSession, TransportError> {
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

    for &addr in addr_hints {
        let session = UdpSession::new(
            Arc::clone(&socket),
            local_name,
            peer_name,
            addr,
            secret,
            true,
        );
        if let Err(err) = session.send(b"probe").await {
            debug!(addr = %addr, error = %err, "probe send failed");
            continue;
        }

        match tokio::time::timeout(timeout, session.recv()).await {
            Ok(Ok(echo)) if echo == b"probe-ack" => {
                debug!(peer = %peer_name, addr = %addr, "udp session established");
                return Ok(session);
            }
            Ok(Ok(_)) | Ok(Err(_)) => continue,
            Err(_) => {
                debug!(addr = %addr, "probe timed out");
                continue;
            }
        }
    }

    Err(TransportError::Timeout)
}

/// Responder half of the probe exchange: receive the initiator's probe
/// on a bound socket and acknowledge it.
pub async fn accept_udp(
    socket: Arc<UdpSocket>,
    local_name: &str,
    peer_name: &str,
    secret: &[u8],
    timeout: Duration,
) -> Result<UdpSession, TransportError> {
    let mut buf = vec![0u8; MAX_PACKET_LEN + 64];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(TransportError::Timeout);
        }
        let (len, from) = tokio::time::timeout(deadline - now, socket.recv_from(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let session = UdpSession::new(
            Arc::clone(&socket),
            local_name,
            peer_name,
            from,
            secret,
            false,
        );
        match session.open(&buf[..len]) {
            Ok(Some(packet)) if packet == b"probe" => {
                session.send(b"probe-ack").await?;
                debug!(peer = %peer_name, addr = %from, "inbound udp session established");
                return Ok(session);
            }
            _ => continue,
        }
    }
}

/// Session IDs are stable for a peer pair and secret, direction-free:
/// both ends hash the name pair in sorted order and land on the same
/// value.
fn session_id_for(local_name: &str, peer_name: &str, secret: &[u8]) -> u64 {
    let (first, second) = if local_name <= peer_name {
        (local_name, peer_name)
    } else {
        (peer_name, local_name)
    };
    let mut hasher = Sha256::new();
    hasher.update(b"tunnelmesh-udp-session");
    hasher.update(first.as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_bytes());
    hasher.update(secret);
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"))
}

/// Per-direction keys for an epoch. The initiator's send key is the
/// responder's receive key and vice versa.
fn derive_keys(secret: &[u8], session_id: u64, epoch: u32, initiator: bool) -> ([u8; 32], [u8; 32]) {
    let derive = |label: &[u8]| -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(session_id.to_be_bytes());
        hasher.update(epoch.to_be_bytes());
        hasher.update(label);
        hasher.finalize().into()
    };

    let i2r = derive(b"initiator-to-responder");
    let r2i = derive(b"responder-to-initiator");
    if initiator {
        (i2r, r2i)
    } else {
        (r2i, i2r)
    }
}

fn nonce_for(epoch: u32, seq: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&epoch.to_be_bytes());
    bytes[4..].copy_from_slice(&seq.to_be_bytes());
    Nonce::from(bytes)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn identity(name: &str) -> StreamIdentity {
        StreamIdentity {
            name: name.to_string(),
            fingerprint: format!("SHA256:{}", name),
        }
    }

    async fn direct_stream_pair() -> (DirectStream, DirectStream) {
        let keys = AuthorizedKeys::new();
        keys.insert("alice", "SHA256:alice");
        keys.insert("bob", "SHA256:bob");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_keys = Arc::clone(&keys);
        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            DirectStream::accept(stream, &identity("bob"), &server_keys)
                .await
                .unwrap()
        });

        let client = DirectStream::connect(addr, &identity("alice"), "bob", &keys)
            .await
            .unwrap();
        let server = accept_task.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_direct_stream_roundtrip() {
        let (client, server) = direct_stream_pair().await;
        assert_eq!(client.peer_name(), "bob");
        assert_eq!(server.peer_name(), "alice");

        client.send(b"ping packet").await.unwrap();
        let got = server.recv().await.unwrap();
        assert_eq!(got, b"ping packet");

        server.send(b"pong packet").await.unwrap();
        let got = client.recv().await.unwrap();
        assert_eq!(got, b"pong packet");
    }

    #[tokio::test]
    async fn test_direct_stream_rejects_unknown_key() {
        let keys = AuthorizedKeys::new();
        keys.insert("bob", "SHA256:bob");
        // alice is not in bob's authorized set.

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_keys = Arc::clone(&keys);
        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            DirectStream::accept(stream, &identity("bob"), &server_keys).await
        });

        let _ = DirectStream::connect(addr, &identity("alice"), "bob", &keys).await;
        let result = accept_task.await.unwrap();
        assert!(matches!(result, Err(TransportError::NotAuthorized(_))));
    }

    #[tokio::test]
    async fn test_direct_stream_closed_errors() {
        let (client, _server) = direct_stream_pair().await;
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.send(b"late").await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(1));
        assert!(window.accept(2));
        assert!(!window.accept(2), "replay rejected");
        assert!(window.accept(5));
        assert!(window.accept(3), "in-window out-of-order accepted");
        assert!(!window.accept(3), "replay of out-of-order rejected");

        assert!(window.accept(100));
        assert!(!window.accept(30), "behind the 64-packet horizon");
    }

    #[test]
    fn test_key_derivation_mirrors() {
        let (i_send, i_recv) = derive_keys(b"secret", 7, 0, true);
        let (r_send, r_recv) = derive_keys(b"secret", 7, 0, false);
        assert_eq!(i_send, r_recv);
        assert_eq!(i_recv, r_send);
        assert_ne!(i_send, i_recv);

        // A new epoch changes everything.
        let (e1_send, _) = derive_keys(b"secret", 7, 1, true);
        assert_ne!(i_send, e1_send);
    }

    async fn udp_session_pair() -> (UdpSession, UdpSession) {
        let sock_a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sock_b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr_a = sock_a.local_addr().unwrap();
        let addr_b = sock_b.local_addr().unwrap();

        let a = UdpSession::new(sock_a, "alice", "bob", addr_b, b"shared", true);
        let b = UdpSession::new(sock_b, "bob", "alice", addr_a, b"shared", false);
        (a, b)
    }

    #[tokio::test]
    async fn test_udp_session_roundtrip() {
        let (a, b) = udp_session_pair().await;
        assert_eq!(a.session_id(), b.session_id());

        a.send(b"datagram one").await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got, b"datagram one");

        b.send(b"datagram two").await.unwrap();
        let got = a.recv().await.unwrap();
        assert_eq!(got, b"datagram two");
    }

    #[tokio::test]
    async fn test_udp_rekey_both_ends() {
        let (a, b) = udp_session_pair().await;

        a.rekey(b"shared", true);
        b.rekey(b"shared", false);
        assert_eq!(a.epoch(), 1);

        a.send(b"fresh keys").await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got, b"fresh keys");
    }

    #[tokio::test]
    async fn test_udp_stale_keys_trigger_invalidation() {
        let (a, b) = udp_session_pair().await;

        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        a.set_session_invalid_callback(Arc::new(move |_peer| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // Only one side rekeys; its traffic is gibberish to the other,
        // which answers with rekey-required.
        a.rekey(b"shared", true);
        a.send(b"unreadable").await.unwrap();

        let recv_b = tokio::time::timeout(Duration::from_secs(2), b.recv()).await;
        // b cannot decrypt and keeps waiting; it answered with a
        // rekey-required signal instead of yielding a packet.
        assert!(recv_b.is_err() || recv_b.unwrap().is_err());

        let err = tokio::time::timeout(Duration::from_secs(2), a.recv())
            .await
            .expect("rekey signal delivery")
            .unwrap_err();
        assert!(matches!(err, TransportError::RekeyRequired));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Further invalidations collapse into the first.
        a.mark_invalidated();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_udp_dial_and_accept() {
        let responder_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let responder_addr = responder_socket.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            accept_udp(
                responder_socket,
                "bob",
                "alice",
                b"shared",
                Duration::from_secs(5),
            )
            .await
        });

        let session = dial_udp(
            "alice",
            "bob",
            &[responder_addr],
            b"shared",
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let responder = accept_task.await.unwrap().unwrap();

        session.send(b"after handshake").await.unwrap();
        let got = responder.recv().await.unwrap();
        assert_eq!(got, b"after handshake");
    }

    #[tokio::test]
    async fn test_udp_dial_no_answer_times_out() {
        // A bound socket that never responds.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let result = dial_udp("alice", "bob", &[addr], b"shared", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_tunnel_kind_and_rekey_capability() {
        let (a, _b) = udp_session_pair().await;
        let udp = Tunnel::Udp(a);
        assert_eq!(udp.kind(), TransportKind::Udp);
        assert!(udp.supports_rekey());

        let (client, _server) = direct_stream_pair().await;
        let ssh = Tunnel::Ssh(client);
        assert_eq!(ssh.kind(), TransportKind::Ssh);
        assert!(!ssh.supports_rekey());
    }
}
