//! Relay hub - per-peer websocket sessions on the coordinator
//!
//! One live session per peer name, last writer wins: a reconnecting peer
//! supersedes and closes its previous session. Frame routing is by name;
//! frames to peers with no session are dropped silently, since liveness is
//! discovered through heartbeats and direct connectivity rather than
//! relay back-pressure.

use crate::shutdown::{self, ShutdownTrigger, ShutdownWatch};
use crate::tunnel::frame::RelayFrame;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Outbound queue depth per session. Frame routing never blocks the
/// sender's read loop; a full queue drops the frame like an offline peer.
const SESSION_QUEUE_DEPTH: usize = 256;

struct Session {
    generation: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    trigger: ShutdownTrigger,
}

/// A registered session as handed to the websocket glue: the outbound
/// queue to drain into the socket and a shutdown watch that fires if the
/// session is superseded.
pub struct SessionHandle {
    pub peer_name: String,
    pub generation: u64,
    pub outbound: mpsc::Receiver<Vec<u8>>,
    pub superseded: ShutdownWatch,
}

/// Routes relay frames between peer sessions by name.
pub struct RelayHub {
    sessions: RwLock<HashMap<String, Session>>,
    next_generation: AtomicU64,
}

impl RelayHub {
    pub fn new() -> Self {
        RelayHub {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register a session for a peer. An existing session for the same
    /// name is closed first and its tail is lost; the replacement starts
    /// with a fresh ordering domain.
    pub fn register(&self, peer_name: &str) -> SessionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (trigger, superseded) = shutdown::channel();

        let previous = self.sessions.write().insert(
            peer_name.to_string(),
            Session {
                generation,
                outbound: tx,
                trigger,
            },
        );

        if let Some(old) = previous {
            info!(peer = %peer_name, "relay session superseded");
            old.trigger.trigger();
        } else {
            info!(peer = %peer_name, "relay session opened");
        }

        SessionHandle {
            peer_name: peer_name.to_string(),
            generation,
            outbound: rx,
            superseded,
        }
    }

    /// Remove a session, but only if the map still points at this
    /// generation. A superseded session's late close must not evict its
    /// replacement.
    pub fn unregister(&self, peer_name: &str, generation: u64) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(peer_name)
            .is_some_and(|s| s.generation == generation)
        {
            sessions.remove(peer_name);
            debug!(peer = %peer_name, "relay session closed");
        }
    }

    /// Route a packet from `source` to `target`. Returns whether a live
    /// session accepted it; false means it was silently dropped.
    pub fn route(&self, source: &str, target: &str, payload: Vec<u8>) -> bool {
        let frame = RelayFrame::RecvPacket {
            source: source.to_string(),
            payload,
        };
        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        let sessions = self.sessions.read();
        match sessions.get(target) {
            Some(session) => session.outbound.try_send(encoded).is_ok(),
            None => {
                debug!(source = %source, target = %target, "relay target offline, dropping");
                false
            }
        }
    }

    pub fn is_connected(&self, peer_name: &str) -> bool {
        self.sessions.read().contains_key(peer_name)
    }

    /// The generation currently bound to a name, if any. Used by tests
    /// and the session glue to detect replacement.
    pub fn current_generation(&self, peer_name: &str) -> Option<u64> {
        self.sessions.read().get(peer_name).map(|s| s.generation)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Close every session. Server shutdown path.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.write();
        for (name, session) in sessions.drain() {
            debug!(peer = %name, "closing relay session");
            session.trigger.trigger();
        }
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
