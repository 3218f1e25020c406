//! Dataplane - the virtual-interface packet loop
//!
//! Packets read from the device are routed by destination mesh IP into
//! the owning tunnel; each tunnel's receive pump injects inbound packets
//! back into the device. Device creation itself is platform work outside
//! this crate; anything that moves whole IP packets can sit behind
//! `PacketIo`.

use super::router::TunnelRouter;
use super::transport::Tunnel;
use crate::proto::PeerStats;
use crate::shutdown::ShutdownWatch;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The virtual network device seam: whole IP packets in and out.
#[async_trait]
pub trait PacketIo: Send + Sync {
    async fn read_packet(&self) -> std::io::Result<Vec<u8>>;
    async fn write_packet(&self, packet: &[u8]) -> std::io::Result<()>;
}

/// Running traffic counters for heartbeat reporting.
#[derive(Default)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerStats {
        PeerStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }
}

/// Destination address of an IPv4 packet, if the header is sane.
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 {
        return None;
    }
    if packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ))
}

/// Outbound loop: read packets from the device, look up the destination,
/// hand the packet to its tunnel. Unroutable destinations are dropped.
pub async fn run_packet_loop(
    device: Arc<dyn PacketIo>,
    router: Arc<TunnelRouter>,
    counters: Arc<TrafficCounters>,
    mut shutdown: ShutdownWatch,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.triggered() => break,
            result = device.read_packet() => match result {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(error = %err, "device read failed, stopping packet loop");
                    break;
                }
            }
        };

        let Some(dst) = ipv4_destination(&packet) else {
            trace!(len = packet.len(), "dropping non-ipv4 packet");
            continue;
        };

        let Some((peer, tunnel)) = router.lookup(dst) else {
            trace!(dst = %dst, "no route, dropping packet");
            continue;
        };

        match tunnel.send(&packet).await {
            Ok(()) => counters.record_sent(packet.len()),
            Err(err) => {
                debug!(peer = %peer, error = %err, "tunnel send failed");
            }
        }
    }
    debug!("packet loop stopped");
}

/// Inbound pump for one tunnel: receive, count, inject into the device.
/// Ends when the tunnel closes or shutdown fires.
pub async fn run_tunnel_pump(
    peer_name: String,
    tunnel: Arc<Tunnel>,
    device: Arc<dyn PacketIo>,
    counters: Arc<TrafficCounters>,
    mut shutdown: ShutdownWatch,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.triggered() => break,
            result = tunnel.recv() => match result {
                Ok(packet) => packet,
                Err(err) => {
                    debug!(peer = %peer_name, error = %err, "tunnel recv ended");
                    break;
                }
            }
        };

        counters.record_received(packet.len());
        if let Err(err) = device.write_packet(&packet).await {
            warn!(peer = %peer_name, error = %err, "device inject failed");
            break;
        }
    }
    debug!(peer = %peer_name, "tunnel pump stopped");
}

// ============================================================================
// TESTS
// ============================================================================
