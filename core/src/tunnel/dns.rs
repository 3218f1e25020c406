//! Peer-side resolver cache for .mesh hostnames
//!
//! Synced from the directory's DNS view on each heartbeat tick. Entries
//! expire after the configured TTL so a dead directory eventually stops
//! answering rather than serving stale addresses forever.

use crate::proto::DnsRecord;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default record lifetime, matching the directory sync cadence with
/// slack for a few missed heartbeats.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CachedRecord {
    mesh_ip: Ipv4Addr,
    refreshed_at: Instant,
}

/// Hostname to mesh IP cache with TTL expiry.
pub struct ResolverCache {
    ttl: Duration,
    records: RwLock<HashMap<String, CachedRecord>>,
}

impl ResolverCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(ResolverCache {
            ttl,
            records: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_default_ttl() -> Arc<Self> {
        Self::new(DEFAULT_TTL)
    }

    /// Replace the cache contents with a directory snapshot. Records
    /// that fail to parse are skipped.
    pub fn sync(&self, records: &[DnsRecord]) {
        let now = Instant::now();
        let mut cache = self.records.write();
        cache.clear();
        for record in records {
            match record.mesh_ip.parse::<Ipv4Addr>() {
                Ok(mesh_ip) => {
                    cache.insert(
                        record.hostname.to_ascii_lowercase(),
                        CachedRecord {
                            mesh_ip,
                            refreshed_at: now,
                        },
                    );
                }
                Err(_) => {
                    debug!(hostname = %record.hostname, addr = %record.mesh_ip, "skipping unparseable dns record");
                }
            }
        }
    }

    /// Resolve a hostname, case-insensitively. Expired entries miss.
    pub fn resolve(&self, hostname: &str) -> Option<Ipv4Addr> {
        let records = self.records.read();
        let record = records.get(&hostname.to_ascii_lowercase())?;
        if record.refreshed_at.elapsed() > self.ttl {
            return None;
        }
        Some(record.mesh_ip)
    }

    /// Drop expired entries. Called opportunistically; correctness does
    /// not depend on it since `resolve` checks expiry.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.records
            .write()
            .retain(|_, record| record.refreshed_at.elapsed() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
