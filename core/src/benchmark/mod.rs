//! Peer-to-peer speed testing over the mesh
//!
//! Benchmark traffic flows through the real tunnel path so results reflect
//! what file transfers and interactive traffic will actually see. A framed
//! request/response protocol runs over one TCP connection per benchmark,
//! with latency probes interleaved into the data stream and an optional
//! chaos filter degrading the sender.

pub mod chaos;
pub mod client;
pub mod protocol;
pub mod server;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default benchmark server port.
pub const DEFAULT_PORT: u16 = 9998;

/// Default transfer size: 10 MB.
pub const DEFAULT_SIZE: i64 = 10 * 1024 * 1024;

/// Default whole-run timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Data chunk size for both directions.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Per-read deadline during a transfer.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a latency probe round trip.
pub const LATENCY_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Benchmark data flow direction, from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Direction::Upload),
            "download" => Ok(Direction::Download),
            other => Err(ConfigError::InvalidDirection(other.to_string())),
        }
    }
}

/// Benchmark configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("peer_name is required")]
    MissingPeerName,
    #[error("size must be positive, got {0}")]
    InvalidSize(i64),
    #[error("direction must be \"upload\" or \"download\", got {0:?}")]
    InvalidDirection(String),
    #[error("packet_loss_percent must be between 0 and 100, got {0}")]
    InvalidLossPercent(f64),
}

/// Chaos testing parameters for simulating degraded network conditions.
/// All fields zero means chaos is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Percentage of writes to drop (0-100).
    #[serde(default)]
    pub packet_loss_percent: f64,

    /// Fixed latency added to each write, in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,

    /// Random variation on latency (+/- jitter), in milliseconds.
    #[serde(default)]
    pub jitter_ms: u64,

    /// Bandwidth limit in bytes per second (0 = unlimited).
    #[serde(default)]
    pub bandwidth_bps: i64,
}

impl ChaosConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    /// True if any chaos effect is configured.
    pub fn is_enabled(&self) -> bool {
        self.packet_loss_percent > 0.0
            || self.latency_ms > 0
            || self.jitter_ms > 0
            || self.bandwidth_bps > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.packet_loss_percent) {
            return Err(ConfigError::InvalidLossPercent(self.packet_loss_percent));
        }
        if self.bandwidth_bps < 0 {
            return Err(ConfigError::InvalidSize(self.bandwidth_bps));
        }
        Ok(())
    }
}

/// Parameters for one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the target peer.
    pub peer_name: String,

    /// Bytes to transfer.
    pub size: i64,

    pub direction: Direction,

    /// Maximum duration for the whole run, in seconds.
    #[serde(default)]
    pub timeout_secs: u64,

    /// Benchmark server port on the target peer.
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub chaos: ChaosConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_name.is_empty() {
            return Err(ConfigError::MissingPeerName);
        }
        if self.size <= 0 {
            return Err(ConfigError::InvalidSize(self.size));
        }
        self.chaos.validate()
    }

    /// Copy with defaults filled in for unset fields.
    pub fn with_defaults(mut self) -> Self {
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = DEFAULT_TIMEOUT.as_secs();
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Results of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub id: String,
    /// Unix seconds at run start.
    pub timestamp: u64,
    pub local_peer: String,
    pub remote_peer: String,
    pub direction: Direction,

    pub requested_size_bytes: i64,
    pub transferred_size_bytes: i64,
    pub duration_ms: i64,
    pub throughput_bps: f64,
    pub throughput_mbps: f64,

    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
    pub latency_avg_ms: f64,

    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<ChaosConfig>,
}

impl BenchmarkResult {
    /// Derive throughput fields from transferred size and duration.
    pub fn calculate_throughput(&mut self) {
        if self.duration_ms > 0 {
            let secs = self.duration_ms as f64 / 1000.0;
            self.throughput_bps = self.transferred_size_bytes as f64 / secs;
            self.throughput_mbps = self.throughput_bps * 8.0 / 1e6;
        }
    }

    /// Fill latency min/max/avg from raw round-trip samples (milliseconds).
    pub fn set_latency_stats(&mut self, latencies: &[f64]) {
        if latencies.is_empty() {
            return;
        }

        let mut sorted = latencies.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        self.latency_min_ms = sorted[0];
        self.latency_max_ms = sorted[sorted.len() - 1];
        self.latency_avg_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
    }
}

// ============================================================================
// TESTS
// ============================================================================
