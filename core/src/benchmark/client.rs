//! Benchmark client - drives speed tests against a remote peer
//!
//! The upload path interleaves latency probes into the data stream: one
//! before the transfer, one every ten chunks, one after. When chaos is
//! configured, data frames are buffered whole and pushed through the chaos
//! writer so one dropped write means one lost frame; probes bypass the
//! chaos path so they measure the network, not the injected degradation.

use super::chaos::ChaosWriter;
use super::protocol::{read_message, write_message, Message, ProtocolError};
use super::{
    BenchmarkResult, Config, Direction, CHUNK_SIZE, LATENCY_PING_TIMEOUT, READ_TIMEOUT,
};
use crate::shutdown::ShutdownWatch;
use rand::RngCore;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Benchmark client error types.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] super::ConfigError),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("server rejected benchmark: {0}")]
    Rejected(String),
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: String,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("read timed out")]
    Timeout,
    #[error("benchmark cancelled")]
    Cancelled,
}

/// Runs benchmarks against one remote peer.
pub struct BenchClient {
    local_peer: String,
    remote_addr: String,
}

impl BenchClient {
    /// `remote_addr` is the host or mesh IP of the target peer; the port
    /// comes from the config.
    pub fn new(local_peer: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        BenchClient {
            local_peer: local_peer.into(),
            remote_addr: remote_addr.into(),
        }
    }

    /// Execute one benchmark. Failures during the transfer produce a
    /// result with `success == false` rather than an error; errors are
    /// reserved for setup problems (bad config, unreachable server,
    /// rejected start).
    pub async fn run(
        &self,
        cfg: Config,
        mut cancel: ShutdownWatch,
    ) -> Result<BenchmarkResult, ClientError> {
        let cfg = cfg.with_defaults();
        cfg.validate()?;

        let mut result = BenchmarkResult {
            id: Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            local_peer: self.local_peer.clone(),
            remote_peer: cfg.peer_name.clone(),
            direction: cfg.direction,
            requested_size_bytes: cfg.size,
            transferred_size_bytes: 0,
            duration_ms: 0,
            throughput_bps: 0.0,
            throughput_mbps: 0.0,
            latency_min_ms: 0.0,
            latency_max_ms: 0.0,
            latency_avg_ms: 0.0,
            success: false,
            error: String::new(),
            chaos: cfg.chaos.is_enabled().then_some(cfg.chaos),
        };

        let addr = format!("{}:{}", self.remote_addr, cfg.port);
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(addr.clone()))?
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        debug!(addr = %addr, "connected to benchmark server");

        let (mut reader, mut writer) = stream.into_split();

        write_message(
            &mut writer,
            &Message::Start {
                size: cfg.size,
                direction: cfg.direction,
            },
        )
        .await?;

        match read_with_deadline(&mut reader, READ_TIMEOUT).await? {
            Message::Ack { accepted: true, .. } => {}
            Message::Ack { error, .. } => return Err(ClientError::Rejected(error)),
            Message::Error { message } => return Err(ClientError::Rejected(message)),
            other => {
                return Err(ClientError::UnexpectedMessage {
                    expected: "Ack",
                    got: other.message_type().to_string(),
                })
            }
        }

        let run = match cfg.direction {
            Direction::Upload => {
                self.run_upload(&mut reader, writer, &cfg, &mut result, &mut cancel)
                    .await
            }
            Direction::Download => {
                self.run_download(&mut reader, &mut writer, &mut result, &mut cancel)
                    .await
            }
        };

        match run {
            Ok(()) => {
                result.success = true;
                result.calculate_throughput();
            }
            Err(err) => {
                result.success = false;
                result.error = err.to_string();
            }
        }

        Ok(result)
    }

    async fn run_upload<R>(
        &self,
        reader: &mut R,
        writer: tokio::net::tcp::OwnedWriteHalf,
        cfg: &Config,
        result: &mut BenchmarkResult,
        cancel: &mut ShutdownWatch,
    ) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let start = Instant::now();
        let mut sent: i64 = 0;
        let mut seq: u32 = 0;
        let mut latencies: Vec<f64> = Vec::new();

        let mut chunk = vec![0u8; CHUNK_SIZE];
        rand::thread_rng().fill_bytes(&mut chunk);

        // The chaos writer is a passthrough when no chaos is configured.
        let mut writer = ChaosWriter::new(writer, cfg.chaos);

        // Baseline probe before any data moves.
        if let Some(latency) = measure_latency(reader, writer.get_mut(), 0).await {
            latencies.push(latency);
        }

        while sent < cfg.size {
            if cancel.is_triggered() {
                return Err(ClientError::Cancelled);
            }

            let remaining = (cfg.size - sent).min(CHUNK_SIZE as i64) as usize;
            let data = Message::Data {
                seq,
                data: chunk[..remaining].to_vec(),
            };

            // One whole frame per chaos write: the drop unit is a frame.
            let frame = data.encode_frame();
            writer.write(&frame).await.map_err(ProtocolError::Io)?;

            sent += remaining as i64;
            seq += 1;

            if seq % 10 == 0 {
                if let Some(latency) = measure_latency(reader, writer.get_mut(), seq).await {
                    latencies.push(latency);
                }
            }
        }

        // Closing probe.
        if let Some(latency) = measure_latency(reader, writer.get_mut(), seq + 1).await {
            latencies.push(latency);
        }

        let duration = start.elapsed();
        write_message(
            writer.get_mut(),
            &Message::Complete {
                bytes: sent,
                duration_ns: duration.as_nanos() as i64,
            },
        )
        .await?;

        match read_with_deadline(reader, READ_TIMEOUT).await? {
            Message::Complete { .. } => {}
            other => {
                return Err(ClientError::UnexpectedMessage {
                    expected: "Complete",
                    got: other.message_type().to_string(),
                })
            }
        }

        result.transferred_size_bytes = sent;
        result.duration_ms = duration.as_millis() as i64;
        result.set_latency_stats(&latencies);
        Ok(())
    }

    async fn run_download<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        result: &mut BenchmarkResult,
        cancel: &mut ShutdownWatch,
    ) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let mut received: i64 = 0;
        let mut latencies: Vec<f64> = Vec::new();

        // Probe in flight while the server streams; the pong is picked up
        // by the read loop below.
        let ping_sent = Instant::now();
        write_message(
            writer,
            &Message::Ping {
                seq: 0,
                timestamp_ns: unix_nanos(),
            },
        )
        .await?;

        loop {
            if cancel.is_triggered() {
                return Err(ClientError::Cancelled);
            }

            match read_with_deadline(reader, READ_TIMEOUT).await? {
                Message::Data { data, .. } => {
                    received += data.len() as i64;
                }
                Message::Pong { .. } => {
                    latencies.push(ping_sent.elapsed().as_secs_f64() * 1000.0);
                }
                Message::Complete { .. } => {
                    break;
                }
                other => {
                    warn!(message_type = %other.message_type(), "unexpected message during download");
                }
            }
        }

        result.transferred_size_bytes = received;
        result.duration_ms = start.elapsed().as_millis() as i64;
        result.set_latency_stats(&latencies);
        Ok(())
    }
}

/// Round-trip one latency probe. Failures are tolerated: a missed probe
/// loses one sample, not the benchmark.
async fn measure_latency<R, W>(reader: &mut R, writer: &mut W, seq: u32) -> Option<f64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let sent = Instant::now();
    let ping = Message::Ping {
        seq,
        timestamp_ns: unix_nanos(),
    };
    if write_message(writer, &ping).await.is_err() {
        return None;
    }

    match read_with_deadline(reader, LATENCY_PING_TIMEOUT).await {
        Ok(Message::Pong { .. }) => Some(sent.elapsed().as_secs_f64() * 1000.0),
        Ok(_) | Err(_) => None,
    }
}

async fn read_with_deadline<R>(reader: &mut R, deadline: Duration) -> Result<Message, ClientError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, read_message(reader))
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::Protocol)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::server::BenchServer;
    use crate::benchmark::ChaosConfig;

    fn upload_config(size: i64) -> Config {
        Config {
            peer_name: "remote".to_string(),
            size,
            direction: Direction::Upload,
            timeout_secs: 0,
            port: 0,
            chaos: ChaosConfig::default(),
        }
    }

    async fn started_server() -> (std::sync::Arc<BenchServer>, u16) {
        let server = BenchServer::new("127.0.0.1", 0);
        server.start().await.unwrap();
        let port = server.addr().unwrap().port();
        (server, port)
    }

    #[tokio::test]
    async fn test_upload_benchmark_completes() {
        let (server, port) = started_server().await;

        let client = BenchClient::new("local", "127.0.0.1");
        let mut cfg = upload_config(192 * 1024);
        cfg.port = port;

        let result = client.run(cfg, ShutdownWatch::never()).await.unwrap();

        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.transferred_size_bytes, 192 * 1024);
        assert!(result.throughput_bps > 0.0);
        // At least the baseline and closing probes landed.
        assert!(result.latency_min_ms >= 0.0);
        assert!(result.latency_min_ms <= result.latency_avg_ms);
        assert!(result.latency_avg_ms <= result.latency_max_ms);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_download_benchmark_completes() {
        let (server, port) = started_server().await;

        let client = BenchClient::new("local", "127.0.0.1");
        let mut cfg = upload_config(CHUNK_SIZE as i64 * 3);
        cfg.direction = Direction::Download;
        cfg.port = port;

        let result = client.run(cfg, ShutdownWatch::never()).await.unwrap();

        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.transferred_size_bytes, CHUNK_SIZE as i64 * 3);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_chaos_latency_floor() {
        let (server, port) = started_server().await;

        let client = BenchClient::new("local", "127.0.0.1");
        let mut cfg = upload_config(1024);
        cfg.port = port;
        cfg.chaos.latency_ms = 10;

        let started = Instant::now();
        let result = client.run(cfg, ShutdownWatch::never()).await.unwrap();

        assert!(result.success, "error: {}", result.error);
        assert!(started.elapsed() >= Duration::from_millis(10));
        let chaos = result.chaos.expect("chaos config echoed in result");
        assert_eq!(chaos.latency_ms, 10);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_chaos_passthrough_accounts_all_bytes() {
        let (server, port) = started_server().await;

        let client = BenchClient::new("local", "127.0.0.1");
        let mut cfg = upload_config(CHUNK_SIZE as i64 * 4);
        cfg.port = port;
        // Bandwidth pacing only; every frame still arrives.
        cfg.chaos.bandwidth_bps = 10 * 1024 * 1024;

        let result = client.run(cfg, ShutdownWatch::never()).await.unwrap();
        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.transferred_size_bytes, CHUNK_SIZE as i64 * 4);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let client = BenchClient::new("local", "127.0.0.1");
        let mut cfg = upload_config(0);
        cfg.port = 1;

        let result = client.run(cfg, ShutdownWatch::never()).await;
        assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_upload() {
        let (server, port) = started_server().await;

        let (trigger, watch) = crate::shutdown::channel();
        trigger.trigger();

        let client = BenchClient::new("local", "127.0.0.1");
        let mut cfg = upload_config(10 * 1024 * 1024);
        cfg.port = port;

        let result = client.run(cfg, watch).await.unwrap();
        assert!(!result.success);
        assert!(result.error.contains("cancelled"));

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let client = BenchClient::new("local", "127.0.0.1");
        let mut cfg = upload_config(1024);
        cfg.port = 9; // discard port, nothing listening

        let result = client.run(cfg, ShutdownWatch::never()).await;
        assert!(matches!(
            result,
            Err(ClientError::Connect { .. }) | Err(ClientError::ConnectTimeout(_))
        ));
    }
}
