//! Chaos injection - packet loss, latency, jitter, and bandwidth limits
//!
//! A writer adapter that degrades the sender. The order of effects is
//! fixed: the drop decision comes before bandwidth accounting (lost writes
//! consume no tokens), and pacing comes before latency (latency stacks on
//! top of pacing).

use super::ChaosConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Token bucket rate limiter. Fractional tokens, one second of burst.
pub struct TokenBucket {
    rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Create a bucket refilling at `bytes_per_sec`, starting full.
    pub fn new(bytes_per_sec: i64) -> Self {
        TokenBucket {
            rate: bytes_per_sec as f64,
            state: Mutex::new(BucketState {
                tokens: bytes_per_sec as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens. Returns how long the caller must wait before the
    /// tokens are covered; zero means they were immediately available.
    /// The bucket goes into deficit rather than making the caller retry.
    pub fn take(&self, n: usize) -> Duration {
        let mut state = self.state.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.last_update = now;

        state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);

        let needed = n as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            return Duration::ZERO;
        }

        let deficit = needed - state.tokens;
        state.tokens = 0.0;
        Duration::from_secs_f64(deficit / self.rate)
    }
}

/// Counters describing what the chaos writer did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Total write calls.
    pub total_writes: u64,
    /// Writes silently dropped by the loss draw.
    pub dropped_writes: u64,
    /// Bytes handed to the writer.
    pub total_bytes: u64,
    /// Bytes that reached the underlying sink.
    pub actual_bytes: u64,
}

/// Chaos-injecting adapter over an async byte sink.
pub struct ChaosWriter<W> {
    inner: W,
    cfg: ChaosConfig,
    rng: StdRng,
    bucket: Option<TokenBucket>,
    stats: Mutex<ChaosStats>,
}

impl<W> ChaosWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, cfg: ChaosConfig) -> Self {
        Self::with_rng(inner, cfg, StdRng::from_entropy())
    }

    /// Construct with a fixed RNG for reproducible tests.
    pub fn with_rng(inner: W, cfg: ChaosConfig, rng: StdRng) -> Self {
        let bucket = (cfg.bandwidth_bps > 0).then(|| TokenBucket::new(cfg.bandwidth_bps));
        ChaosWriter {
            inner,
            cfg,
            rng,
            bucket,
            stats: Mutex::new(ChaosStats::default()),
        }
    }

    /// Write one buffer through the chaos pipeline. Dropped writes still
    /// report the full length so caller byte accounting is unaffected.
    pub async fn write(&mut self, p: &[u8]) -> std::io::Result<usize> {
        {
            let mut stats = self.stats.lock();
            stats.total_writes += 1;
            stats.total_bytes += p.len() as u64;
        }

        if self.cfg.packet_loss_percent > 0.0 {
            let draw: f64 = self.rng.gen_range(0.0..100.0);
            if draw < self.cfg.packet_loss_percent {
                self.stats.lock().dropped_writes += 1;
                return Ok(p.len());
            }
        }

        if let Some(bucket) = &self.bucket {
            let wait = bucket.take(p.len());
            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
        }

        if self.cfg.latency_ms > 0 || self.cfg.jitter_ms > 0 {
            let mut delay = self.cfg.latency().as_secs_f64();
            if self.cfg.jitter_ms > 0 {
                let jitter = self.cfg.jitter().as_secs_f64();
                delay += self.rng.gen_range(-jitter..=jitter);
            }
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        self.inner.write_all(p).await?;
        self.inner.flush().await?;
        self.stats.lock().actual_bytes += p.len() as u64;

        Ok(p.len())
    }

    pub fn stats(&self) -> ChaosStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = ChaosStats::default();
    }

    /// Unwrap back into the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

// ============================================================================
// TESTS
// ============================================================================
