// tunnelmesh - overlay mesh networking CLI
//
// Three roles behind one binary: the coordination server (`serve`), the
// peer daemon (`up`), and the benchmark runner (`bench`).

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tunnelmesh_core::benchmark::client::BenchClient;
use tunnelmesh_core::benchmark::server::BenchServer;
use tunnelmesh_core::benchmark::{self, ChaosConfig};
use tunnelmesh_core::coord::server::{CoordConfig, CoordServer};
use tunnelmesh_core::proto::RegisterRequest;
use tunnelmesh_core::shutdown::{self, ShutdownWatch};
use tunnelmesh_core::tunnel::dataplane::TrafficCounters;
use tunnelmesh_core::tunnel::dns::ResolverCache;
use tunnelmesh_core::tunnel::lifecycle::{spawn_heartbeat_loop, DialContext, LifecycleManager};
use tunnelmesh_core::tunnel::transport::{AuthorizedKeys, StreamIdentity};
use tunnelmesh_core::{bytesize, Client, PersistentRelay, RetryConfig, TunnelRouter};

#[derive(Parser)]
#[command(name = "tunnelmesh")]
#[command(about = "Overlay mesh networking: encrypted peer tunnels over a virtual subnet")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination server
    Serve {
        /// Path to the server TOML config
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run the peer daemon
    Up {
        /// Path to the peer TOML config
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Benchmark throughput and latency against another peer
    Bench {
        /// Target peer name
        peer: String,
        /// Path to the peer TOML config
        #[arg(short, long)]
        config: PathBuf,
        /// Transfer size, human units accepted ("64MB", "1.5GB")
        #[arg(long, default_value = "10MB")]
        size: String,
        /// "upload" or "download"
        #[arg(long, default_value = "upload")]
        direction: String,
        /// Override the target address instead of resolving via the
        /// directory
        #[arg(long)]
        addr: Option<String>,
        /// Benchmark port on the target peer
        #[arg(long, default_value_t = benchmark::DEFAULT_PORT)]
        port: u16,
        /// Chaos: percentage of writes to drop
        #[arg(long, default_value_t = 0.0)]
        loss: f64,
        /// Chaos: fixed latency per write, milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        /// Chaos: latency jitter, milliseconds
        #[arg(long, default_value_t = 0)]
        jitter_ms: u64,
        /// Chaos: bandwidth cap ("10mbps", "1MB/s")
        #[arg(long)]
        bandwidth: Option<String>,
        /// Emit the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { config } => run_serve(&config).await,
        Commands::Up { config } => run_up(&config).await,
        Commands::Bench {
            peer,
            config,
            size,
            direction,
            addr,
            port,
            loss,
            latency_ms,
            jitter_ms,
            bandwidth,
            json,
        } => {
            run_bench(BenchArgs {
                peer,
                config,
                size,
                direction,
                addr,
                port,
                loss,
                latency_ms,
                jitter_ms,
                bandwidth,
                json,
            })
            .await
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

/// A shutdown watch that fires on ctrl-c.
fn ctrl_c_shutdown() -> ShutdownWatch {
    let (trigger, watch) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            trigger.trigger();
        }
    });
    watch
}

async fn run_serve(config_path: &PathBuf) -> Result<()> {
    let cfg = config::load_server_config(config_path)?;

    let server = CoordServer::new(CoordConfig {
        listen: cfg
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", cfg.listen))?,
        auth_token: cfg.auth_token,
        mesh_cidr: cfg
            .mesh_cidr
            .parse()
            .with_context(|| format!("invalid mesh CIDR {:?}", cfg.mesh_cidr))?,
        domain_suffix: cfg.domain_suffix,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
    .context("failed to build coordination server")?;

    server.run(ctrl_c_shutdown()).await;
    Ok(())
}

async fn run_up(config_path: &PathBuf) -> Result<()> {
    let cfg = config::load_peer_config(config_path)?;
    let shutdown = ctrl_c_shutdown();

    let client = Arc::new(Client::new(&cfg.server, &cfg.auth_token));

    // Register, retrying while the coordinator comes up.
    let registration = client
        .register_with_retry(
            &RegisterRequest {
                name: cfg.name.clone(),
                public_key: cfg.public_key.clone(),
                public_ips: cfg.public_ips.clone(),
                private_ips: cfg.private_ips.clone(),
                ssh_port: cfg.ssh_port,
                udp_port: cfg.udp_port,
                behind_nat: false,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            &RetryConfig::default(),
            shutdown.clone(),
        )
        .await
        .context("registration failed")?;
    tracing::info!(
        mesh_ip = %registration.mesh_ip,
        cidr = %registration.mesh_cidr,
        "registered with coordination server"
    );

    // Persistent relay session for peers with no direct path.
    let relay = PersistentRelay::new(&cfg.server, &cfg.name, &registration.token);
    relay
        .connect()
        .await
        .context("relay connection failed")?;

    let router = TunnelRouter::new();
    let (manager, mut discovery) = LifecycleManager::new(router.clone());
    let keys = AuthorizedKeys::new();
    let counters = TrafficCounters::new();
    let resolver = ResolverCache::new(Duration::from_secs(cfg.dns.cache_ttl));

    let dial_ctx = Arc::new(DialContext {
        local: StreamIdentity {
            name: cfg.name.clone(),
            fingerprint: cfg.public_key.clone(),
        },
        keys: keys.clone(),
        relay: Some(relay.clone()),
        udp_secret: cfg.auth_token.clone().into_bytes(),
    });

    // Initial mesh walk: learn every peer and bring a tunnel up.
    match client.list_peers().await {
        Ok(peers) => {
            for peer in peers.iter().filter(|p| p.name != cfg.name) {
                keys.insert(&peer.name, &peer.public_key);
                if let Err(err) = manager.connect_peer(peer, &dial_ctx).await {
                    tracing::warn!(peer = %peer.name, error = %err, "initial connect failed");
                }
            }
            router.sync_routes(&peers);
        }
        Err(err) => tracing::warn!(error = %err, "initial peer listing failed"),
    }

    // Discovery loop: re-dial peers whose sessions were invalidated or
    // dropped.
    {
        let client = Arc::clone(&client);
        let manager = Arc::clone(&manager);
        let dial_ctx = Arc::clone(&dial_ctx);
        let keys = keys.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = shutdown.triggered() => break,
                    name = discovery.recv() => match name {
                        Some(name) => name,
                        None => break,
                    }
                };
                match client.get_peer(&name).await {
                    Ok(peer) => {
                        keys.insert(&peer.name, &peer.public_key);
                        if let Err(err) = manager.connect_peer(&peer, &dial_ctx).await {
                            tracing::warn!(peer = %name, error = %err, "reconnect failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(peer = %name, error = %err, "reconnect lookup failed")
                    }
                }
            }
        });
    }

    // Heartbeats plus DNS sync every 30 seconds.
    let stats_counters = Arc::clone(&counters);
    let heartbeat = spawn_heartbeat_loop(
        Arc::clone(&client),
        cfg.name.clone(),
        cfg.public_key.clone(),
        Arc::new(move || stats_counters.snapshot()),
        resolver,
        shutdown.clone(),
    );

    // In-band benchmark server on the overlay.
    let bench_server = BenchServer::new("0.0.0.0", cfg.benchmark_port);
    bench_server
        .start()
        .await
        .context("benchmark server failed to start")?;

    tracing::info!(peer = %cfg.name, "peer daemon running");
    let mut shutdown_wait = shutdown.clone();
    shutdown_wait.triggered().await;

    let _ = bench_server.stop();
    relay.close();
    heartbeat.abort();
    tracing::info!("peer daemon stopped");
    Ok(())
}

struct BenchArgs {
    peer: String,
    config: PathBuf,
    size: String,
    direction: String,
    addr: Option<String>,
    port: u16,
    loss: f64,
    latency_ms: u64,
    jitter_ms: u64,
    bandwidth: Option<String>,
    json: bool,
}

async fn run_bench(args: BenchArgs) -> Result<()> {
    let cfg = config::load_peer_config(&args.config)?;

    let size = bytesize::parse(&args.size)
        .with_context(|| format!("invalid size {:?}", args.size))?;
    let direction = args
        .direction
        .parse()
        .with_context(|| format!("invalid direction {:?}", args.direction))?;
    let bandwidth_bps = match &args.bandwidth {
        Some(rate) => {
            bytesize::parse_rate(rate).with_context(|| format!("invalid bandwidth {:?}", rate))?
        }
        None => 0,
    };

    // Resolve the target through the directory unless overridden.
    let target_addr = match args.addr {
        Some(addr) => addr,
        None => {
            let client = Client::new(&cfg.server, &cfg.auth_token);
            let peer = client
                .get_peer(&args.peer)
                .await
                .with_context(|| format!("failed to resolve peer {:?}", args.peer))?;
            peer.mesh_ip
        }
    };

    let bench_cfg = benchmark::Config {
        peer_name: args.peer.clone(),
        size,
        direction,
        timeout_secs: 0,
        port: args.port,
        chaos: ChaosConfig {
            packet_loss_percent: args.loss,
            latency_ms: args.latency_ms,
            jitter_ms: args.jitter_ms,
            bandwidth_bps,
        },
    };

    let bench_client = BenchClient::new(&cfg.name, &target_addr);
    let result = bench_client
        .run(bench_cfg, ctrl_c_shutdown())
        .await
        .context("benchmark failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "{} {} -> {}",
            result.direction, result.local_peer, result.remote_peer
        );
        println!(
            "  transferred  {} in {} ms",
            bytesize::format(result.transferred_size_bytes),
            result.duration_ms
        );
        println!(
            "  throughput   {} ({:.2} Mbps)",
            bytesize::format_rate(result.throughput_bps as i64),
            result.throughput_mbps
        );
        println!(
            "  latency      min {:.2} ms / avg {:.2} ms / max {:.2} ms",
            result.latency_min_ms, result.latency_avg_ms, result.latency_max_ms
        );
        if let Some(chaos) = &result.chaos {
            println!(
                "  chaos        loss {:.1}% latency {} ms jitter {} ms bandwidth {} B/s",
                chaos.packet_loss_percent,
                chaos.latency_ms,
                chaos.jitter_ms,
                chaos.bandwidth_bps
            );
        }
        if !result.success {
            anyhow::bail!("benchmark did not complete: {}", result.error);
        }
    }

    Ok(())
}
