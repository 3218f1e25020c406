//! Coordination server - REST surface plus the persistent relay endpoint
//!
//! Bearer-token auth on every endpoint except /health. REST endpoints use
//! the configured shared secret; the relay websocket authenticates with an
//! issued token, which binds the session to the token's peer name.

use super::auth::TokenAuthority;
use super::directory::{Directory, DirectoryError};
use super::relay::RelayHub;
use crate::proto::{
    AdminOverview, ErrorResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse,
};
use crate::shutdown::ShutdownWatch;
use crate::tunnel::frame::RelayFrame;
use futures::{SinkExt, StreamExt};
use ipnet::Ipv4Net;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use warp::http::StatusCode;
use warp::{Filter, Reply};

/// Coordination server configuration.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub listen: SocketAddr,
    /// Shared secret peers present on the REST surface.
    pub auth_token: String,
    pub mesh_cidr: Ipv4Net,
    pub domain_suffix: String,
    pub version: String,
}

/// The coordination server: directory, token authority, and relay hub
/// behind one HTTP listener.
pub struct CoordServer {
    cfg: CoordConfig,
    directory: Arc<Directory>,
    hub: Arc<RelayHub>,
    tokens: Arc<TokenAuthority>,
    started_at: Instant,
}

impl CoordServer {
    pub fn new(cfg: CoordConfig) -> Result<Arc<Self>, DirectoryError> {
        let directory = Arc::new(Directory::new(cfg.mesh_cidr, cfg.domain_suffix.clone())?);
        let tokens = Arc::new(TokenAuthority::new(cfg.auth_token.as_bytes()));
        Ok(Arc::new(CoordServer {
            cfg,
            directory,
            hub: Arc::new(RelayHub::new()),
            tokens,
            started_at: Instant::now(),
        }))
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// The complete route tree. Split out from `run` so tests can drive
    /// it through `warp::test` without binding a socket.
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
        let with_server = {
            let server = Arc::clone(self);
            warp::any().map(move || Arc::clone(&server))
        };
        let auth_header = warp::header::optional::<String>("authorization");

        // GET /health
        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| "ok");

        // POST /api/v1/register
        let register = warp::path!("api" / "v1" / "register")
            .and(warp::post())
            .and(auth_header)
            .and(warp::body::json())
            .and(with_server.clone())
            .and_then(handle_register);

        // POST /api/v1/heartbeat
        let heartbeat = warp::path!("api" / "v1" / "heartbeat")
            .and(warp::post())
            .and(auth_header)
            .and(warp::body::json())
            .and(with_server.clone())
            .and_then(handle_heartbeat);

        // GET /api/v1/peers
        let peers = warp::path!("api" / "v1" / "peers")
            .and(warp::get())
            .and(auth_header)
            .and(with_server.clone())
            .and_then(handle_peers);

        // DELETE /api/v1/peers/{name}
        let deregister = warp::path!("api" / "v1" / "peers" / String)
            .and(warp::delete())
            .and(auth_header)
            .and(with_server.clone())
            .and_then(handle_deregister);

        // GET /api/v1/dns
        let dns = warp::path!("api" / "v1" / "dns")
            .and(warp::get())
            .and(auth_header)
            .and(with_server.clone())
            .and_then(handle_dns);

        // GET /api/v1/admin/overview
        let admin = warp::path!("api" / "v1" / "admin" / "overview")
            .and(warp::get())
            .and(auth_header)
            .and(with_server.clone())
            .and_then(handle_admin_overview);

        // GET /api/v1/relay/persistent (websocket upgrade)
        let relay = warp::path!("api" / "v1" / "relay" / "persistent")
            .and(warp::ws())
            .and(auth_header)
            .and(with_server)
            .map(
                |ws: warp::ws::Ws, auth: Option<String>, server: Arc<CoordServer>| {
                    let token = match bearer(&auth) {
                        Some(token) => token.to_string(),
                        None => return unauthorized_reply(),
                    };
                    let claims = match server.tokens.validate(&token) {
                        Ok(claims) => claims,
                        Err(err) => {
                            tracing::debug!(error = %err, "relay token rejected");
                            return unauthorized_reply();
                        }
                    };

                    Box::new(ws.on_upgrade(move |socket| {
                        relay_session(server, claims.peer_name, socket)
                    })) as Box<dyn Reply>
                },
            );

        health
            .or(register)
            .or(heartbeat)
            .or(deregister)
            .or(peers)
            .or(dns)
            .or(admin)
            .or(relay)
    }

    /// Serve until shutdown fires, then close all relay sessions.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownWatch) {
        let routes = self.routes();
        let hub = Arc::clone(&self.hub);
        let listen = self.cfg.listen;

        let (addr, serving) =
            warp::serve(routes).bind_with_graceful_shutdown(listen, async move {
                shutdown.triggered().await;
            });
        tracing::info!(addr = %addr, "coordination server listening");

        serving.await;
        hub.close_all();
        tracing::info!("coordination server stopped");
    }

    fn authorized(&self, auth: &Option<String>) -> bool {
        bearer(auth) == Some(self.cfg.auth_token.as_str())
    }
}

fn bearer(auth: &Option<String>) -> Option<&str> {
    auth.as_deref()?.strip_prefix("Bearer ")
}

fn unauthorized_reply() -> Box<dyn Reply> {
    Box::new(warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: "unauthorized".to_string(),
            message: String::new(),
        }),
        StatusCode::UNAUTHORIZED,
    ))
}

fn error_reply(status: StatusCode, error: &str, message: impl Into<String>) -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
        status,
    )
    .into_response()
}

fn directory_error_reply(err: DirectoryError) -> warp::reply::Response {
    let (status, error) = match &err {
        DirectoryError::InvalidName(_) => (StatusCode::BAD_REQUEST, "invalid_name"),
        DirectoryError::KeyConflict(_) => (StatusCode::CONFLICT, "name_conflict"),
        DirectoryError::UnknownPeer(_) => (StatusCode::NOT_FOUND, "unknown_peer"),
        DirectoryError::KeyMismatch(_) => (StatusCode::UNAUTHORIZED, "key_mismatch"),
        DirectoryError::PoolExhausted | DirectoryError::UnusableCidr(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    error_reply(status, error, err.to_string())
}

async fn handle_register(
    auth: Option<String>,
    req: RegisterRequest,
    server: Arc<CoordServer>,
) -> Result<warp::reply::Response, Infallible> {
    if !server.authorized(&auth) {
        return Ok(error_reply(StatusCode::UNAUTHORIZED, "unauthorized", ""));
    }

    let mesh_ip = match server.directory.register(&req) {
        Ok(ip) => ip,
        Err(err) => return Ok(directory_error_reply(err)),
    };

    let token = server.tokens.issue(&req.name, &mesh_ip.to_string());
    let resp = RegisterResponse {
        mesh_ip: mesh_ip.to_string(),
        mesh_cidr: server.cfg.mesh_cidr.to_string(),
        domain: server.cfg.domain_suffix.clone(),
        token,
    };
    Ok(warp::reply::json(&resp).into_response())
}

async fn handle_heartbeat(
    auth: Option<String>,
    req: HeartbeatRequest,
    server: Arc<CoordServer>,
) -> Result<warp::reply::Response, Infallible> {
    if !server.authorized(&auth) {
        return Ok(error_reply(StatusCode::UNAUTHORIZED, "unauthorized", ""));
    }

    match server.directory.heartbeat(&req.name, &req.public_key, req.stats) {
        Ok(()) => Ok(warp::reply::json(&HeartbeatResponse { ok: true }).into_response()),
        Err(err) => Ok(directory_error_reply(err)),
    }
}

async fn handle_peers(
    auth: Option<String>,
    server: Arc<CoordServer>,
) -> Result<warp::reply::Response, Infallible> {
    if !server.authorized(&auth) {
        return Ok(error_reply(StatusCode::UNAUTHORIZED, "unauthorized", ""));
    }
    Ok(warp::reply::json(&server.directory.list_peers()).into_response())
}

async fn handle_deregister(
    name: String,
    auth: Option<String>,
    server: Arc<CoordServer>,
) -> Result<warp::reply::Response, Infallible> {
    if !server.authorized(&auth) {
        return Ok(error_reply(StatusCode::UNAUTHORIZED, "unauthorized", ""));
    }

    // Idempotent: deleting an unknown peer is not an error.
    server.directory.deregister(&name);
    Ok(warp::reply::json(&serde_json::json!({ "ok": true })).into_response())
}

async fn handle_dns(
    auth: Option<String>,
    server: Arc<CoordServer>,
) -> Result<warp::reply::Response, Infallible> {
    if !server.authorized(&auth) {
        return Ok(error_reply(StatusCode::UNAUTHORIZED, "unauthorized", ""));
    }
    Ok(warp::reply::json(&server.directory.dns_records()).into_response())
}

async fn handle_admin_overview(
    auth: Option<String>,
    server: Arc<CoordServer>,
) -> Result<warp::reply::Response, Infallible> {
    if !server.authorized(&auth) {
        return Ok(error_reply(StatusCode::UNAUTHORIZED, "unauthorized", ""));
    }

    let overview = AdminOverview {
        server_uptime_secs: server.started_at.elapsed().as_secs(),
        server_version: server.cfg.version.clone(),
        total_peers: server.directory.peer_count(),
        online_peers: server.directory.online_count(),
        total_heartbeats: server.directory.total_heartbeats(),
        mesh_cidr: server.cfg.mesh_cidr.to_string(),
        domain_suffix: server.cfg.domain_suffix.clone(),
        peers: server.directory.admin_peers(),
    };
    Ok(warp::reply::json(&overview).into_response())
}

/// One relay websocket session: register with the hub, pump the outbound
/// queue into the socket, route inbound frames, and clean up without
/// evicting a replacement session.
async fn relay_session(server: Arc<CoordServer>, peer_name: String, socket: warp::ws::WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handle = server.hub.register(&peer_name);
    let generation = handle.generation;
    let mut outbound = handle.outbound;
    let mut superseded = handle.superseded;

    let writer = tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if ws_tx.send(warp::ws::Message::binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = superseded.triggered() => {
                tracing::debug!(peer = %peer_name, "relay session superseded, ending read loop");
                break;
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        tracing::debug!(peer = %peer_name, error = %err, "relay read error");
                        break;
                    }
                    None => break,
                };

                if msg.is_close() {
                    break;
                }
                if !msg.is_binary() {
                    continue;
                }

                match RelayFrame::decode(msg.as_bytes()) {
                    Ok(RelayFrame::SendPacket { target, payload }) => {
                        server.hub.route(&peer_name, &target, payload);
                    }
                    Ok(RelayFrame::Heartbeat { stats }) => {
                        if let Err(err) = server.directory.heartbeat_relay(&peer_name, Some(stats)) {
                            tracing::debug!(peer = %peer_name, error = %err, "relay heartbeat failed");
                        }
                    }
                    Ok(RelayFrame::Close) => break,
                    Ok(_) => {}
                    // An unparseable frame is terminal for this session.
                    Err(err) => {
                        tracing::warn!(peer = %peer_name, error = %err, "bad relay frame");
                        break;
                    }
                }
            }
        }
    }

    server.hub.unregister(&peer_name, generation);
    writer.abort();
}

// ============================================================================
// TESTS
// ============================================================================
