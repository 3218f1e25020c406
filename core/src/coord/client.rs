//! Peer control client - the typed REST client peers use to register,
//! heartbeat, and learn about the mesh
//!
//! Registration retries with exponential backoff on transient failures
//! (network errors, 5xx); auth and validation rejections fail fast.

use crate::proto::{
    DnsRecord, HeartbeatRequest, HeartbeatResponse, PeerInfo, PeerListResponse, PeerStats,
    RegisterRequest, RegisterResponse,
};
use crate::shutdown::ShutdownWatch;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Control client error types.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("registration failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Transient errors are worth retrying: network failures and 5xx.
    /// 4xx means the request itself is wrong and will not get better.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            ClientError::RetriesExhausted { .. } | ClientError::Cancelled => false,
        }
    }
}

/// Retry policy for `register_with_retry`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff before the next attempt: doubles per attempt, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        (self.initial_backoff * factor).min(self.max_backoff)
    }
}

/// Typed client for the coordination REST surface.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl Client {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Client {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        let resp = self
            .http
            .post(format!("{}/api/v1/register", self.base_url))
            .bearer_auth(&self.auth_token)
            .json(req)
            .send()
            .await?;
        Self::parse_json(resp).await
    }

    /// Register with exponential backoff. Gives up immediately on
    /// non-retryable errors and on cancellation; otherwise surfaces the
    /// final error annotated with the attempt count.
    pub async fn register_with_retry(
        &self,
        req: &RegisterRequest,
        retry: &RetryConfig,
        mut cancel: ShutdownWatch,
    ) -> Result<RegisterResponse, ClientError> {
        let mut last_err: Option<ClientError> = None;

        for attempt in 0..retry.max_retries {
            if cancel.is_triggered() {
                return Err(ClientError::Cancelled);
            }

            match self.register(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "registration attempt failed"
                    );
                    last_err = Some(err);
                }
            }

            // No sleep after the final attempt.
            if attempt + 1 < retry.max_retries {
                let backoff = retry.backoff(attempt);
                debug!(backoff_ms = backoff.as_millis() as u64, "backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.triggered() => return Err(ClientError::Cancelled),
                }
            }
        }

        Err(ClientError::RetriesExhausted {
            attempts: retry.max_retries,
            source: Box::new(last_err.unwrap_or(ClientError::Cancelled)),
        })
    }

    pub async fn heartbeat(
        &self,
        name: &str,
        public_key: &str,
        stats: Option<PeerStats>,
    ) -> Result<(), ClientError> {
        let req = HeartbeatRequest {
            name: name.to_string(),
            public_key: public_key.to_string(),
            stats,
        };
        let resp = self
            .http
            .post(format!("{}/api/v1/heartbeat", self.base_url))
            .bearer_auth(&self.auth_token)
            .json(&req)
            .send()
            .await?;
        let _: HeartbeatResponse = Self::parse_json(resp).await?;
        Ok(())
    }

    pub async fn deregister(&self, name: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(format!("{}/api/v1/peers/{}", self.base_url, name))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerInfo>, ClientError> {
        let resp = self
            .http
            .get(format!("{}/api/v1/peers", self.base_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        let list: PeerListResponse = Self::parse_json(resp).await?;
        Ok(list.into_peers())
    }

    /// Look one peer up by name. Returns `Status { 404 }` if the
    /// directory does not know it.
    pub async fn get_peer(&self, name: &str) -> Result<PeerInfo, ClientError> {
        let peers = self.list_peers().await?;
        peers
            .into_iter()
            .find(|p| p.name == name)
            .ok_or(ClientError::Status {
                status: 404,
                message: format!("no such peer: {}", name),
            })
    }

    pub async fn dns_records(&self) -> Result<Vec<DnsRecord>, ClientError> {
        let resp = self
            .http
            .get(format!("{}/api/v1/dns", self.base_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        Self::parse_json(resp).await
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ClientError> {
        let resp = Self::check_status(resp).await?;
        Ok(resp.json::<T>().await?)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::server::{CoordConfig, CoordServer};
    use crate::shutdown;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use warp::Filter;

    fn register_request(name: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.to_string(),
            public_key: "SHA256:abc123".to_string(),
            public_ips: vec!["1.2.3.4".to_string()],
            private_ips: vec![],
            ssh_port: 2222,
            udp_port: 2223,
            behind_nat: false,
            version: "v0.4.2".to_string(),
        }
    }

    async fn spawn_coord() -> (String, Arc<CoordServer>) {
        let server = CoordServer::new(CoordConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            auth_token: "test-token".to_string(),
            mesh_cidr: "10.99.0.0/16".parse().unwrap(),
            domain_suffix: ".mesh".to_string(),
            version: "test".to_string(),
        })
        .unwrap();

        let (addr, serving) =
            warp::serve(server.routes()).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serving);
        (format!("http://{}", addr), server)
    }

    /// A server that returns 503 for the first `failures` requests, then
    /// delegates a canned 200 registration response.
    async fn spawn_flaky(failures: u32) -> (String, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let route = warp::path!("api" / "v1" / "register").and(warp::post()).map(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= failures {
                warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"error": "unavailable"})),
                    warp::http::StatusCode::SERVICE_UNAVAILABLE,
                )
            } else {
                warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({
                        "mesh_ip": "10.99.1.1",
                        "mesh_cidr": "10.99.0.0/16",
                        "domain": ".mesh",
                        "token": "issued-token"
                    })),
                    warp::http::StatusCode::OK,
                )
            }
        });

        let (addr, serving) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serving);
        (format!("http://{}", addr), attempts)
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let (url, _server) = spawn_coord().await;
        let client = Client::new(url, "test-token");

        let resp = client.register(&register_request("mynode")).await.unwrap();
        assert!(resp.mesh_ip.starts_with("10.99."));
        assert_eq!(resp.mesh_cidr, "10.99.0.0/16");
        assert_eq!(resp.domain, ".mesh");

        let peers = client.list_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "mynode");
    }

    #[tokio::test]
    async fn test_register_bad_token_not_retryable() {
        let (url, _server) = spawn_coord().await;
        let client = Client::new(url, "wrong-token");

        let err = client
            .register(&register_request("mynode"))
            .await
            .unwrap_err();
        match &err {
            ClientError::Status { status, .. } => assert_eq!(*status, 401),
            other => panic!("expected Status, got {:?}", other),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_heartbeat_and_deregister() {
        let (url, _server) = spawn_coord().await;
        let client = Client::new(url, "test-token");

        client.register(&register_request("mynode")).await.unwrap();
        client
            .heartbeat("mynode", "SHA256:abc123", Some(PeerStats::default()))
            .await
            .unwrap();

        client.deregister("mynode").await.unwrap();
        assert!(client.list_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_peer_404() {
        let (url, _server) = spawn_coord().await;
        let client = Client::new(url, "test-token");

        let err = client
            .heartbeat("ghost", "SHA256:abc123", None)
            .await
            .unwrap_err();
        match err {
            ClientError::Status { status, .. } => assert_eq!(status, 404),
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dns_records() {
        let (url, _server) = spawn_coord().await;
        let client = Client::new(url, "test-token");

        client.register(&register_request("node1")).await.unwrap();
        let mut req2 = register_request("node2");
        req2.public_key = "SHA256:other".to_string();
        client.register(&req2).await.unwrap();

        let records = client.dns_records().await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let (url, attempts) = spawn_flaky(2).await;
        let client = Client::new(url, "test-token");

        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };

        let resp = client
            .register_with_retry(&register_request("mynode"), &retry, ShutdownWatch::never())
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3, "took 3 attempts");
        assert_eq!(resp.mesh_ip, "10.99.1.1");
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let (url, attempts) = spawn_flaky(u32::MAX).await;
        let client = Client::new(url, "test-token");

        let retry = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };

        let err = client
            .register_with_retry(&register_request("mynode"), &retry, ShutdownWatch::never())
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3, "exactly 3 attempts");
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let (url, attempts) = spawn_flaky(u32::MAX).await;
        let client = Client::new(url, "test-token");

        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };

        let (trigger, watch) = shutdown::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let err = client
            .register_with_retry(&register_request("mynode"), &retry, watch)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Cancelled));
        assert!(attempts.load(Ordering::SeqCst) <= 2, "stopped early");
    }

    #[tokio::test]
    async fn test_retry_connection_refused() {
        // Nothing listens here; every attempt is a network error.
        let client = Client::new("http://127.0.0.1:1", "test-token");

        let retry = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };

        let err = client
            .register_with_retry(&register_request("mynode"), &retry, ShutdownWatch::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn test_get_peer_not_found() {
        let (url, _server) = spawn_coord().await;
        let client = Client::new(url, "test-token");

        let err = client.get_peer("nobody").await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 404, .. }));
    }
}
