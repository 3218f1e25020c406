// Configuration loading for the tunnelmesh CLI
//
// TOML files for both roles. Missing fields fall back to the documented
// defaults so a minimal config is just a name, a server, and a secret.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coordination server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the REST and relay surface.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Shared secret peers must present.
    pub auth_token: String,

    /// Virtual subnet peers get addresses from.
    #[serde(default = "default_mesh_cidr")]
    pub mesh_cidr: String,

    /// DNS suffix appended to peer names.
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,
}

/// Peer daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Unique peer name (DNS-safe, 1-63 chars).
    pub name: String,

    /// Coordination server base URL.
    pub server: String,

    /// Shared secret for the coordination server.
    pub auth_token: String,

    /// Public key fingerprint presented to other peers.
    #[serde(default)]
    pub public_key: String,

    /// Addresses other peers may reach us on, passed to the directory
    /// as hole-punch hints.
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub private_ips: Vec<String>,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    #[serde(default = "default_benchmark_port")]
    pub benchmark_port: u16,

    #[serde(default)]
    pub tun: TunConfig,

    #[serde(default)]
    pub dns: DnsConfig,
}

/// Virtual interface settings, consumed by the platform device layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl Default for TunConfig {
    fn default() -> Self {
        TunConfig {
            name: default_tun_name(),
            mtu: default_mtu(),
        }
    }
}

/// Local resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dns_listen")]
    pub listen: String,
    /// Record lifetime in seconds.
    #[serde(default = "default_dns_ttl")]
    pub cache_ttl: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            enabled: true,
            listen: default_dns_listen(),
            cache_ttl: default_dns_ttl(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_mesh_cidr() -> String {
    "10.99.0.0/16".to_string()
}

fn default_domain_suffix() -> String {
    ".mesh".to_string()
}

fn default_ssh_port() -> u16 {
    2222
}

fn default_udp_port() -> u16 {
    2223
}

fn default_benchmark_port() -> u16 {
    9998
}

fn default_tun_name() -> String {
    "tun-mesh0".to_string()
}

fn default_mtu() -> u32 {
    1400
}

fn default_true() -> bool {
    true
}

fn default_dns_listen() -> String {
    "127.0.0.53:5353".to_string()
}

fn default_dns_ttl() -> u64 {
    300
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: ServerConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(cfg)
}

pub fn load_peer_config(path: &Path) -> Result<PeerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: PeerConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    if cfg.name.is_empty() {
        anyhow::bail!("peer config requires a non-empty name");
    }
    if cfg.server.is_empty() {
        anyhow::bail!("peer config requires a server URL");
    }
    Ok(cfg)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_server_config_defaults() {
        let file = write_config(r#"auth_token = "secret""#);
        let cfg = load_server_config(file.path()).unwrap();

        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert_eq!(cfg.auth_token, "secret");
        assert_eq!(cfg.mesh_cidr, "10.99.0.0/16");
        assert_eq!(cfg.domain_suffix, ".mesh");
    }

    #[test]
    fn test_peer_config_defaults() {
        let file = write_config(
            r#"
name = "alice"
server = "https://mesh.example.com"
auth_token = "secret"
"#,
        );
        let cfg = load_peer_config(file.path()).unwrap();

        assert_eq!(cfg.name, "alice");
        assert_eq!(cfg.ssh_port, 2222);
        assert_eq!(cfg.udp_port, 2223);
        assert_eq!(cfg.benchmark_port, 9998);
        assert_eq!(cfg.tun.name, "tun-mesh0");
        assert_eq!(cfg.tun.mtu, 1400);
        assert!(cfg.dns.enabled);
        assert_eq!(cfg.dns.listen, "127.0.0.53:5353");
        assert_eq!(cfg.dns.cache_ttl, 300);
    }

    #[test]
    fn test_peer_config_overrides() {
        let file = write_config(
            r#"
name = "bob"
server = "https://mesh.example.com"
auth_token = "secret"
ssh_port = 2022

[tun]
name = "mesh1"
mtu = 1280

[dns]
enabled = false
"#,
        );
        let cfg = load_peer_config(file.path()).unwrap();

        assert_eq!(cfg.ssh_port, 2022);
        assert_eq!(cfg.tun.name, "mesh1");
        assert_eq!(cfg.tun.mtu, 1280);
        assert!(!cfg.dns.enabled);
        // Unrelated sections keep their defaults.
        assert_eq!(cfg.dns.listen, "127.0.0.53:5353");
    }

    #[test]
    fn test_peer_config_requires_name() {
        let file = write_config(
            r#"
name = ""
server = "https://mesh.example.com"
auth_token = "secret"
"#,
        );
        assert!(load_peer_config(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(load_server_config(Path::new("/nonexistent/config.toml")).is_err());
    }

    #[test]
    fn test_malformed_toml_errors() {
        let file = write_config("auth_token = [broken");
        assert!(load_server_config(file.path()).is_err());
    }
}
