//! Configuration module for the relay
//!
//! Every setting is a CLI flag with an environment variable fallback.
//! Parsed once at startup; nothing here changes afterwards.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{is_valid_uuid, mask_uuid, CredentialSet, EgressPolicy};
use crate::logger::log;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default VLESS WebSocket path
pub const DEFAULT_VLESS_PATH: &str = "/ws";

/// Default Trojan WebSocket path
pub const DEFAULT_TROJAN_PATH: &str = "/trojan";

/// Default DNS-over-HTTPS endpoint
pub const DEFAULT_DOH_URL: &str = "https://1.1.1.1/dns-query";

/// CLI arguments for the relay
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "VLESS and Trojan over WebSocket relay with DNS-over-HTTPS"
)]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Listen address
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Comma-separated client UUIDs (version 4)
    #[arg(long, env = "UUID", default_value = "")]
    pub uuid: String,

    /// Trojan password (default: the first UUID)
    #[arg(long, env = "TROJAN_PASSWORD")]
    pub trojan_password: Option<String>,

    /// WebSocket path for VLESS
    #[arg(long, env = "VLESS_PATH", default_value = DEFAULT_VLESS_PATH)]
    pub vless_path: String,

    /// WebSocket path for Trojan
    #[arg(long, env = "TROJAN_PATH", default_value = DEFAULT_TROJAN_PATH)]
    pub trojan_path: String,

    /// Comma-separated fallback egress hosts; one is picked at startup
    #[arg(long, env = "PROXYIP")]
    pub proxy_ip: Option<String>,

    /// Fallback egress host that overrides proxy_ip
    #[arg(long, env = "STICKY_PROXYIP")]
    pub sticky_proxy_ip: Option<String>,

    /// DNS-over-HTTPS resolver for UDP port 53
    #[arg(long, env = "DOH_URL", default_value = DEFAULT_DOH_URL)]
    pub doh_url: String,

    /// TLS certificate file path (TLS is enabled with both cert and key)
    #[arg(long, env = "CERT_FILE")]
    pub cert_file: Option<String>,

    /// TLS private key file path
    #[arg(long, env = "KEY_FILE")]
    pub key_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// TCP connect timeout to target server (default: 10s)
    #[arg(long, env = "TCP_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// TLS, WebSocket upgrade and first header chunk (default: 10s)
    #[arg(long, env = "HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub handshake_timeout: Duration,

    /// DNS-over-HTTPS request timeout (default: 5s)
    #[arg(long, env = "DOH_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub doh_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(long, env = "BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Maximum concurrent connections, 0 = unlimited
    #[arg(
        long,
        env = "MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("Listen host is required"));
        }
        if self.valid_uuids().is_empty() {
            return Err(anyhow!("At least one valid version 4 UUID is required (--uuid)"));
        }
        if matches!(self.trojan_password.as_deref(), Some("")) {
            return Err(anyhow!("Trojan password must not be empty"));
        }

        for (name, path) in [("vless_path", &self.vless_path), ("trojan_path", &self.trojan_path)] {
            if !path.starts_with('/') {
                return Err(anyhow!("{} must start with '/': {}", name, path));
            }
        }
        if self.vless_path == self.trojan_path {
            return Err(anyhow!(
                "vless_path and trojan_path must differ, both are {}",
                self.vless_path
            ));
        }

        let doh = reqwest::Url::parse(&self.doh_url)
            .map_err(|e| anyhow!("Invalid DoH URL '{}': {}", self.doh_url, e))?;
        if doh.scheme() != "https" && doh.scheme() != "http" {
            return Err(anyhow!("DoH URL must be http(s): {}", self.doh_url));
        }

        if self.tcp_connect_timeout.is_zero() {
            return Err(anyhow!("tcp_connect_timeout must be greater than 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake_timeout must be greater than 0"));
        }
        if self.doh_timeout.is_zero() {
            return Err(anyhow!("doh_timeout must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }

        Ok(())
    }

    /// UUID entries, trimmed, empty entries skipped
    fn uuid_entries(&self) -> impl Iterator<Item = &str> {
        self.uuid.split(',').map(str::trim).filter(|s| !s.is_empty())
    }

    /// Valid UUIDs in configured order, lowercased
    pub fn valid_uuids(&self) -> Vec<String> {
        self.uuid_entries()
            .filter(|s| is_valid_uuid(s))
            .map(str::to_ascii_lowercase)
            .collect()
    }

    /// Build the credential set. Invalid UUID entries are dropped with a
    /// warning; the Trojan password defaults to the first valid UUID.
    pub fn credentials(&self) -> Result<CredentialSet> {
        for invalid in self.uuid_entries().filter(|s| !is_valid_uuid(s)) {
            log::warn!(uuid = %mask_uuid(invalid), "Ignoring invalid UUID");
        }

        let uuids = self.valid_uuids();
        let primary = uuids
            .first()
            .ok_or_else(|| anyhow!("At least one valid version 4 UUID is required (--uuid)"))?;
        let password = self.trojan_password.as_deref().unwrap_or(primary);

        Ok(CredentialSet::new(&uuids, password)?)
    }

    /// Pick the fallback egress host for this process
    pub fn egress_policy(&self) -> EgressPolicy {
        let candidates: Vec<String> = self
            .proxy_ip
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        EgressPolicy::select(self.sticky_proxy_ip.as_deref(), &candidates)
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// TCP connect timeout, per attempt
    pub connect_timeout: Duration,
    /// TLS + WebSocket upgrade + first chunk
    pub handshake_timeout: Duration,
    /// DoH request timeout
    pub doh_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Concurrent connection limit, 0 = unlimited
    pub max_connections: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            doh_timeout: Duration::from_secs(5),
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            connect_timeout: cli.tcp_connect_timeout,
            handshake_timeout: cli.handshake_timeout,
            doh_timeout: cli.doh_timeout,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }
}

/// Certificate and key paths when both are given and exist. Anything less
/// serves plain WebSocket, with a warning when only part of it is configured.
fn tls_files(cert: Option<&str>, key: Option<&str>) -> Option<(PathBuf, PathBuf)> {
    match (cert, key) {
        (None, None) => None,
        (Some(cert), Some(key)) if Path::new(cert).exists() && Path::new(key).exists() => {
            Some((PathBuf::from(cert), PathBuf::from(key)))
        }
        (cert, key) => {
            log::warn!(
                cert_file = cert.unwrap_or("-"),
                key_file = key.unwrap_or("-"),
                "TLS needs an existing certificate and key, serving without TLS"
            );
            None
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind
    pub host: String,
    /// Port number
    pub port: u16,
    /// Upgrade path served by the VLESS codec
    pub vless_path: String,
    /// Upgrade path served by the Trojan codec
    pub trojan_path: String,
    /// TLS certificate file path
    pub cert: Option<PathBuf>,
    /// TLS private key file path
    pub key: Option<PathBuf>,
}

impl ServerConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        let tls = tls_files(cli.cert_file.as_deref(), cli.key_file.as_deref());
        Self {
            host: cli.host.clone(),
            port: cli.port,
            vless_path: cli.vless_path.clone(),
            trojan_path: cli.trojan_path.clone(),
            cert: tls.as_ref().map(|(cert, _)| cert.clone()),
            key: tls.map(|(_, key)| key),
        }
    }

    pub fn has_tls(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}
