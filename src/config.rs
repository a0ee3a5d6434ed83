//! Configuration surface (spec §6).
//!
//! Grounded on `mod_proxy.rs`'s `ProxyListenerParams`: a `Deserialize`
//! struct with `#[serde(default = ...)]` field defaults. The teacher loads
//! this from a Lua policy file; config-file loading is an out-of-scope
//! external collaborator for this proxy (spec §1), so we load the same
//! shape from TOML, with CLI flags (`clap`) able to override the bind
//! address and ports for quick local runs.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::egress::EgressAllowLists;

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_service_port() -> u16 {
    6650
}

fn default_num_acceptor_threads() -> usize {
    1
}

fn default_num_io_threads() -> usize {
    num_cpus()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_lookup_request_timeout_ms() -> u64 {
    10_000
}

fn default_keep_alive_interval_seconds() -> u64 {
    30
}

fn default_pending_queue_capacity() -> usize {
    256
}

fn default_backpressure_high_water_mark() -> usize {
    4 * 1024 * 1024
}

fn default_backpressure_low_water_mark() -> usize {
    1024 * 1024
}

fn default_max_tracked_topics() -> usize {
    100_000
}

fn default_shutdown_drain_deadline_seconds() -> u64 {
    60
}

fn default_proxy_log_level() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TlsConfig {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub trust_store: Option<PathBuf>,
    pub verify_hostname: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            certificate: None,
            private_key: None,
            trust_store: None,
            verify_hostname: true,
        }
    }
}

/// The typed realization of spec §6's "Listener configuration" table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_service_port")]
    pub service_port: u16,

    pub service_port_tls: Option<u16>,

    pub max_concurrent_inbound_connections: Option<usize>,
    pub max_concurrent_inbound_connections_per_ip: Option<usize>,

    #[serde(default = "default_lookup_semaphore_permits")]
    pub max_concurrent_lookup_requests: usize,

    #[serde(default)]
    pub egress: EgressAllowLists,

    #[serde(default = "default_num_acceptor_threads")]
    pub num_acceptor_threads: usize,
    #[serde(default = "default_num_io_threads")]
    pub num_io_threads: usize,

    pub advertised_address: Option<String>,
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default = "default_proxy_log_level")]
    pub proxy_log_level: u8,

    #[serde(default = "default_true")]
    pub proxy_zero_copy_mode_enabled: bool,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default = "default_lookup_request_timeout_ms", with = "ms_duration")]
    pub lookup_request_timeout: Duration,
    #[serde(
        default = "default_keep_alive_interval_seconds",
        with = "secs_duration"
    )]
    pub keep_alive_interval: Duration,
    pub idle_connection_timeout: Option<Duration>,

    #[serde(default = "default_pending_queue_capacity")]
    pub pending_queue_capacity: usize,
    #[serde(default = "default_backpressure_high_water_mark")]
    pub backpressure_high_water_mark: usize,
    #[serde(default = "default_backpressure_low_water_mark")]
    pub backpressure_low_water_mark: usize,

    #[serde(default = "default_max_tracked_topics")]
    pub max_tracked_topics: usize,

    #[serde(
        default = "default_shutdown_drain_deadline_seconds",
        with = "secs_duration"
    )]
    pub shutdown_drain_deadline: Duration,

    #[serde(default)]
    pub require_authentication: bool,
    #[serde(default)]
    pub require_authorization: bool,
}

fn default_true() -> bool {
    true
}
fn default_lookup_semaphore_permits() -> usize {
    1000
}
fn default_cluster_name() -> String {
    "standalone".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            bind_address: default_bind_address(),
            service_port: default_service_port(),
            service_port_tls: None,
            max_concurrent_inbound_connections: None,
            max_concurrent_inbound_connections_per_ip: None,
            max_concurrent_lookup_requests: default_lookup_semaphore_permits(),
            egress: EgressAllowLists::default(),
            num_acceptor_threads: default_num_acceptor_threads(),
            num_io_threads: default_num_io_threads(),
            advertised_address: None,
            cluster_name: default_cluster_name(),
            proxy_log_level: default_proxy_log_level(),
            proxy_zero_copy_mode_enabled: true,
            tls: TlsConfig::default(),
            lookup_request_timeout: Duration::from_millis(default_lookup_request_timeout_ms()),
            keep_alive_interval: Duration::from_secs(default_keep_alive_interval_seconds()),
            idle_connection_timeout: None,
            pending_queue_capacity: default_pending_queue_capacity(),
            backpressure_high_water_mark: default_backpressure_high_water_mark(),
            backpressure_low_water_mark: default_backpressure_low_water_mark(),
            max_tracked_topics: default_max_tracked_topics(),
            shutdown_drain_deadline: Duration::from_secs(
                default_shutdown_drain_deadline_seconds(),
            ),
            require_authentication: false,
            require_authorization: false,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {path:?}: {e}"))?;
        let cfg: ProxyConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {path:?}: {e}"))?;
        Ok(cfg)
    }

    pub fn plaintext_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        let ip: IpAddr = self.bind_address.parse()?;
        Ok(std::net::SocketAddr::new(ip, self.service_port))
    }

    pub fn tls_addr(&self) -> Option<anyhow::Result<std::net::SocketAddr>> {
        self.service_port_tls.map(|port| {
            let ip: IpAddr = self.bind_address.parse()?;
            Ok(std::net::SocketAddr::new(ip, port))
        })
    }

    pub fn advertised_service_url(&self) -> String {
        let host = self
            .advertised_address
            .clone()
            .unwrap_or_else(|| self.bind_address.clone());
        format!("pulsar://{host}:{}", self.service_port)
    }
}

mod ms_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod secs_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// CLI entry point. Legacy-flag style mirrors `proxy-server`'s `Opt`
/// (`--listen` et al accepted for quick standalone runs; `--config` for
/// the full TOML surface).
#[derive(Debug, Parser)]
#[command(name = "broker-proxy", about = "Client-facing proxy for a pub/sub messaging cluster")]
pub struct Opt {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed; if omitted,
    /// diagnostics are printed to stderr.
    #[arg(long)]
    pub diag_log_dir: Option<PathBuf>,

    /// [Legacy] plaintext listen address, e.g. "0.0.0.0:6650".
    #[arg(long)]
    pub listen: Option<String>,

    /// [Legacy] TLS listen address, e.g. "0.0.0.0:6651".
    #[arg(long)]
    pub listen_tls: Option<String>,

    /// [Legacy] Static `pulsar://host:port` broker target(s) to hand out
    /// from lookups and splice to, for running without a real discovery
    /// provider. Repeat to register a small fleet; the first one given is
    /// used as the default when a topic has no specific assignment.
    #[arg(long = "broker")]
    pub brokers: Vec<String>,

    /// [Legacy] Require clients to present this exact bearer token via the
    /// `token` auth method; unset means no authentication is required.
    #[arg(long)]
    pub auth_token: Option<String>,
}

impl Opt {
    pub fn resolve_config(&self) -> anyhow::Result<ProxyConfig> {
        let mut cfg = match &self.config {
            Some(path) => ProxyConfig::load(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(listen) = &self.listen {
            let addr: std::net::SocketAddr = listen.parse()?;
            cfg.bind_address = addr.ip().to_string();
            cfg.service_port = addr.port();
        }
        if let Some(listen_tls) = &self.listen_tls {
            let addr: std::net::SocketAddr = listen_tls.parse()?;
            cfg.service_port_tls = Some(addr.port());
        }

        Ok(cfg)
    }
}
