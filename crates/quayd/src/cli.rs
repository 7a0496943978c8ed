//! CLI argument parsing for the Quay daemon

use clap::{Parser, ValueEnum};
use quay_cluster::{
    ApplyConfig, ControllerConfig, ProbeConfig, QuorumPolicy, TransportConfig,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Quay - cluster topology and membership controller
///
/// Each instance probes its peers over UDP, propagates topology changes over
/// TCP with a two-phase apply and serves a JSON admin API over HTTP.
#[derive(Parser, Debug)]
#[command(name = "quayd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    // ============ Identity ============
    /// Uri other instances use to reach this one (host:port)
    /// Defaults to localhost and the cluster bind port
    #[arg(long, env = "QUAY_ADVERTISE_URI")]
    pub advertise_uri: Option<String>,

    /// Display name of this instance
    #[arg(long, env = "QUAY_ALIAS")]
    pub alias: Option<String>,

    // ============ Network ============
    /// Cluster bind address (UDP probes and TCP propagation)
    #[arg(long, default_value = "0.0.0.0:3301", env = "QUAY_CLUSTER_BIND")]
    pub cluster_bind: SocketAddr,

    /// Admin HTTP API bind address
    #[arg(long, default_value = "0.0.0.0:8081", env = "QUAY_API_BIND")]
    pub api_bind: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    // ============ Probing ============
    /// Background ping interval in milliseconds
    #[arg(long, default_value = "1000", env = "QUAY_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,

    /// Background ping timeout in milliseconds
    #[arg(long, default_value = "500", env = "QUAY_PING_TIMEOUT_MS")]
    pub ping_timeout_ms: u64,

    /// probe_server timeout in milliseconds
    #[arg(long, default_value = "2000", env = "QUAY_PROBE_TIMEOUT_MS")]
    pub probe_timeout_ms: u64,

    /// Suspect members are declared dead after this many ping intervals
    #[arg(long, default_value = "4", env = "QUAY_SUSPICION_MULT")]
    pub suspicion_mult: u32,

    /// Shared secret for signing probe datagrams
    #[arg(long, env = "QUAY_CLUSTER_COOKIE", hide_env_values = true)]
    pub cluster_cookie: Option<String>,

    // ============ Two-phase apply ============
    /// Per-target prepare timeout in milliseconds
    #[arg(long, default_value = "3000", env = "QUAY_PREPARE_TIMEOUT_MS")]
    pub prepare_timeout_ms: u64,

    /// Per-target commit timeout in milliseconds
    #[arg(long, default_value = "3000", env = "QUAY_COMMIT_TIMEOUT_MS")]
    pub commit_timeout_ms: u64,

    /// Prepare acknowledgment rule
    #[arg(long, default_value = "all-alive", env = "QUAY_QUORUM")]
    pub quorum: Quorum,

    // ============ Transport ============
    /// TCP connect timeout in milliseconds
    #[arg(long, default_value = "2000", env = "QUAY_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: u64,

    /// TCP_NODELAY for cluster connections
    #[arg(long, default_value = "true", env = "QUAY_TCP_NODELAY")]
    pub tcp_nodelay: bool,

    // ============ Metrics ============
    /// Enable the Prometheus exporter
    #[arg(long, default_value = "false", env = "QUAY_METRICS")]
    pub metrics: bool,

    /// Prometheus exporter bind address
    #[arg(long, default_value = "0.0.0.0:9090", env = "QUAY_METRICS_BIND")]
    pub metrics_bind: SocketAddr,
}

/// Prepare acknowledgment rule
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Quorum {
    /// Every alive member must accept
    #[default]
    AllAlive,
    /// A strict majority must accept
    Majority,
}

impl From<Quorum> for QuorumPolicy {
    fn from(quorum: Quorum) -> Self {
        match quorum {
            Quorum::AllAlive => QuorumPolicy::AllAlive,
            Quorum::Majority => QuorumPolicy::Majority,
        }
    }
}

impl Cli {
    /// Advertised uri, falling back to localhost and the bind port
    pub fn effective_advertise_uri(&self) -> String {
        self.advertise_uri
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", self.cluster_bind.port()))
    }

    /// Convert CLI args to controller config
    pub fn to_controller_config(&self) -> ControllerConfig {
        let mut builder = ControllerConfig::builder()
            .advertise_uri(self.effective_advertise_uri())
            .cluster_addr(self.cluster_bind)
            .probe(ProbeConfig {
                ping_interval: Duration::from_millis(self.ping_interval_ms),
                ping_timeout: Duration::from_millis(self.ping_timeout_ms),
                probe_timeout: Duration::from_millis(self.probe_timeout_ms),
                suspicion_multiplier: self.suspicion_mult,
                cluster_cookie: self.cluster_cookie.clone(),
            })
            .apply(ApplyConfig {
                prepare_timeout: Duration::from_millis(self.prepare_timeout_ms),
                commit_timeout: Duration::from_millis(self.commit_timeout_ms),
                quorum: self.quorum.into(),
            })
            .transport(TransportConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                tcp_nodelay: self.tcp_nodelay,
                ..Default::default()
            });
        if let Some(alias) = &self.alias {
            builder = builder.alias(alias.clone());
        }
        builder.build()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.api_bind == self.cluster_bind {
            return Err(format!(
                "api_bind ({}) must differ from cluster_bind",
                self.api_bind
            ));
        }
        if self.metrics && self.metrics_bind == self.api_bind {
            return Err(format!(
                "metrics_bind ({}) must differ from api_bind",
                self.metrics_bind
            ));
        }
        if self.cluster_cookie.as_deref() == Some("") {
            return Err("cluster_cookie must not be empty".to_string());
        }
        self.to_controller_config().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cli() {
        let cli = Cli::parse_from(["quayd"]);
        assert_eq!(cli.cluster_bind.port(), 3301);
        assert_eq!(cli.effective_advertise_uri(), "localhost:3301");
        assert_eq!(cli.quorum, Quorum::AllAlive);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_controller_config_generation() {
        let cli = Cli::parse_from([
            "quayd",
            "--advertise-uri",
            "storage-1.local:3302",
            "--alias",
            "storage-1",
            "--cluster-bind",
            "0.0.0.0:3302",
            "--ping-interval-ms",
            "250",
            "--ping-timeout-ms",
            "100",
            "--quorum",
            "majority",
        ]);
        let config = cli.to_controller_config();
        assert_eq!(config.advertise_uri, "storage-1.local:3302");
        assert_eq!(config.alias.as_deref(), Some("storage-1"));
        assert_eq!(config.probe.ping_interval, Duration::from_millis(250));
        assert_eq!(config.apply.quorum, QuorumPolicy::Majority);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_overlapping_binds() {
        let cli = Cli::parse_from(["quayd", "--api-bind", "0.0.0.0:3301"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_slow_ping_timeout() {
        let cli = Cli::parse_from([
            "quayd",
            "--ping-interval-ms",
            "100",
            "--ping-timeout-ms",
            "100",
        ]);
        assert!(cli.validate().is_err());
    }
}
