//! Controller configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// How many prepare acknowledgments a configuration change needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Every currently alive member of the candidate config must accept
    #[default]
    AllAlive,
    /// A strict majority of the targeted members must accept
    Majority,
}

impl QuorumPolicy {
    /// Number of acknowledgments required out of `targets`
    pub fn required(&self, targets: usize) -> usize {
        match self {
            QuorumPolicy::AllAlive => targets,
            QuorumPolicy::Majority => targets / 2 + 1,
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Address other members use to reach this process (`host:port`).
    /// Identifies the "self" server in the topology.
    pub advertise_uri: String,

    /// Display name of this instance
    pub alias: Option<String>,

    /// Bind address for cluster traffic (UDP probes and TCP propagation)
    pub cluster_addr: SocketAddr,

    /// Prober configuration
    pub probe: ProbeConfig,

    /// Two-phase apply configuration
    pub apply: ApplyConfig,

    /// Transport configuration
    pub transport: TransportConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            advertise_uri: "localhost:3301".to_string(),
            alias: None,
            cluster_addr: SocketAddr::from(([0, 0, 0, 0], 3301)),
            probe: ProbeConfig::default(),
            apply: ApplyConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Create configuration builder
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::new()
    }

    /// Validate the configuration before start-up
    pub fn validate(&self) -> Result<(), String> {
        let (host, port) = self
            .advertise_uri
            .rsplit_once(':')
            .ok_or_else(|| format!("advertise uri \"{}\" must be host:port", self.advertise_uri))?;
        if host.is_empty() {
            return Err(format!("advertise uri \"{}\" has no host", self.advertise_uri));
        }
        port.parse::<u16>()
            .map_err(|_| format!("advertise uri \"{}\" has invalid port", self.advertise_uri))?;
        if self.probe.ping_timeout >= self.probe.ping_interval {
            return Err("probe.ping_timeout must be shorter than probe.ping_interval".to_string());
        }
        if self.probe.suspicion_multiplier == 0 {
            return Err("probe.suspicion_multiplier must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Builder for controller configuration
#[derive(Debug, Default)]
pub struct ControllerConfigBuilder {
    advertise_uri: Option<String>,
    alias: Option<String>,
    cluster_addr: Option<SocketAddr>,
    probe: Option<ProbeConfig>,
    apply: Option<ApplyConfig>,
    transport: Option<TransportConfig>,
}

impl ControllerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advertise_uri(mut self, uri: impl Into<String>) -> Self {
        self.advertise_uri = Some(uri.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn cluster_addr(mut self, addr: SocketAddr) -> Self {
        self.cluster_addr = Some(addr);
        self
    }

    pub fn probe(mut self, config: ProbeConfig) -> Self {
        self.probe = Some(config);
        self
    }

    pub fn apply(mut self, config: ApplyConfig) -> Self {
        self.apply = Some(config);
        self
    }

    pub fn transport(mut self, config: TransportConfig) -> Self {
        self.transport = Some(config);
        self
    }

    pub fn build(self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        let cluster_addr = self.cluster_addr.unwrap_or(defaults.cluster_addr);
        ControllerConfig {
            advertise_uri: self
                .advertise_uri
                .unwrap_or_else(|| format!("localhost:{}", cluster_addr.port())),
            alias: self.alias,
            cluster_addr,
            probe: self.probe.unwrap_or_default(),
            apply: self.apply.unwrap_or_default(),
            transport: self.transport.unwrap_or_default(),
        }
    }
}

/// Membership prober configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Interval between background sweeps
    pub ping_interval: Duration,

    /// How long a background ping waits for its ack
    pub ping_timeout: Duration,

    /// Timeout of an explicit `probe_server` call
    pub probe_timeout: Duration,

    /// A suspect member is declared dead after
    /// `suspicion_multiplier * ping_interval` without an ack
    pub suspicion_multiplier: u32,

    /// Shared secret used to sign probe datagrams (None = unsigned)
    pub cluster_cookie: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
            suspicion_multiplier: 4,
            cluster_cookie: None,
        }
    }
}

/// Two-phase configuration apply settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Per-target timeout of the prepare phase
    pub prepare_timeout: Duration,

    /// Per-target timeout of the commit and abort phases
    pub commit_timeout: Duration,

    /// Acknowledgment rule for the prepare phase
    pub quorum: QuorumPolicy,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(3),
            commit_timeout: Duration::from_secs(3),
            quorum: QuorumPolicy::AllAlive,
        }
    }
}

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read timeout
    pub read_timeout: Duration,
    /// Write timeout
    pub write_timeout: Duration,
    /// Maximum pooled connections per peer
    pub max_connections_per_peer: usize,
    /// Enable TCP nodelay
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_connections_per_peer: 2,
            tcp_nodelay: true,
        }
    }
}
