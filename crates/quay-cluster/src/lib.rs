//! # Quay Cluster
//!
//! Topology and membership control for a cluster of application instances:
//! - **Probing**: UDP ping/ack liveness detection with suspicion timeouts
//! - **Topology**: versioned config of servers, replicasets, roles and masters
//! - **Two-phase apply**: every change is prepared on all alive members, then committed
//! - **Failover**: automatic master reassignment when a master dies
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Controller                           │
//! ├──────────────┬──────────────┬───────────────────────────────┤
//! │   Prober     │   Topology   │        Two-phase apply        │
//! │  (UDP)       │   store      │        (TCP, postcard)        │
//! ├──────────────┼──────────────┼───────────────────────────────┤
//! │ • Ping/ack   │ • Servers    │ • Prepare / commit / abort    │
//! │ • Suspect    │ • Replicasets│ • Quorum policy               │
//! │ • Dead       │ • Expelled   │ • Catch-up on newer versions  │
//! └──────────────┴──────────────┴───────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use quay_cluster::{Controller, ControllerConfig, JoinServer};
//!
//! let config = ControllerConfig::builder()
//!     .advertise_uri("localhost:33001")
//!     .cluster_addr("0.0.0.0:33001".parse()?)
//!     .build();
//! let controller = Controller::start(config).await?;
//!
//! // Bootstrap with self, then add a peer
//! controller.join_server(JoinServer::new("localhost:33001")).await?;
//! controller
//!     .join_server(JoinServer::new("localhost:33002").roles(["vshard-storage"]))
//!     .await?;
//! ```

pub mod api;
pub mod applier;
pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod error;
pub mod failover;
pub mod membership;
pub mod node;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod topology;
pub mod transport;
pub mod validator;

// Re-export main types
pub use api::{
    dispatch, AdminEnvelope, AdminError, AdminRequest, AdminResponse, HealthView, ReplicasetSummary,
    ReplicasetView, SelfView, ServerView,
};
pub use applier::{ConfigPeer, RoundDecision, TwoPhaseApplier};
pub use bootstrap::{BootstrapMachine, BootstrapState};
pub use config::{ApplyConfig, ControllerConfig, ProbeConfig, QuorumPolicy, TransportConfig};
pub use controller::{ClusterHealth, Controller, JoinServer};
pub use error::{ClusterError, ErrorKind, ProbeFailure, Result};
pub use failover::{ElectionPolicy, FailoverController, LowestUuid};
pub use membership::{MembershipEvent, ProbeMessage, Prober};
pub use node::{Liveness, LivenessSnapshot, Member};
pub use observability::{init_metrics, ApplyMetrics, ProbeMetrics, TopologyMetrics};
pub use protocol::{ClusterRequest, ClusterResponse};
pub use store::TopologyStore;
pub use topology::{
    ClusterConfig, Replicaset, ReplicasetId, ReplicasetStatus, Server, ServerId, ServerStatus,
    TopologyCommand,
};
pub use transport::Transport;
