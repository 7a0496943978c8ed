//! Cluster error types
//!
//! The `Display` strings of the user-facing variants are part of the admin
//! API compatibility surface and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Why a probe did not reach its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeFailure {
    /// The address did not resolve, or the datagram could not be sent
    NotSent,
    /// The datagram went out but no ack arrived before the deadline
    NoResponse,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::NotSent => f.write_str("ping was not sent"),
            // Historical spelling, clients match on it.
            ProbeFailure::NoResponse => f.write_str("no responce"),
        }
    }
}

/// Coarse error classes used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Proposed change violates topology invariants; nothing was mutated
    Validation,
    /// Reachability check failed
    Probe,
    /// Operation not legal in the current bootstrap state
    Lifecycle,
    /// Propagation to the cluster failed; the candidate was discarded
    Apply,
    /// Transport, codec or programming-defect conditions
    Internal,
}

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Validation Errors ====================
    #[error("Server \"{uri}\" is not in membership")]
    NotInMembership { uri: String },

    #[error("Server \"{uuid}\" is expelled")]
    Expelled { uuid: Uuid },

    #[error("Server \"{uuid}\" not in config")]
    ServerNotInConfig { uuid: Uuid },

    #[error("Replicaset \"{uuid}\" not in config")]
    ReplicasetNotInConfig { uuid: Uuid },

    #[error("replicasets[{replicaset}].master does not exist")]
    MasterDoesNotExist { replicaset: Uuid },

    #[error("Server \"{uuid}\" is already joined")]
    AlreadyJoined { uuid: Uuid },

    #[error("Duplicate uri \"{uri}\"")]
    DuplicateUri { uri: String },

    #[error("Server \"{uuid}\" is the local instance and can not be expelled")]
    ExpelSelf { uuid: Uuid },

    #[error("Server \"{uuid}\" is the master of replicaset \"{replicaset}\" and can not be expelled")]
    ExpelMaster { uuid: Uuid, replicaset: Uuid },

    #[error("Invalid role name \"{0}\"")]
    InvalidRole(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid cluster configuration: {0}")]
    InvalidTopology(String),

    // ==================== Probe Errors ====================
    #[error("Probe \"{uri}\" failed: {reason}")]
    ProbeFailed { uri: String, reason: ProbeFailure },

    // ==================== Lifecycle Errors ====================
    #[error(
        "Invalid attempt to call join_server() on instance which is not bootstrapped yet.\n\
         Call join_server with uri=\"{self_uri}\" to bootstrap"
    )]
    BootstrapRequired { self_uri: String },

    #[error("Not bootstrapped yet")]
    NotBootstrapped,

    #[error("Bootstrap already in progress")]
    BootstrapInProgress,

    // ==================== Apply Errors ====================
    #[error("Prepare failed on \"{uri}\": {reason}")]
    PrepareFailed { uri: String, reason: String },

    #[error("Not enough acknowledgments: {acked} of {required} required")]
    QuorumNotReached { acked: usize, required: usize },

    #[error("Stale config version {proposed}, current is {current}")]
    StaleVersion { current: u64, proposed: u64 },

    #[error("No prepared config with version {0}")]
    NothingPrepared(u64),

    #[error("Config version {version} is already prepared")]
    ConfigLocked { version: u64 },

    /// A peer refused the request; carries the peer's own message
    #[error("{0}")]
    Rejected(String),

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ==================== Network Errors ====================
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("internal error: config version would not advance (current {current}, proposed {proposed})")]
    VersionNotMonotonic { current: u64, proposed: u64 },
}

impl ClusterError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        use ClusterError::*;
        match self {
            NotInMembership { .. }
            | Expelled { .. }
            | ServerNotInConfig { .. }
            | ReplicasetNotInConfig { .. }
            | MasterDoesNotExist { .. }
            | AlreadyJoined { .. }
            | DuplicateUri { .. }
            | ExpelSelf { .. }
            | ExpelMaster { .. }
            | InvalidRole(_)
            | InvalidArgument(_)
            | InvalidTopology(_) => ErrorKind::Validation,
            ProbeFailed { .. } => ErrorKind::Probe,
            BootstrapRequired { .. } | NotBootstrapped | BootstrapInProgress => {
                ErrorKind::Lifecycle
            }
            PrepareFailed { .. }
            | QuorumNotReached { .. }
            | StaleVersion { .. }
            | NothingPrepared(_)
            | ConfigLocked { .. }
            | Rejected(_) => ErrorKind::Apply,
            _ => ErrorKind::Internal,
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::PrepareFailed { .. }
                | ClusterError::QuorumNotReached { .. }
                | ClusterError::StaleVersion { .. }
                | ClusterError::ConfigLocked { .. }
                | ClusterError::BootstrapInProgress
                | ClusterError::Timeout
                | ClusterError::ConnectionFailed(_)
                | ClusterError::Network(_)
        ) || matches!(
            self,
            ClusterError::ProbeFailed {
                reason: ProbeFailure::NoResponse,
                ..
            }
        )
    }

    /// Check if this is a programming-defect condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::VersionNotMonotonic { .. })
    }
}

impl From<postcard::Error> for ClusterError {
    fn from(e: postcard::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(s: &str) -> Uuid {
        s.parse().unwrap()
    }

    #[test]
    fn test_probe_messages() {
        let err = ClusterError::ProbeFailed {
            uri: "localhost:9".into(),
            reason: ProbeFailure::NoResponse,
        };
        assert_eq!(err.to_string(), "Probe \"localhost:9\" failed: no responce");

        let err = ClusterError::ProbeFailed {
            uri: "bad-host".into(),
            reason: ProbeFailure::NotSent,
        };
        assert_eq!(
            err.to_string(),
            "Probe \"bad-host\" failed: ping was not sent"
        );
        assert_eq!(err.kind(), ErrorKind::Probe);
    }

    #[test]
    fn test_validation_messages() {
        let id = uuid("cccccccc-cccc-4000-b000-000000000001");
        assert_eq!(
            ClusterError::Expelled { uuid: id }.to_string(),
            "Server \"cccccccc-cccc-4000-b000-000000000001\" is expelled"
        );
        assert_eq!(
            ClusterError::ServerNotInConfig { uuid: id }.to_string(),
            "Server \"cccccccc-cccc-4000-b000-000000000001\" not in config"
        );
        assert_eq!(
            ClusterError::AlreadyJoined { uuid: id }.to_string(),
            "Server \"cccccccc-cccc-4000-b000-000000000001\" is already joined"
        );
        assert_eq!(
            ClusterError::NotInMembership {
                uri: "localhost:3303".into()
            }
            .to_string(),
            "Server \"localhost:3303\" is not in membership"
        );

        let rs = uuid("bbbbbbbb-0000-4000-b000-000000000000");
        assert_eq!(
            ClusterError::MasterDoesNotExist { replicaset: rs }.to_string(),
            "replicasets[bbbbbbbb-0000-4000-b000-000000000000].master does not exist"
        );
    }

    #[test]
    fn test_lifecycle_messages() {
        let err = ClusterError::BootstrapRequired {
            self_uri: "localhost:33101".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid attempt to call join_server() on instance which is not bootstrapped yet.\n\
             Call join_server with uri=\"localhost:33101\" to bootstrap"
        );
        assert_eq!(err.kind(), ErrorKind::Lifecycle);
        assert_eq!(ClusterError::NotBootstrapped.to_string(), "Not bootstrapped yet");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(ClusterError::Timeout.is_retriable());
        assert!(ClusterError::PrepareFailed {
            uri: "a:1".into(),
            reason: "request timeout".into()
        }
        .is_retriable());
        assert!(!ClusterError::NotBootstrapped.is_retriable());
        assert!(!ClusterError::ProbeFailed {
            uri: "bad-host".into(),
            reason: ProbeFailure::NotSent
        }
        .is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        let err = ClusterError::VersionNotMonotonic {
            current: 3,
            proposed: 3,
        };
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().starts_with("internal error"));
        assert!(!ClusterError::StaleVersion {
            current: 3,
            proposed: 2
        }
        .is_fatal());
    }
}
