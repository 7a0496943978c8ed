//! Per-process bootstrap lifecycle
//!
//! ```text
//! Unconfigured ──join_server(self)──▶ Bootstrapping ──commit──▶ Joined
//!      │                                   │
//!      │◀────────── apply failed ──────────┘
//!      └──────── committed config containing self ────────────▶ Joined
//! ```

use crate::error::{ClusterError, Result};
use crate::topology::ClusterConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lifecycle state of the local instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapState {
    /// No cluster config yet
    Unconfigured,
    /// The first config is being applied
    Bootstrapping,
    /// Part of a committed config
    Joined,
}

/// How a `join_server` call proceeds
pub enum JoinMode<'a> {
    /// Seed the cluster with the local instance
    Bootstrap(BootstrapGuard<'a>),
    /// Ordinary join into an existing cluster
    Join,
}

/// Bootstrap state machine
#[derive(Debug)]
pub struct BootstrapMachine {
    self_uri: String,
    state: Mutex<BootstrapState>,
}

impl BootstrapMachine {
    pub fn new(self_uri: impl Into<String>) -> Self {
        Self {
            self_uri: self_uri.into(),
            state: Mutex::new(BootstrapState::Unconfigured),
        }
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.lock()
    }

    pub fn is_joined(&self) -> bool {
        self.state() == BootstrapState::Joined
    }

    /// Gate a `join_server` call for `uri`
    pub fn begin_join(&self, uri: &str) -> Result<JoinMode<'_>> {
        let mut state = self.state.lock();
        match *state {
            BootstrapState::Joined => Ok(JoinMode::Join),
            BootstrapState::Bootstrapping => Err(ClusterError::BootstrapInProgress),
            BootstrapState::Unconfigured if uri != self.self_uri => {
                Err(ClusterError::BootstrapRequired {
                    self_uri: self.self_uri.clone(),
                })
            }
            BootstrapState::Unconfigured => {
                *state = BootstrapState::Bootstrapping;
                info!(uri = %uri, "Bootstrapping cluster");
                Ok(JoinMode::Bootstrap(BootstrapGuard {
                    machine: self,
                    completed: false,
                }))
            }
        }
    }

    /// Gate mutations that need a bootstrapped cluster
    pub fn require_joined(&self) -> Result<()> {
        if self.is_joined() {
            Ok(())
        } else {
            Err(ClusterError::NotBootstrapped)
        }
    }

    /// Follow a config committed locally or received from a peer
    pub fn observe(&self, config: &ClusterConfig) {
        if config.server_by_uri(&self.self_uri).is_none() {
            return;
        }
        let mut state = self.state.lock();
        if *state != BootstrapState::Joined {
            info!(version = config.version, "Joined cluster");
            *state = BootstrapState::Joined;
        }
    }
}

/// Reverts an unfinished bootstrap on drop
pub struct BootstrapGuard<'a> {
    machine: &'a BootstrapMachine,
    completed: bool,
}

impl BootstrapGuard<'_> {
    /// The seeding config is committed
    pub fn complete(mut self, config: &ClusterConfig) {
        self.completed = true;
        self.machine.observe(config);
    }
}

impl Drop for BootstrapGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let mut state = self.machine.state.lock();
            if *state == BootstrapState::Bootstrapping {
                *state = BootstrapState::Unconfigured;
            }
        }
    }
}
