//! Cluster topology: servers, replicasets and the versioned config
//!
//! A [`ClusterConfig`] is the unit propagated by the two-phase applier.
//! Mutations are expressed as [`TopologyCommand`]s; applying a command never
//! touches the receiver, it produces the next candidate version.
//!
//! Invariants of every committed config:
//! - a server's replicaset exists
//! - a replicaset's master is one of its members (so no replicaset is empty)
//! - server uris are unique
//! - expelled uuids never reappear as servers
//! - versions strictly increase

use crate::error::{ClusterError, Result};
use crate::node::LivenessSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// Server identity
pub type ServerId = Uuid;

/// Replicaset identity
pub type ReplicasetId = Uuid;

/// A configured server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub uuid: ServerId,
    /// Advertised `host:port`
    pub uri: String,
    /// Display name
    pub alias: Option<String>,
    /// Owning replicaset (None = known but unassigned)
    pub replicaset_uuid: Option<ReplicasetId>,
}

/// A group of servers sharing one data partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replicaset {
    pub uuid: ReplicasetId,
    /// Role names, kept sorted and unique
    pub roles: BTreeSet<String>,
    /// Designated master, always a member
    pub master_uuid: ServerId,
}

/// Derived server status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Configured and alive
    Healthy,
    /// Configured but not answering probes
    Unreachable,
    /// Known to the prober only
    Unconfigured,
}

/// Derived replicaset status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicasetStatus {
    /// Every member alive
    Healthy,
    /// Some members alive
    Degraded,
    /// No member alive
    Unreachable,
}

/// Topology mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyCommand {
    /// Admit a server, creating its replicaset when it does not exist yet.
    /// On an empty config this is the bootstrap of the first server.
    JoinServer {
        uuid: ServerId,
        uri: String,
        alias: Option<String>,
        replicaset_uuid: ReplicasetId,
        roles: BTreeSet<String>,
    },

    /// Move a server to a new uri
    EditServer { uuid: ServerId, uri: Option<String> },

    /// Change roles and/or master of a replicaset
    EditReplicaset {
        uuid: ReplicasetId,
        roles: Option<BTreeSet<String>>,
        master: Option<ServerId>,
    },

    /// Remove a server permanently
    ExpelServer { uuid: ServerId },

    /// Toggle automatic master reassignment
    SetFailover { enabled: bool },
}

impl TopologyCommand {
    /// Short operation name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            TopologyCommand::JoinServer { .. } => "join_server",
            TopologyCommand::EditServer { .. } => "edit_server",
            TopologyCommand::EditReplicaset { .. } => "edit_replicaset",
            TopologyCommand::ExpelServer { .. } => "expell_server",
            TopologyCommand::SetFailover { .. } => "set_failover",
        }
    }
}

/// Versioned cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    /// Strictly increasing with every commit
    pub version: u64,

    /// Configured servers
    pub servers: BTreeMap<ServerId, Server>,

    /// Replicasets
    pub replicasets: BTreeMap<ReplicasetId, Replicaset>,

    /// Identities removed by `expell_server`
    pub expelled: BTreeSet<ServerId>,

    /// Automatic master reassignment
    pub failover_enabled: bool,

    /// Set once the first server joined
    pub bootstrapped: bool,
}

impl ClusterConfig {
    /// Create the empty, unbootstrapped config
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next version with `cmd` applied.
    ///
    /// Structural preconditions are re-checked here; the validator reports
    /// them to callers with richer context before this is reached.
    pub fn apply(&self, cmd: &TopologyCommand) -> Result<ClusterConfig> {
        let mut next = self.clone();
        next.version = self.version + 1;

        match cmd {
            TopologyCommand::JoinServer {
                uuid,
                uri,
                alias,
                replicaset_uuid,
                roles,
            } => next.join_server(*uuid, uri, alias.clone(), *replicaset_uuid, roles)?,
            TopologyCommand::EditServer { uuid, uri } => next.edit_server(*uuid, uri.as_deref())?,
            TopologyCommand::EditReplicaset {
                uuid,
                roles,
                master,
            } => next.edit_replicaset(*uuid, roles.as_ref(), *master)?,
            TopologyCommand::ExpelServer { uuid } => next.expel_server(*uuid)?,
            TopologyCommand::SetFailover { enabled } => next.failover_enabled = *enabled,
        }

        next.check_invariants()?;
        Ok(next)
    }

    fn join_server(
        &mut self,
        uuid: ServerId,
        uri: &str,
        alias: Option<String>,
        replicaset_uuid: ReplicasetId,
        roles: &BTreeSet<String>,
    ) -> Result<()> {
        if self.servers.contains_key(&uuid) || self.expelled.contains(&uuid) {
            return Err(ClusterError::AlreadyJoined { uuid });
        }

        self.servers.insert(
            uuid,
            Server {
                uuid,
                uri: uri.to_string(),
                alias,
                replicaset_uuid: Some(replicaset_uuid),
            },
        );
        self.replicasets
            .entry(replicaset_uuid)
            .or_insert_with(|| Replicaset {
                uuid: replicaset_uuid,
                roles: roles.clone(),
                master_uuid: uuid,
            });
        self.bootstrapped = true;
        Ok(())
    }

    fn edit_server(&mut self, uuid: ServerId, uri: Option<&str>) -> Result<()> {
        let server = self
            .servers
            .get_mut(&uuid)
            .ok_or(ClusterError::ServerNotInConfig { uuid })?;
        if let Some(uri) = uri {
            server.uri = uri.to_string();
        }
        Ok(())
    }

    fn edit_replicaset(
        &mut self,
        uuid: ReplicasetId,
        roles: Option<&BTreeSet<String>>,
        master: Option<ServerId>,
    ) -> Result<()> {
        let replicaset = self
            .replicasets
            .get_mut(&uuid)
            .ok_or(ClusterError::ReplicasetNotInConfig { uuid })?;
        if let Some(roles) = roles {
            replicaset.roles = roles.clone();
        }
        if let Some(master) = master {
            replicaset.master_uuid = master;
        }
        Ok(())
    }

    fn expel_server(&mut self, uuid: ServerId) -> Result<()> {
        let server = self
            .servers
            .remove(&uuid)
            .ok_or(ClusterError::ServerNotInConfig { uuid })?;
        self.expelled.insert(uuid);

        if let Some(rs_uuid) = server.replicaset_uuid {
            let remaining = self
                .servers
                .values()
                .filter(|s| s.replicaset_uuid == Some(rs_uuid))
                .count();
            if remaining == 0 {
                self.replicasets.remove(&rs_uuid);
            } else if self
                .replicasets
                .get(&rs_uuid)
                .is_some_and(|rs| rs.master_uuid == uuid)
            {
                return Err(ClusterError::ExpelMaster {
                    uuid,
                    replicaset: rs_uuid,
                });
            }
        }
        Ok(())
    }

    /// Verify the structural invariants
    pub fn check_invariants(&self) -> Result<()> {
        let mut uris = HashSet::with_capacity(self.servers.len());

        for (key, server) in &self.servers {
            if *key != server.uuid {
                return Err(ClusterError::InvalidTopology(format!(
                    "server key {} does not match uuid {}",
                    key, server.uuid
                )));
            }
            if !uris.insert(server.uri.as_str()) {
                return Err(ClusterError::DuplicateUri {
                    uri: server.uri.clone(),
                });
            }
            if self.expelled.contains(&server.uuid) {
                return Err(ClusterError::InvalidTopology(format!(
                    "server {} is both configured and expelled",
                    server.uuid
                )));
            }
            if let Some(rs) = server.replicaset_uuid {
                if !self.replicasets.contains_key(&rs) {
                    return Err(ClusterError::InvalidTopology(format!(
                        "server {} refers to missing replicaset {}",
                        server.uuid, rs
                    )));
                }
            }
        }

        for (key, replicaset) in &self.replicasets {
            if *key != replicaset.uuid {
                return Err(ClusterError::InvalidTopology(format!(
                    "replicaset key {} does not match uuid {}",
                    key, replicaset.uuid
                )));
            }
            let master_ok = self
                .servers
                .get(&replicaset.master_uuid)
                .is_some_and(|s| s.replicaset_uuid == Some(replicaset.uuid));
            if !master_ok {
                return Err(ClusterError::MasterDoesNotExist {
                    replicaset: replicaset.uuid,
                });
            }
        }

        Ok(())
    }

    /// Verify that the local instance is present exactly once
    pub fn check_self(&self, self_uri: &str) -> Result<()> {
        if self.bootstrapped && self.server_by_uri(self_uri).is_none() {
            return Err(ClusterError::InvalidTopology(format!(
                "local instance \"{}\" is missing from the config",
                self_uri
            )));
        }
        Ok(())
    }

    // ==================== Query Methods ====================

    /// Get server by uuid
    pub fn server(&self, uuid: &ServerId) -> Option<&Server> {
        self.servers.get(uuid)
    }

    /// Get server by advertised uri
    pub fn server_by_uri(&self, uri: &str) -> Option<&Server> {
        self.servers.values().find(|s| s.uri == uri)
    }

    /// Get replicaset by uuid
    pub fn replicaset(&self, uuid: &ReplicasetId) -> Option<&Replicaset> {
        self.replicasets.get(uuid)
    }

    /// Check if a uuid was expelled
    pub fn is_expelled(&self, uuid: &ServerId) -> bool {
        self.expelled.contains(uuid)
    }

    /// Members of a replicaset, sorted by uri
    pub fn members_of(&self, replicaset: &ReplicasetId) -> Vec<&Server> {
        let mut members: Vec<&Server> = self
            .servers
            .values()
            .filter(|s| s.replicaset_uuid.as_ref() == Some(replicaset))
            .collect();
        members.sort_by(|a, b| a.uri.cmp(&b.uri));
        members
    }

    /// Replicasets whose master has the given uri
    pub fn replicasets_mastered_by(&self, uri: &str) -> Vec<&Replicaset> {
        match self.server_by_uri(uri) {
            Some(server) => self
                .replicasets
                .values()
                .filter(|rs| rs.master_uuid == server.uuid)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Derived status of a configured server
    pub fn server_status(&self, server: &Server, liveness: &LivenessSnapshot) -> ServerStatus {
        if liveness.is_alive(&server.uri) {
            ServerStatus::Healthy
        } else {
            ServerStatus::Unreachable
        }
    }

    /// Derived status of a replicaset
    pub fn replicaset_status(
        &self,
        replicaset: &ReplicasetId,
        liveness: &LivenessSnapshot,
    ) -> ReplicasetStatus {
        let members = self.members_of(replicaset);
        let alive = members
            .iter()
            .filter(|s| liveness.is_alive(&s.uri))
            .count();
        if !members.is_empty() && alive == members.len() {
            ReplicasetStatus::Healthy
        } else if alive > 0 {
            ReplicasetStatus::Degraded
        } else {
            ReplicasetStatus::Unreachable
        }
    }

    /// Serialize for transfer
    pub fn serialize(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| ClusterError::Serialization(e.to_string()))
    }

    /// Deserialize from transfer
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| ClusterError::Deserialization(e.to_string()))
    }
}

/// Build a role set from a list of names
pub fn role_set<I, S>(roles: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    roles.into_iter().map(Into::into).collect()
}
