//! Validation of proposed topology mutations
//!
//! Every function here is pure: it reads a committed config snapshot and a
//! liveness snapshot and either accepts the request or returns the single
//! error that terminates it. Checks run in a fixed order so callers always
//! see the same error for the same request.

use crate::error::{ClusterError, Result};
use crate::node::LivenessSnapshot;
use crate::topology::{ClusterConfig, ReplicasetId, ServerId};
use std::collections::BTreeSet;

/// Normalize and check role names
pub fn validate_roles<I, S>(roles: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for role in roles {
        let role = role.as_ref();
        let trimmed = role.trim();
        if trimmed.is_empty() || trimmed.len() != role.len() || trimmed.contains(char::is_control)
        {
            return Err(ClusterError::InvalidRole(role.to_string()));
        }
        set.insert(trimmed.to_string());
    }
    Ok(set)
}

/// Check a `join_server` request
pub fn validate_join(
    config: &ClusterConfig,
    liveness: &LivenessSnapshot,
    uri: &str,
    uuid: &ServerId,
    replicaset_uuid: &ReplicasetId,
    roles: Option<&BTreeSet<String>>,
) -> Result<()> {
    if config.servers.contains_key(uuid) || config.is_expelled(uuid) {
        return Err(ClusterError::AlreadyJoined { uuid: *uuid });
    }
    if config.server_by_uri(uri).is_some() {
        return Err(ClusterError::DuplicateUri {
            uri: uri.to_string(),
        });
    }
    if !liveness.is_alive(uri) {
        return Err(ClusterError::NotInMembership {
            uri: uri.to_string(),
        });
    }
    if let (Some(existing), Some(roles)) = (config.replicaset(replicaset_uuid), roles) {
        if existing.roles != *roles {
            return Err(ClusterError::InvalidArgument(format!(
                "Replicaset \"{}\" already exists, join_server can not change its roles",
                replicaset_uuid
            )));
        }
    }
    Ok(())
}

/// Check a `join_server` request that did not name an instance uuid.
///
/// Repeating a join for a configured uri reports the server holding it.
pub fn validate_join_uri(config: &ClusterConfig, uri: &str) -> Result<()> {
    match config.server_by_uri(uri) {
        Some(existing) => Err(ClusterError::AlreadyJoined {
            uuid: existing.uuid,
        }),
        None => Ok(()),
    }
}

/// Check an `edit_server` request
pub fn validate_edit_server(
    config: &ClusterConfig,
    liveness: &LivenessSnapshot,
    uuid: &ServerId,
    uri: Option<&str>,
) -> Result<()> {
    let server = known_server(config, uuid)?;

    if let Some(uri) = uri {
        if uri == server.uri {
            return Ok(());
        }
        if !liveness.is_alive(uri) {
            return Err(ClusterError::NotInMembership {
                uri: uri.to_string(),
            });
        }
        if config.server_by_uri(uri).is_some() {
            return Err(ClusterError::DuplicateUri {
                uri: uri.to_string(),
            });
        }
    }
    Ok(())
}

/// Check an `edit_replicaset` request
pub fn validate_edit_replicaset(
    config: &ClusterConfig,
    uuid: &ReplicasetId,
    master: Option<&ServerId>,
) -> Result<()> {
    if config.replicaset(uuid).is_none() {
        return Err(ClusterError::ReplicasetNotInConfig { uuid: *uuid });
    }
    if let Some(master) = master {
        let is_member = config
            .server(master)
            .is_some_and(|s| s.replicaset_uuid.as_ref() == Some(uuid));
        if !is_member {
            return Err(ClusterError::MasterDoesNotExist { replicaset: *uuid });
        }
    }
    Ok(())
}

/// Check an `expell_server` request
pub fn validate_expel(config: &ClusterConfig, self_uri: &str, uuid: &ServerId) -> Result<()> {
    let server = known_server(config, uuid)?;

    if server.uri == self_uri {
        return Err(ClusterError::ExpelSelf { uuid: *uuid });
    }
    if let Some(rs_uuid) = server.replicaset_uuid {
        let shared = config.members_of(&rs_uuid).len() > 1;
        let is_master = config
            .replicaset(&rs_uuid)
            .is_some_and(|rs| rs.master_uuid == *uuid);
        if shared && is_master {
            return Err(ClusterError::ExpelMaster {
                uuid: *uuid,
                replicaset: rs_uuid,
            });
        }
    }
    Ok(())
}

fn known_server<'a>(
    config: &'a ClusterConfig,
    uuid: &ServerId,
) -> Result<&'a crate::topology::Server> {
    if config.is_expelled(uuid) {
        return Err(ClusterError::Expelled { uuid: *uuid });
    }
    config
        .server(uuid)
        .ok_or(ClusterError::ServerNotInConfig { uuid: *uuid })
}
