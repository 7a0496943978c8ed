//! Typed admin API
//!
//! A closed set of requests, one per admin operation, and the views they
//! return. Transports (the HTTP adapter in `quayd`, tests) deserialize an
//! [`AdminRequest`], hand it to [`dispatch`] and render the
//! [`AdminEnvelope`].
//!
//! JSON shape of a request: `{"op": "edit_server", "uuid": "...", "uri": "..."}`.

use crate::bootstrap::BootstrapState;
use crate::controller::{ClusterHealth, Controller, JoinServer};
use crate::error::ClusterError;
use crate::node::LivenessSnapshot;
use crate::topology::{
    ClusterConfig, Replicaset, ReplicasetId, ReplicasetStatus, Server, ServerId, ServerStatus,
};
use serde::{Deserialize, Serialize};

/// `cluster.self`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfView {
    pub uri: String,
    /// None until the instance is part of a committed config
    pub uuid: Option<ServerId>,
    pub alias: Option<String>,
    pub state: BootstrapState,
}

/// A server as rendered by `servers` and inside replicasets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerView {
    pub uri: String,
    /// None for members known only to the prober
    pub uuid: Option<ServerId>,
    pub alias: Option<String>,
    pub status: ServerStatus,
    /// Replicaset the server belongs to
    pub replicaset: Option<ReplicasetSummary>,
}

impl ServerView {
    pub fn configured(config: &ClusterConfig, server: &Server, liveness: &LivenessSnapshot) -> Self {
        let replicaset = server
            .replicaset_uuid
            .and_then(|uuid| config.replicaset(&uuid))
            .map(|rs| ReplicasetSummary::build(config, rs, liveness));
        Self {
            uri: server.uri.clone(),
            uuid: Some(server.uuid),
            alias: server.alias.clone(),
            status: config.server_status(server, liveness),
            replicaset,
        }
    }

    /// A member the prober sees that no committed config contains
    pub fn unconfigured(uri: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            uuid: None,
            alias,
            status: ServerStatus::Unconfigured,
            replicaset: None,
        }
    }
}

/// Replicaset fields nested into a [`ServerView`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasetSummary {
    pub uuid: ReplicasetId,
    pub roles: Vec<String>,
    pub status: ReplicasetStatus,
}

impl ReplicasetSummary {
    pub fn build(config: &ClusterConfig, replicaset: &Replicaset, liveness: &LivenessSnapshot) -> Self {
        Self {
            uuid: replicaset.uuid,
            roles: replicaset.roles.iter().cloned().collect(),
            status: config.replicaset_status(&replicaset.uuid, liveness),
        }
    }
}

/// `replicasets`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasetView {
    pub uuid: ReplicasetId,
    /// Sorted role names
    pub roles: Vec<String>,
    pub status: ReplicasetStatus,
    pub master: ServerView,
    /// Members sorted by uri
    pub servers: Vec<ServerView>,
}

impl ReplicasetView {
    pub fn build(config: &ClusterConfig, replicaset: &Replicaset, liveness: &LivenessSnapshot) -> Self {
        let servers: Vec<ServerView> = config
            .members_of(&replicaset.uuid)
            .into_iter()
            .map(|s| ServerView::configured(config, s, liveness))
            .collect();
        // Invariants guarantee the master is a member
        let master = servers
            .iter()
            .find(|s| s.uuid == Some(replicaset.master_uuid))
            .cloned()
            .unwrap_or_else(|| ServerView {
                uri: String::new(),
                uuid: Some(replicaset.master_uuid),
                alias: None,
                status: ServerStatus::Unreachable,
                replicaset: None,
            });
        let summary = ReplicasetSummary::build(config, replicaset, liveness);

        Self {
            uuid: summary.uuid,
            roles: summary.roles,
            status: summary.status,
            master,
            servers,
        }
    }
}

/// `cluster.health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub status: &'static str,
    #[serde(flatten)]
    pub health: ClusterHealth,
}

impl From<ClusterHealth> for HealthView {
    fn from(health: ClusterHealth) -> Self {
        Self {
            status: health.status(),
            health,
        }
    }
}

/// Admin operations
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op")]
pub enum AdminRequest {
    // ==================== Queries ====================
    #[serde(rename = "cluster.self")]
    ClusterSelf,

    /// Reads the flag without `enabled`, writes it with
    #[serde(rename = "cluster.failover")]
    Failover { enabled: Option<bool> },

    #[serde(rename = "cluster.health")]
    Health,

    #[serde(rename = "cluster.config_version")]
    ConfigVersion,

    #[serde(rename = "servers")]
    Servers,

    #[serde(rename = "replicasets")]
    Replicasets { uuid: Option<ReplicasetId> },

    // ==================== Mutations ====================
    #[serde(rename = "probe_server")]
    ProbeServer { uri: String },

    #[serde(rename = "join_server")]
    JoinServer {
        uri: String,
        instance_uuid: Option<ServerId>,
        replicaset_uuid: Option<ReplicasetId>,
        roles: Option<Vec<String>>,
    },

    #[serde(rename = "edit_server")]
    EditServer { uuid: ServerId, uri: Option<String> },

    #[serde(rename = "edit_replicaset")]
    EditReplicaset {
        uuid: ReplicasetId,
        roles: Option<Vec<String>>,
        master: Option<ServerId>,
    },

    #[serde(rename = "expell_server")]
    ExpellServer { uuid: ServerId },
}

impl AdminRequest {
    /// Operation name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            AdminRequest::ClusterSelf => "cluster.self",
            AdminRequest::Failover { .. } => "cluster.failover",
            AdminRequest::Health => "cluster.health",
            AdminRequest::ConfigVersion => "cluster.config_version",
            AdminRequest::Servers => "servers",
            AdminRequest::Replicasets { .. } => "replicasets",
            AdminRequest::ProbeServer { .. } => "probe_server",
            AdminRequest::JoinServer { .. } => "join_server",
            AdminRequest::EditServer { .. } => "edit_server",
            AdminRequest::EditReplicaset { .. } => "edit_replicaset",
            AdminRequest::ExpellServer { .. } => "expell_server",
        }
    }
}

/// Successful result of an admin operation
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AdminResponse {
    SelfInfo(SelfView),
    Health(HealthView),
    Servers(Vec<ServerView>),
    Replicasets(Vec<ReplicasetView>),
    ConfigVersion(u64),
    /// Failover flag, or `true` for completed mutations
    Flag(bool),
}

/// One error entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminError {
    pub message: String,
}

impl From<&ClusterError> for AdminError {
    fn from(err: &ClusterError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// `{"data": ...}` on success, `{"errors": [{"message": ...}]}` on failure
#[derive(Debug, Clone, Serialize)]
pub struct AdminEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<AdminResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<AdminError>>,
}

impl AdminEnvelope {
    pub fn ok(data: AdminResponse) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: Some(vec![AdminError {
                message: message.into(),
            }]),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_none()
    }
}

impl From<Result<AdminResponse, ClusterError>> for AdminEnvelope {
    fn from(result: Result<AdminResponse, ClusterError>) -> Self {
        match result {
            Ok(data) => AdminEnvelope::ok(data),
            Err(e) => AdminEnvelope {
                data: None,
                errors: Some(vec![AdminError::from(&e)]),
            },
        }
    }
}

/// Execute one admin request against `controller`
pub async fn dispatch(
    controller: &Controller,
    request: AdminRequest,
) -> Result<AdminResponse, ClusterError> {
    let response = match request {
        AdminRequest::ClusterSelf => AdminResponse::SelfInfo(controller.self_info()),
        AdminRequest::Failover { enabled: None } => {
            AdminResponse::Flag(controller.failover_enabled())
        }
        AdminRequest::Failover {
            enabled: Some(enabled),
        } => AdminResponse::Flag(controller.set_failover(enabled).await?),
        AdminRequest::Health => AdminResponse::Health(controller.health().into()),
        AdminRequest::ConfigVersion => AdminResponse::ConfigVersion(controller.config_version()),
        AdminRequest::Servers => AdminResponse::Servers(controller.servers()),
        AdminRequest::Replicasets { uuid } => {
            AdminResponse::Replicasets(controller.replicasets(uuid))
        }
        AdminRequest::ProbeServer { uri } => {
            controller.probe_server(&uri).await?;
            AdminResponse::Flag(true)
        }
        AdminRequest::JoinServer {
            uri,
            instance_uuid,
            replicaset_uuid,
            roles,
        } => {
            controller
                .join_server(JoinServer {
                    uri,
                    instance_uuid,
                    replicaset_uuid,
                    roles,
                })
                .await?;
            AdminResponse::Flag(true)
        }
        AdminRequest::EditServer { uuid, uri } => {
            controller.edit_server(uuid, uri).await?;
            AdminResponse::Flag(true)
        }
        AdminRequest::EditReplicaset {
            uuid,
            roles,
            master,
        } => {
            controller.edit_replicaset(uuid, roles, master).await?;
            AdminResponse::Flag(true)
        }
        AdminRequest::ExpellServer { uuid } => {
            controller.expell_server(uuid).await?;
            AdminResponse::Flag(true)
        }
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Liveness;
    use crate::topology::TopologyCommand;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    #[test]
    fn test_request_parsing() {
        let request: AdminRequest = serde_json::from_str(r#"{"op": "cluster.self"}"#).unwrap();
        assert_eq!(request, AdminRequest::ClusterSelf);

        let request: AdminRequest =
            serde_json::from_str(r#"{"op": "cluster.failover", "enabled": true}"#).unwrap();
        assert_eq!(
            request,
            AdminRequest::Failover {
                enabled: Some(true)
            }
        );

        let request: AdminRequest = serde_json::from_str(r#"{"op": "replicasets"}"#).unwrap();
        assert_eq!(request, AdminRequest::Replicasets { uuid: None });

        let request: AdminRequest = serde_json::from_str(
            r#"{"op": "join_server", "uri": "localhost:33002",
                "instance_uuid": "bbbbbbbb-bbbb-4000-b000-000000000001",
                "roles": ["vshard-storage"]}"#,
        )
        .unwrap();
        match request {
            AdminRequest::JoinServer {
                uri,
                instance_uuid,
                replicaset_uuid,
                roles,
            } => {
                assert_eq!(uri, "localhost:33002");
                assert!(instance_uuid.is_some());
                assert!(replicaset_uuid.is_none());
                assert_eq!(roles, Some(vec!["vshard-storage".to_string()]));
            }
            other => panic!("unexpected request {:?}", other),
        }

        assert!(serde_json::from_str::<AdminRequest>(r#"{"op": "drop_database"}"#).is_err());
    }

    #[test]
    fn test_replicaset_view() {
        let rs = Uuid::from_u128(100);
        let mut config = ClusterConfig::new();
        for (n, roles) in [(2u128, vec!["vshard-storage"]), (1, vec![])] {
            config = config
                .apply(&TopologyCommand::JoinServer {
                    uuid: Uuid::from_u128(n),
                    uri: format!("localhost:3300{}", n),
                    alias: Some(format!("storage-{}", n)),
                    replicaset_uuid: rs,
                    roles: roles.into_iter().map(String::from).collect::<BTreeSet<_>>(),
                })
                .unwrap();
        }
        let liveness = LivenessSnapshot::from_pairs([("localhost:33002", Liveness::Alive)]);

        let view = ReplicasetView::build(&config, config.replicaset(&rs).unwrap(), &liveness);
        assert_eq!(view.roles, vec!["vshard-storage"]);
        assert_eq!(view.status, ReplicasetStatus::Degraded);
        assert_eq!(view.master.uuid, Some(Uuid::from_u128(2)));
        assert_eq!(view.master.status, ServerStatus::Healthy);
        let uris: Vec<&str> = view.servers.iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(uris, vec!["localhost:33001", "localhost:33002"]);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["servers"][0]["status"], "unreachable");
        assert_eq!(json["servers"][0]["replicaset"]["uuid"], rs.to_string());
        assert_eq!(json["servers"][0]["replicaset"]["status"], "degraded");
        assert_eq!(json["servers"][0]["replicaset"]["roles"], serde_json::json!(["vshard-storage"]));
    }

    #[test]
    fn test_envelope_rendering() {
        let ok = AdminEnvelope::ok(AdminResponse::Flag(true));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"data":true}"#
        );

        let err: AdminEnvelope = Err(ClusterError::NotBootstrapped).into();
        assert!(!err.is_ok());
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"errors":[{"message":"Not bootstrapped yet"}]}"#
        );
    }
}
