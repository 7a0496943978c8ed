//! Cluster controller
//!
//! One `Controller` owns the topology store, the prober, the transport and
//! the background tasks of a single instance. Several controllers can run in
//! one process; each binds its own cluster address.
//!
//! Mutations are serialised by an async mutex around validate + apply.
//! Reads take snapshots and never wait for a mutation.

use crate::api::{ReplicasetView, SelfView, ServerView};
use crate::applier::{ConfigPeer, TwoPhaseApplier};
use crate::bootstrap::{BootstrapMachine, BootstrapState, JoinMode};
use crate::config::ControllerConfig;
use crate::error::{ClusterError, Result};
use crate::failover::{self, ElectionPolicy, FailoverController, LowestUuid};
use crate::membership::{MembershipEvent, Prober};
use crate::node::LivenessSnapshot;
use crate::observability::{ApplyMetrics, TopologyMetrics};
use crate::protocol::{ClusterRequest, ClusterResponse, ResponseHeader};
use crate::store::TopologyStore;
use crate::topology::{
    ClusterConfig, ReplicasetId, ReplicasetStatus, ServerId, TopologyCommand,
};
use crate::transport::{RequestHandler, Transport};
use crate::validator;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Arguments of `join_server`
#[derive(Debug, Clone, Default)]
pub struct JoinServer {
    pub uri: String,
    pub instance_uuid: Option<ServerId>,
    pub replicaset_uuid: Option<ReplicasetId>,
    pub roles: Option<Vec<String>>,
}

impl JoinServer {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn instance_uuid(mut self, uuid: ServerId) -> Self {
        self.instance_uuid = Some(uuid);
        self
    }

    pub fn replicaset_uuid(mut self, uuid: ReplicasetId) -> Self {
        self.replicaset_uuid = Some(uuid);
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }
}

/// Aggregate health of the cluster as seen from this instance
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub state: BootstrapState,
    pub config_version: u64,
    pub servers_total: usize,
    pub servers_alive: usize,
    pub replicasets_total: usize,
    pub replicasets_healthy: usize,
    pub failover_enabled: bool,
}

impl ClusterHealth {
    /// Check if cluster is healthy
    pub fn is_healthy(&self) -> bool {
        self.state == BootstrapState::Joined
            && self.servers_alive == self.servers_total
            && self.replicasets_healthy == self.replicasets_total
    }

    /// Get health status string
    pub fn status(&self) -> &'static str {
        if self.state != BootstrapState::Joined {
            "unconfigured"
        } else if self.is_healthy() {
            "healthy"
        } else if self.servers_alive > 0 {
            "degraded"
        } else {
            "unreachable"
        }
    }
}

/// State shared with the transport handler and background tasks
struct LocalNode {
    uri: String,
    store: Arc<TopologyStore>,
    prober: Arc<Prober>,
    bootstrap: BootstrapMachine,
    /// Server uris of the last config followed
    configured_uris: Mutex<BTreeSet<String>>,
}

impl LocalNode {
    /// Follow a config that became visible locally
    fn on_committed(&self, config: &ClusterConfig) {
        self.prober.set_config_version(config.version);
        let uris: BTreeSet<String> = config.servers.values().map(|s| s.uri.clone()).collect();
        for uri in uris.iter().filter(|uri| **uri != self.uri) {
            self.prober.track(uri);
        }
        // Expelled servers and replaced uris
        let previous = std::mem::replace(&mut *self.configured_uris.lock(), uris.clone());
        for uri in previous.difference(&uris) {
            self.prober.forget(uri);
        }
        self.bootstrap.observe(config);
        TopologyMetrics::set_config_version(config.version);
        TopologyMetrics::set_counts(config.servers.len(), config.replicasets.len());
    }

    /// Receiving side of the cluster protocol
    fn handle_request(&self, request: ClusterRequest) -> ClusterResponse {
        let correlation_id = request.header().correlation_id;
        let source = request.header().source.clone();
        let result = match request {
            ClusterRequest::Prepare { config, .. } => {
                let version = config.version;
                self.store
                    .prepare(config, &source)
                    .map(|()| ClusterResponse::Prepared {
                        header: ResponseHeader::success(correlation_id),
                        version,
                    })
            }
            ClusterRequest::Commit { version, .. } => {
                self.store.commit_prepared(version, &source).map(|committed| {
                    self.on_committed(&committed);
                    ClusterResponse::Committed {
                        header: ResponseHeader::success(correlation_id),
                        version,
                    }
                })
            }
            ClusterRequest::Abort { version, .. } => {
                self.store.abort_prepared(version, &source);
                Ok(ClusterResponse::Aborted {
                    header: ResponseHeader::success(correlation_id),
                    version,
                })
            }
            ClusterRequest::FetchConfig { .. } => Ok(ClusterResponse::Config {
                header: ResponseHeader::success(correlation_id),
                config: (*self.store.snapshot()).clone(),
            }),
        };

        result.unwrap_or_else(|e| {
            warn!(source = %source, error = %e, "Rejected cluster request");
            ClusterResponse::rejected(correlation_id, &e)
        })
    }
}

/// Controller of one cluster instance
pub struct Controller {
    config: ControllerConfig,
    local: Arc<LocalNode>,
    transport: Arc<Transport>,
    applier: TwoPhaseApplier,
    failover: FailoverController,
    cluster_addr: SocketAddr,

    /// Serialises validate + apply
    mutation: tokio::sync::Mutex<()>,

    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Bind the cluster address and start background tasks
    pub async fn start(config: ControllerConfig) -> Result<Arc<Self>> {
        Self::start_with_policy(config, Box::new(LowestUuid)).await
    }

    /// Same as [`Controller::start`] with a custom failover election policy
    pub async fn start_with_policy(
        mut config: ControllerConfig,
        policy: Box<dyn ElectionPolicy>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(ClusterError::InvalidArgument)?;

        let (listener, cluster_addr) = bind_cluster_addr(config.cluster_addr).await?;
        if let Some(host) = config.advertise_uri.strip_suffix(":0") {
            config.advertise_uri = format!("{}:{}", host, cluster_addr.port());
        }
        let uri = config.advertise_uri.clone();

        let prober = Arc::new(
            Prober::bind(cluster_addr, uri.clone(), config.alias.clone(), config.probe.clone())
                .await?,
        );
        let store = Arc::new(TopologyStore::new(
            config.apply.prepare_timeout * 2 + config.apply.commit_timeout,
        ));
        let local = Arc::new(LocalNode {
            uri: uri.clone(),
            store: store.clone(),
            prober: prober.clone(),
            bootstrap: BootstrapMachine::new(uri.clone()),
            configured_uris: Mutex::new(BTreeSet::new()),
        });

        let transport = Arc::new(Transport::new(uri.clone(), config.transport.clone()));
        let peer: Arc<dyn ConfigPeer> = transport.clone();
        let applier = TwoPhaseApplier::new(uri.clone(), store, peer, config.apply.clone());

        let (shutdown_tx, _) = broadcast::channel(4);

        let controller = Arc::new(Self {
            config,
            local: local.clone(),
            transport: transport.clone(),
            applier,
            failover: FailoverController::new(policy),
            cluster_addr,
            mutation: tokio::sync::Mutex::new(()),
            shutdown_tx: shutdown_tx.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let handler_node = local.clone();
        let handler: RequestHandler = Arc::new(move |request| handler_node.handle_request(request));

        let mut tasks = vec![
            prober.start(shutdown_tx.subscribe()),
            transport.serve(listener, handler, shutdown_tx.subscribe()),
        ];
        tasks.push(tokio::spawn(failover::run_watcher(
            Arc::downgrade(&controller),
            prober.subscribe(),
            shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(run_catch_up(
            Arc::downgrade(&controller),
            prober.subscribe(),
            shutdown_tx.subscribe(),
        )));
        *controller.tasks.lock() = tasks;

        info!(uri = %uri, addr = %cluster_addr, "Controller started");
        Ok(controller)
    }

    /// Advertised uri of this instance
    pub fn uri(&self) -> &str {
        &self.local.uri
    }

    /// Bound cluster address
    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    /// Controller configuration
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Current bootstrap state
    pub fn bootstrap_state(&self) -> BootstrapState {
        self.local.bootstrap.state()
    }

    /// Committed config snapshot
    pub fn snapshot(&self) -> Arc<ClusterConfig> {
        self.local.store.snapshot()
    }

    /// Membership prober
    pub fn prober(&self) -> &Arc<Prober> {
        &self.local.prober
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.local.prober.subscribe()
    }

    // ==================== Queries ====================

    /// `cluster.self`
    pub fn self_info(&self) -> SelfView {
        let snapshot = self.snapshot();
        let configured = match self.bootstrap_state() {
            BootstrapState::Joined => snapshot.server_by_uri(self.uri()),
            _ => None,
        };
        SelfView {
            uri: self.uri().to_string(),
            uuid: configured.map(|s| s.uuid),
            alias: self.config.alias.clone(),
            state: self.bootstrap_state(),
        }
    }

    /// `cluster.failover`, false until bootstrapped
    pub fn failover_enabled(&self) -> bool {
        self.local.bootstrap.is_joined() && self.snapshot().failover_enabled
    }

    /// `cluster.config_version`
    pub fn config_version(&self) -> u64 {
        self.local.store.version()
    }

    /// `servers`: configured servers plus alive unconfigured members, by uri
    pub fn servers(&self) -> Vec<ServerView> {
        let liveness = self.local.prober.snapshot();

        if !self.local.bootstrap.is_joined() {
            return vec![ServerView::unconfigured(self.uri(), self.config.alias.clone())];
        }

        let snapshot = self.snapshot();
        let mut views: Vec<ServerView> = snapshot
            .servers
            .values()
            .map(|s| ServerView::configured(&snapshot, s, &liveness))
            .collect();

        for member in self.local.prober.members() {
            if member.is_alive() && snapshot.server_by_uri(&member.uri).is_none() {
                views.push(ServerView::unconfigured(member.uri, member.alias));
            }
        }
        views.sort_by(|a, b| a.uri.cmp(&b.uri));
        views
    }

    /// `replicasets(uuid?)`
    pub fn replicasets(&self, uuid: Option<ReplicasetId>) -> Vec<ReplicasetView> {
        if !self.local.bootstrap.is_joined() {
            return Vec::new();
        }
        let snapshot = self.snapshot();
        let liveness = self.local.prober.snapshot();
        snapshot
            .replicasets
            .values()
            .filter(|rs| uuid.map_or(true, |u| rs.uuid == u))
            .map(|rs| ReplicasetView::build(&snapshot, rs, &liveness))
            .collect()
    }

    /// `cluster.health`
    pub fn health(&self) -> ClusterHealth {
        let snapshot = self.snapshot();
        let liveness = self.local.prober.snapshot();
        let state = self.bootstrap_state();
        let joined = state == BootstrapState::Joined;

        let (servers_total, servers_alive, replicasets_total, replicasets_healthy) = if joined {
            (
                snapshot.servers.len(),
                snapshot
                    .servers
                    .values()
                    .filter(|s| liveness.is_alive(&s.uri))
                    .count(),
                snapshot.replicasets.len(),
                snapshot
                    .replicasets
                    .keys()
                    .filter(|rs| snapshot.replicaset_status(rs, &liveness) == ReplicasetStatus::Healthy)
                    .count(),
            )
        } else {
            (0, 0, 0, 0)
        };

        ClusterHealth {
            state,
            config_version: snapshot.version,
            servers_total,
            servers_alive,
            replicasets_total,
            replicasets_healthy,
            failover_enabled: joined && snapshot.failover_enabled,
        }
    }

    // ==================== Mutations ====================

    /// `probe_server(uri)`
    pub async fn probe_server(&self, uri: &str) -> Result<()> {
        self.local.prober.probe(uri).await
    }

    /// `join_server(uri, instance_uuid?, replicaset_uuid?, roles?)`
    pub async fn join_server(&self, args: JoinServer) -> Result<()> {
        let roles = args
            .roles
            .as_ref()
            .map(validator::validate_roles)
            .transpose()?;
        let uuid_given = args.instance_uuid.is_some();
        let uuid = args.instance_uuid.unwrap_or_else(Uuid::new_v4);
        let replicaset_uuid = args.replicaset_uuid.unwrap_or_else(Uuid::new_v4);

        let alias = if args.uri == self.uri() {
            self.config.alias.clone()
        } else {
            self.local
                .prober
                .member(&args.uri)
                .and_then(|m| m.alias)
        };
        let uri = args.uri;

        let build = |config: &ClusterConfig, liveness: &LivenessSnapshot| {
            if !uuid_given {
                validator::validate_join_uri(config, &uri)?;
            }
            validator::validate_join(config, liveness, &uri, &uuid, &replicaset_uuid, roles.as_ref())?;
            Ok(TopologyCommand::JoinServer {
                uuid,
                uri: uri.clone(),
                alias: alias.clone(),
                replicaset_uuid,
                roles: roles.clone().unwrap_or_default(),
            })
        };

        match self.local.bootstrap.begin_join(&uri)? {
            JoinMode::Bootstrap(guard) => {
                let committed = self.propose("join_server", build).await?;
                guard.complete(&committed);
                Ok(())
            }
            JoinMode::Join => self.propose("join_server", build).await.map(|_| ()),
        }
    }

    /// `edit_server(uuid, uri?)`
    pub async fn edit_server(&self, uuid: ServerId, uri: Option<String>) -> Result<()> {
        self.local.bootstrap.require_joined()?;
        self.propose("edit_server", |config, liveness| {
            validator::validate_edit_server(config, liveness, &uuid, uri.as_deref())?;
            Ok(TopologyCommand::EditServer {
                uuid,
                uri: uri.clone(),
            })
        })
        .await
        .map(|_| ())
    }

    /// `edit_replicaset(uuid, roles?, master?)`
    pub async fn edit_replicaset(
        &self,
        uuid: ReplicasetId,
        roles: Option<Vec<String>>,
        master: Option<ServerId>,
    ) -> Result<()> {
        self.local.bootstrap.require_joined()?;
        self.propose("edit_replicaset", |config, _| {
            validator::validate_edit_replicaset(config, &uuid, master.as_ref())?;
            let roles = roles
                .as_ref()
                .map(validator::validate_roles)
                .transpose()?;
            Ok(TopologyCommand::EditReplicaset {
                uuid,
                roles,
                master,
            })
        })
        .await
        .map(|_| ())
    }

    /// `expell_server(uuid)`
    pub async fn expell_server(&self, uuid: ServerId) -> Result<()> {
        self.local.bootstrap.require_joined()?;
        let self_uri = self.uri().to_string();
        self.propose("expell_server", |config, _| {
            validator::validate_expel(config, &self_uri, &uuid)?;
            Ok(TopologyCommand::ExpelServer { uuid })
        })
        .await
        .map(|_| ())
    }

    /// `cluster.failover(enabled)`
    pub async fn set_failover(&self, enabled: bool) -> Result<bool> {
        self.local.bootstrap.require_joined()?;
        self.propose("set_failover", |_, _| Ok(TopologyCommand::SetFailover { enabled }))
            .await
            .map(|committed| committed.failover_enabled)
    }

    /// Validate, build the candidate and run the two-phase apply
    async fn propose<F>(&self, operation: &'static str, build: F) -> Result<Arc<ClusterConfig>>
    where
        F: FnOnce(&ClusterConfig, &LivenessSnapshot) -> Result<TopologyCommand>,
    {
        let _mutation = self.mutation.lock().await;
        let snapshot = self.local.store.snapshot();
        let liveness = self.local.prober.snapshot();

        let command = build(&snapshot, &liveness).inspect_err(|e| {
            ApplyMetrics::increment_rejected(operation);
            debug!(operation, error = %e, "Mutation rejected");
        })?;
        let candidate = snapshot.apply(&command)?;
        candidate.check_self(self.uri())?;

        let committed = self.applier.apply(operation, candidate, &liveness).await?;
        self.local.on_committed(&committed);
        Ok(committed)
    }

    /// Master changes this instance should propose after `dead_uri` died
    pub(crate) fn plan_failover(&self, dead_uri: &str) -> Vec<(ReplicasetId, ServerId)> {
        if !self.local.bootstrap.is_joined() {
            return Vec::new();
        }
        let snapshot = self.snapshot();
        let liveness = self.local.prober.snapshot();
        self.failover.plan(&snapshot, &liveness, dead_uri, self.uri())
    }

    /// Adopt a newer config from `uri`
    async fn catch_up(&self, uri: &str, version: u64) -> Result<()> {
        if !self.local.bootstrap.is_joined() || version <= self.config_version() {
            return Ok(());
        }
        let config = self
            .transport
            .fetch_config(uri, self.config.apply.commit_timeout)
            .await?;
        if let Some(installed) = self.local.store.install(config)? {
            self.local.on_committed(&installed);
        }
        Ok(())
    }

    /// Stop background tasks
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.transport.shutdown();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        info!(uri = %self.uri(), "Controller stopped");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Fetch newer configs announced by peers
async fn run_catch_up(
    controller: Weak<Controller>,
    mut events: broadcast::Receiver<MembershipEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.recv() => return,
        };
        let (uri, version) = match event {
            Ok(MembershipEvent::PeerVersion { uri, version }) => (uri, version),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(controller) = controller.upgrade() else {
            return;
        };
        if let Err(e) = controller.catch_up(&uri, version).await {
            debug!(uri = %uri, version, error = %e, "Config catch-up failed");
        }
    }
}

/// Bind TCP and UDP on the same port
async fn bind_cluster_addr(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    const EPHEMERAL_ATTEMPTS: usize = 16;

    let attempts = if addr.port() == 0 { EPHEMERAL_ATTEMPTS } else { 1 };
    let mut last_err = None;
    for _ in 0..attempts {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClusterError::Network(format!("Failed to bind {}: {}", addr, e)))?;
        let bound = listener.local_addr()?;
        // The prober binds the same port; check it is free for UDP too
        match std::net::UdpSocket::bind(bound) {
            Ok(probe) => {
                drop(probe);
                return Ok((listener, bound));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(ClusterError::Network(format!(
        "Failed to bind {}: {}",
        addr,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}
