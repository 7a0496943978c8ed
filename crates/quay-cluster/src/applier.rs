//! Two-phase configuration apply
//!
//! A candidate config is prepared on every target in parallel. When enough
//! targets acknowledge (all of them under the default quorum policy) the
//! candidate is committed locally first and then on every peer. Otherwise
//! every target that accepted is told to abort and the first failure is
//! reported. Peers identify the proposer by the sender of each request.

use crate::config::{ApplyConfig, QuorumPolicy};
use crate::error::{ClusterError, ErrorKind, Result};
use crate::node::LivenessSnapshot;
use crate::observability::{ApplyMetrics, ApplyOutcome};
use crate::store::TopologyStore;
use crate::topology::ClusterConfig;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Remote side of the two-phase protocol.
///
/// Commit and abort only touch a candidate the same proposer prepared.
#[async_trait]
pub trait ConfigPeer: Send + Sync {
    /// Ask `uri` to accept `config` for a later commit
    async fn prepare(&self, uri: &str, config: &ClusterConfig, limit: Duration) -> Result<()>;

    /// Ask `uri` to make the prepared `version` visible
    async fn commit(&self, uri: &str, version: u64, limit: Duration) -> Result<()>;

    /// Ask `uri` to drop the prepared `version`
    async fn abort(&self, uri: &str, version: u64, limit: Duration) -> Result<()>;

    /// Fetch the committed config of `uri`
    async fn fetch_config(&self, uri: &str, limit: Duration) -> Result<ClusterConfig>;
}

/// What a finished round decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundDecision {
    Commit,
    Abort { uri: String, reason: String },
    NoQuorum { acked: usize, required: usize },
}

/// State of one prepare round
#[derive(Debug)]
pub struct ApplyRound {
    /// Config being proposed
    pub candidate: Arc<ClusterConfig>,

    /// Every uri asked to prepare, sorted
    pub targets: Vec<String>,

    /// Targets that have not answered yet
    outstanding: BTreeSet<String>,

    /// Targets that accepted
    acked: BTreeSet<String>,

    /// Targets that refused or timed out, with the reason
    failures: Vec<(String, String)>,

    /// Targets that answered with a refusal and hold nothing of this round
    refused: BTreeSet<String>,

    /// Acks needed to commit
    required: usize,

    /// The round gives up on outstanding targets at this instant
    pub deadline: Instant,
}

impl ApplyRound {
    pub fn new(
        candidate: Arc<ClusterConfig>,
        targets: Vec<String>,
        policy: QuorumPolicy,
        deadline: Instant,
    ) -> Self {
        let required = policy.required(targets.len());
        Self {
            candidate,
            outstanding: targets.iter().cloned().collect(),
            targets,
            acked: BTreeSet::new(),
            failures: Vec::new(),
            refused: BTreeSet::new(),
            required,
            deadline,
        }
    }

    pub fn record_ack(&mut self, uri: &str) {
        if self.outstanding.remove(uri) {
            self.acked.insert(uri.to_string());
        }
    }

    pub fn record_failure(&mut self, uri: &str, reason: impl Into<String>) {
        if self.outstanding.remove(uri) {
            self.failures.push((uri.to_string(), reason.into()));
        }
    }

    /// Record a definite refusal
    pub fn record_refusal(&mut self, uri: &str, reason: impl Into<String>) {
        if self.outstanding.contains(uri) {
            self.refused.insert(uri.to_string());
        }
        self.record_failure(uri, reason);
    }

    /// Mark every outstanding target as timed out
    pub fn expire(&mut self) {
        let late: Vec<String> = self.outstanding.iter().cloned().collect();
        for uri in late {
            self.record_failure(&uri, ClusterError::Timeout.to_string());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn acked(&self) -> &BTreeSet<String> {
        &self.acked
    }

    /// Targets that may hold the candidate: everyone except those that refused
    pub fn abort_targets(&self) -> impl Iterator<Item = &String> {
        self.targets.iter().filter(|uri| !self.refused.contains(*uri))
    }

    /// Decide the round; outstanding targets count as not acknowledged
    pub fn decision(&self) -> RoundDecision {
        if self.acked.len() >= self.required && !self.acked.is_empty() {
            return RoundDecision::Commit;
        }
        // Report the failure of the first target in uri order
        let first = self
            .targets
            .iter()
            .find_map(|t| self.failures.iter().find(|(uri, _)| uri == t));
        match first {
            Some((uri, reason)) => RoundDecision::Abort {
                uri: uri.clone(),
                reason: reason.clone(),
            },
            None => RoundDecision::NoQuorum {
                acked: self.acked.len(),
                required: self.required,
            },
        }
    }
}

/// Proposer side of the two-phase protocol
pub struct TwoPhaseApplier {
    local_uri: String,
    store: Arc<TopologyStore>,
    peer: Arc<dyn ConfigPeer>,
    config: ApplyConfig,
}

impl TwoPhaseApplier {
    pub fn new(
        local_uri: impl Into<String>,
        store: Arc<TopologyStore>,
        peer: Arc<dyn ConfigPeer>,
        config: ApplyConfig,
    ) -> Self {
        Self {
            local_uri: local_uri.into(),
            store,
            peer,
            config,
        }
    }

    /// Every alive server of `candidate`, always including ourselves, sorted
    pub fn targets(&self, candidate: &ClusterConfig, liveness: &LivenessSnapshot) -> Vec<String> {
        let mut targets: BTreeSet<String> = candidate
            .servers
            .values()
            .filter(|s| liveness.is_alive(&s.uri))
            .map(|s| s.uri.clone())
            .collect();
        targets.insert(self.local_uri.clone());
        targets.into_iter().collect()
    }

    /// Propagate `candidate` and commit it locally.
    ///
    /// Returns the committed config, or the error that aborted the round.
    pub async fn apply(
        &self,
        operation: &'static str,
        candidate: ClusterConfig,
        liveness: &LivenessSnapshot,
    ) -> Result<Arc<ClusterConfig>> {
        let started = Instant::now();
        let current = self.store.version();
        if candidate.version != current + 1 {
            return Err(ClusterError::StaleVersion {
                current,
                proposed: candidate.version,
            });
        }

        let candidate = Arc::new(candidate);
        let version = candidate.version;
        let targets = self.targets(&candidate, liveness);
        ApplyMetrics::record_targets(targets.len());
        debug!(operation, version, targets = ?targets, "Preparing config");

        let mut round = ApplyRound::new(
            candidate.clone(),
            targets,
            self.config.quorum,
            started + self.config.prepare_timeout,
        );
        self.prepare_all(&mut round).await;

        match round.decision() {
            RoundDecision::Commit => {
                let committed = match self.store.commit_prepared(version, &self.local_uri) {
                    Ok(committed) => committed,
                    Err(e) => {
                        self.abort_all(&round).await;
                        ApplyMetrics::record_round(operation, ApplyOutcome::Aborted, started.elapsed());
                        return Err(e);
                    }
                };
                self.commit_peers(&round).await;
                ApplyMetrics::record_round(operation, ApplyOutcome::Committed, started.elapsed());
                info!(operation, version, "Config applied");
                Ok(committed)
            }
            RoundDecision::Abort { uri, reason } => {
                warn!(operation, version, uri = %uri, reason = %reason, "Prepare failed, aborting");
                self.abort_all(&round).await;
                ApplyMetrics::record_round(operation, ApplyOutcome::Aborted, started.elapsed());
                Err(ClusterError::PrepareFailed { uri, reason })
            }
            RoundDecision::NoQuorum { acked, required } => {
                warn!(operation, version, acked, required, "Quorum not reached, aborting");
                self.abort_all(&round).await;
                ApplyMetrics::record_round(operation, ApplyOutcome::Aborted, started.elapsed());
                Err(ClusterError::QuorumNotReached { acked, required })
            }
        }
    }

    async fn prepare_all(&self, round: &mut ApplyRound) {
        let limit = self.config.prepare_timeout;
        let mut pending = FuturesUnordered::new();

        for uri in round.targets.clone() {
            if uri == self.local_uri {
                match self.store.prepare((*round.candidate).clone(), &self.local_uri) {
                    Ok(()) => round.record_ack(&uri),
                    Err(e) => round.record_refusal(&uri, e.to_string()),
                }
                continue;
            }
            let peer = self.peer.clone();
            let candidate = round.candidate.clone();
            pending.push(async move {
                let result = peer.prepare(&uri, &candidate, limit).await;
                (uri, result)
            });
        }

        let deadline = round.deadline;
        while !round.is_complete() {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((uri, Ok(())))) => round.record_ack(&uri),
                Ok(Some((uri, Err(e)))) if is_refusal(&e) => {
                    round.record_refusal(&uri, e.to_string())
                }
                Ok(Some((uri, Err(e)))) => round.record_failure(&uri, e.to_string()),
                Ok(None) => break,
                Err(_) => {
                    round.expire();
                    break;
                }
            }
        }
    }

    async fn commit_peers(&self, round: &ApplyRound) {
        let version = round.candidate.version;
        let limit = self.config.commit_timeout;
        let commits = round
            .acked()
            .iter()
            .filter(|uri| **uri != self.local_uri)
            .map(|uri| {
                let peer = self.peer.clone();
                async move { (uri, peer.commit(uri, version, limit).await) }
            })
            .collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;

        for (uri, result) in commits {
            if let Err(e) = result {
                // The peer catches up from its next ping
                warn!(uri = %uri, version, error = %e, "Commit failed on peer");
            }
        }
    }

    /// Abort on every target that did not refuse
    async fn abort_all(&self, round: &ApplyRound) {
        let version = round.candidate.version;
        let limit = self.config.commit_timeout;
        self.store.abort_prepared(version, &self.local_uri);

        let aborts = round
            .abort_targets()
            .filter(|uri| **uri != self.local_uri)
            .map(|uri| {
                let peer = self.peer.clone();
                async move { (uri, peer.abort(uri, version, limit).await) }
            })
            .collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;

        for (uri, result) in aborts {
            if let Err(e) = result {
                debug!(uri = %uri, version, error = %e, "Abort failed on peer");
            }
        }
    }
}

/// The peer answered and decided against the candidate
fn is_refusal(err: &ClusterError) -> bool {
    matches!(err.kind(), ErrorKind::Apply | ErrorKind::Validation)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::node::Liveness;
    use crate::topology::TopologyCommand;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, HashMap};
    use uuid::Uuid;

    /// In-memory peers keyed by uri
    #[derive(Default)]
    pub(crate) struct MockPeers {
        /// Uri the requests appear to come from
        pub proposer: String,
        pub stores: HashMap<String, Arc<TopologyStore>>,
        pub slow: BTreeSet<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockPeers {
        fn store(&self, uri: &str) -> Result<&Arc<TopologyStore>> {
            self.stores
                .get(uri)
                .ok_or_else(|| ClusterError::ConnectionFailed(uri.to_string()))
        }
    }

    #[async_trait]
    impl ConfigPeer for MockPeers {
        async fn prepare(&self, uri: &str, config: &ClusterConfig, limit: Duration) -> Result<()> {
            self.calls.lock().push(format!("prepare {}", uri));
            if self.slow.contains(uri) {
                tokio::time::sleep(limit * 2).await;
            }
            self.store(uri)?.prepare(config.clone(), &self.proposer)
        }

        async fn commit(&self, uri: &str, version: u64, _limit: Duration) -> Result<()> {
            self.calls.lock().push(format!("commit {}", uri));
            self.store(uri)?.commit_prepared(version, &self.proposer).map(|_| ())
        }

        async fn abort(&self, uri: &str, version: u64, _limit: Duration) -> Result<()> {
            self.calls.lock().push(format!("abort {}", uri));
            self.store(uri)?.abort_prepared(version, &self.proposer);
            Ok(())
        }

        async fn fetch_config(&self, uri: &str, _limit: Duration) -> Result<ClusterConfig> {
            Ok((*self.store(uri)?.snapshot()).clone())
        }
    }

    const A: &str = "localhost:33001";
    const B: &str = "localhost:33002";
    const C: &str = "localhost:33003";

    fn join(n: u128, uri: &str) -> TopologyCommand {
        TopologyCommand::JoinServer {
            uuid: Uuid::from_u128(n),
            uri: uri.to_string(),
            alias: None,
            replicaset_uuid: Uuid::from_u128(100 + n),
            roles: BTreeSet::new(),
        }
    }

    fn three_nodes() -> ClusterConfig {
        ClusterConfig::new()
            .apply(&join(1, A))
            .unwrap()
            .apply(&join(2, B))
            .unwrap()
            .apply(&join(3, C))
            .unwrap()
    }

    fn setup(slow: &[&str]) -> (TwoPhaseApplier, Arc<MockPeers>, Arc<TopologyStore>) {
        let base = three_nodes();
        let mut stores = HashMap::new();
        for uri in [A, B, C] {
            let store = Arc::new(TopologyStore::default());
            store.commit(base.clone()).unwrap();
            stores.insert(uri.to_string(), store);
        }
        let local = stores[A].clone();
        let peers = Arc::new(MockPeers {
            proposer: A.to_string(),
            stores,
            slow: slow.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        });
        let config = ApplyConfig {
            prepare_timeout: Duration::from_millis(100),
            commit_timeout: Duration::from_millis(100),
            quorum: QuorumPolicy::AllAlive,
        };
        let applier = TwoPhaseApplier::new(A, local.clone(), peers.clone(), config);
        (applier, peers, local)
    }

    fn alive(uris: &[&str]) -> LivenessSnapshot {
        LivenessSnapshot::from_pairs(uris.iter().map(|u| (*u, Liveness::Alive)))
    }

    fn failover_on(base: &ClusterConfig) -> ClusterConfig {
        base.apply(&TopologyCommand::SetFailover { enabled: true })
            .unwrap()
    }

    #[test]
    fn test_round_decision() {
        let candidate = Arc::new(ClusterConfig::new());
        let targets = vec![A.to_string(), B.to_string(), C.to_string()];
        let deadline = Instant::now();

        let mut round = ApplyRound::new(candidate.clone(), targets.clone(), QuorumPolicy::AllAlive, deadline);
        round.record_ack(A);
        round.record_failure(C, "late");
        round.record_refusal(B, "boom");
        assert!(round.is_complete());
        assert_eq!(
            round.decision(),
            RoundDecision::Abort {
                uri: B.to_string(),
                reason: "boom".to_string()
            }
        );
        // A late answer may still have prepared; a refusal did not
        let abort: Vec<&String> = round.abort_targets().collect();
        assert_eq!(abort, [A, C]);

        let mut round = ApplyRound::new(candidate, targets, QuorumPolicy::Majority, deadline);
        round.record_ack(A);
        round.record_ack(C);
        round.expire();
        assert_eq!(round.decision(), RoundDecision::Commit);
    }

    #[tokio::test]
    async fn test_commit_everywhere() {
        let (applier, peers, local) = setup(&[]);
        let candidate = failover_on(&local.snapshot());

        let committed = applier
            .apply("set_failover", candidate, &alive(&[A, B, C]))
            .await
            .unwrap();

        assert_eq!(committed.version, 4);
        for uri in [A, B, C] {
            let snapshot = peers.stores[uri].snapshot();
            assert_eq!(snapshot.version, 4);
            assert!(snapshot.failover_enabled);
        }
    }

    #[tokio::test]
    async fn test_dead_members_are_skipped() {
        let (applier, peers, local) = setup(&[]);
        let candidate = failover_on(&local.snapshot());

        applier
            .apply("set_failover", candidate, &alive(&[A, B]))
            .await
            .unwrap();

        assert_eq!(peers.stores[B].version(), 4);
        assert_eq!(peers.stores[C].version(), 3);
        assert!(!peers.calls.lock().iter().any(|c| c.ends_with(C)));
    }

    #[tokio::test]
    async fn test_rejection_aborts_everywhere() {
        let (applier, peers, local) = setup(&[]);
        // C already holds B's candidate for the same version
        let conflicting = local
            .snapshot()
            .apply(&TopologyCommand::ExpelServer {
                uuid: Uuid::from_u128(2),
            })
            .unwrap();
        peers.stores[C].prepare(conflicting, B).unwrap();

        let err = applier
            .apply("set_failover", failover_on(&local.snapshot()), &alive(&[A, B, C]))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Prepare failed on \"localhost:33003\": Config version 4 is already prepared"
        );
        assert_eq!(local.version(), 3);
        assert_eq!(local.prepared_version(), None);
        assert_eq!(peers.stores[B].prepared_version(), None);
        assert!(peers.calls.lock().contains(&format!("abort {}", B)));
        assert!(!peers.calls.lock().contains(&format!("abort {}", C)));
        assert!(!peers.calls.lock().iter().any(|c| c.starts_with("commit")));
    }

    #[tokio::test]
    async fn test_failed_round_keeps_foreign_candidate() {
        let (applier, peers, local) = setup(&[]);
        let foreign = local
            .snapshot()
            .apply(&TopologyCommand::ExpelServer {
                uuid: Uuid::from_u128(3),
            })
            .unwrap();
        // B won the race on C and on our own store
        peers.stores[C].prepare(foreign.clone(), B).unwrap();
        local.prepare(foreign, B).unwrap();

        let err = applier
            .apply("set_failover", failover_on(&local.snapshot()), &alive(&[A, B, C]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PrepareFailed { .. }));

        for store in [&local, &peers.stores[C]] {
            assert_eq!(store.prepared_version(), Some(4));
            assert_eq!(store.prepared_by().as_deref(), Some(B));
        }
        // B can still finish its round everywhere it prepared
        peers.stores[C].commit_prepared(4, B).unwrap();
        local.commit_prepared(4, B).unwrap();
        assert_eq!(local.version(), 4);
        assert!(!local.snapshot().servers.contains_key(&Uuid::from_u128(3)));
    }

    #[tokio::test]
    async fn test_slow_target_aborts_round() {
        let (applier, peers, local) = setup(&[B]);

        let err = applier
            .apply("set_failover", failover_on(&local.snapshot()), &alive(&[A, B, C]))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Prepare failed on \"localhost:33002\": request timeout"
        );
        assert_eq!(local.version(), 3);
        assert_eq!(peers.stores[C].prepared_version(), None);
    }

    #[tokio::test]
    async fn test_majority_tolerates_one_failure() {
        let (mut applier, peers, local) = setup(&[C]);
        applier.config.quorum = QuorumPolicy::Majority;

        applier
            .apply("set_failover", failover_on(&local.snapshot()), &alive(&[A, B, C]))
            .await
            .unwrap();

        assert_eq!(local.version(), 4);
        assert_eq!(peers.stores[B].version(), 4);
        assert_eq!(peers.stores[C].version(), 3);
    }

    #[tokio::test]
    async fn test_stale_candidate_rejected() {
        let (applier, _peers, local) = setup(&[]);
        let stale = local.snapshot().as_ref().clone();

        let err = applier
            .apply("set_failover", stale, &alive(&[A]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::StaleVersion { .. }));
    }
}
