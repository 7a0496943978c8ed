//! Automatic master reassignment
//!
//! When failover is enabled and the prober declares a replicaset master
//! dead, exactly one node, the alive configured server with the lowest
//! uuid, picks a new master and proposes it through `edit_replicaset`.

use crate::controller::Controller;
use crate::membership::MembershipEvent;
use crate::node::LivenessSnapshot;
use crate::observability::TopologyMetrics;
use crate::topology::{ClusterConfig, Replicaset, ReplicasetId, ServerId};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Chooses a replacement master
pub trait ElectionPolicy: Send + Sync {
    /// Pick the new master of `replicaset`, or None to leave it alone
    fn elect(
        &self,
        config: &ClusterConfig,
        replicaset: &Replicaset,
        liveness: &LivenessSnapshot,
    ) -> Option<ServerId>;
}

/// Lowest uuid among the alive members
#[derive(Debug, Default, Clone, Copy)]
pub struct LowestUuid;

impl ElectionPolicy for LowestUuid {
    fn elect(
        &self,
        config: &ClusterConfig,
        replicaset: &Replicaset,
        liveness: &LivenessSnapshot,
    ) -> Option<ServerId> {
        config
            .members_of(&replicaset.uuid)
            .into_iter()
            .filter(|s| s.uuid != replicaset.master_uuid && liveness.is_alive(&s.uri))
            .map(|s| s.uuid)
            .min()
    }
}

/// The uri of the node that makes failover decisions
pub fn responsible_uri<'a>(config: &'a ClusterConfig, liveness: &LivenessSnapshot) -> Option<&'a str> {
    // `servers` is keyed by uuid, so the first alive one has the lowest
    config
        .servers
        .values()
        .find(|s| liveness.is_alive(&s.uri))
        .map(|s| s.uri.as_str())
}

/// Decides master changes after a member died
pub struct FailoverController {
    policy: Box<dyn ElectionPolicy>,
}

impl FailoverController {
    pub fn new(policy: Box<dyn ElectionPolicy>) -> Self {
        Self { policy }
    }

    /// Master changes `self_uri` should propose after `dead_uri` died
    pub fn plan(
        &self,
        config: &ClusterConfig,
        liveness: &LivenessSnapshot,
        dead_uri: &str,
        self_uri: &str,
    ) -> Vec<(ReplicasetId, ServerId)> {
        if !config.failover_enabled {
            return Vec::new();
        }
        if responsible_uri(config, liveness) != Some(self_uri) {
            debug!(dead = %dead_uri, "Failover is handled by another node");
            return Vec::new();
        }

        config
            .replicasets_mastered_by(dead_uri)
            .into_iter()
            .filter_map(|rs| {
                let elected = self.policy.elect(config, rs, liveness);
                if elected.is_none() {
                    warn!(replicaset = %rs.uuid, "No alive member to take over as master");
                }
                elected.map(|master| (rs.uuid, master))
            })
            .collect()
    }
}

impl Default for FailoverController {
    fn default() -> Self {
        Self::new(Box::new(LowestUuid))
    }
}

/// React to `MemberDead` events until shutdown
pub(crate) async fn run_watcher(
    controller: Weak<Controller>,
    mut events: broadcast::Receiver<MembershipEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.recv() => return,
        };
        let dead_uri = match event {
            Ok(MembershipEvent::MemberDead { uri }) => uri,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Failover watcher lagged behind membership events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(controller) = controller.upgrade() else {
            return;
        };
        failover(&controller, &dead_uri).await;
    }
}

async fn failover(controller: &Arc<Controller>, dead_uri: &str) {
    let changes = controller.plan_failover(dead_uri);
    for (replicaset, master) in changes {
        info!(
            replicaset = %replicaset,
            master = %master,
            dead = %dead_uri,
            "Failover: assigning new master"
        );
        match controller.edit_replicaset(replicaset, None, Some(master)).await {
            Ok(()) => TopologyMetrics::increment_failovers(),
            Err(e) => warn!(replicaset = %replicaset, error = %e, "Failover proposal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Liveness;
    use crate::topology::TopologyCommand;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn uri(n: u8) -> String {
        format!("localhost:{}", 33000 + n as u16)
    }

    /// 1: router, rs 10 = {2 (master), 3, 4}
    fn cluster(failover: bool) -> ClusterConfig {
        let mut config = ClusterConfig::new();
        for (n, rs) in [(1u8, 1u128), (2, 10), (3, 10), (4, 10)] {
            config = config
                .apply(&TopologyCommand::JoinServer {
                    uuid: id(n as u128),
                    uri: uri(n),
                    alias: None,
                    replicaset_uuid: id(rs + 100),
                    roles: BTreeSet::new(),
                })
                .unwrap();
        }
        config
            .apply(&TopologyCommand::SetFailover { enabled: failover })
            .unwrap()
    }

    fn liveness(dead: &[u8]) -> LivenessSnapshot {
        LivenessSnapshot::from_pairs((1..=4).map(|n| {
            let state = if dead.contains(&n) {
                Liveness::Dead
            } else {
                Liveness::Alive
            };
            (uri(n), state)
        }))
    }

    #[test]
    fn test_lowest_alive_member_wins() {
        let config = cluster(true);
        let rs = config.replicaset(&id(110)).unwrap();

        assert_eq!(LowestUuid.elect(&config, rs, &liveness(&[2])), Some(id(3)));
        assert_eq!(LowestUuid.elect(&config, rs, &liveness(&[2, 3])), Some(id(4)));
        assert_eq!(LowestUuid.elect(&config, rs, &liveness(&[2, 3, 4])), None);
    }

    #[test]
    fn test_responsible_node() {
        let config = cluster(true);
        assert_eq!(responsible_uri(&config, &liveness(&[2])), Some("localhost:33001"));
        assert_eq!(responsible_uri(&config, &liveness(&[1, 2])), Some("localhost:33003"));
    }

    #[test]
    fn test_plan() {
        let controller = FailoverController::default();
        let config = cluster(true);
        let live = liveness(&[2]);

        assert_eq!(
            controller.plan(&config, &live, &uri(2), &uri(1)),
            vec![(id(110), id(3))]
        );
        // Only the responsible node acts
        assert!(controller.plan(&config, &live, &uri(2), &uri(3)).is_empty());
        // Replicas dying change nothing
        assert!(controller
            .plan(&config, &liveness(&[4]), &uri(4), &uri(1))
            .is_empty());
    }

    #[test]
    fn test_plan_disabled() {
        let controller = FailoverController::default();
        let config = cluster(false);
        assert!(controller
            .plan(&config, &liveness(&[2]), &uri(2), &uri(1))
            .is_empty());
    }
}
