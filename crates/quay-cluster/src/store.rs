//! Versioned in-memory topology store
//!
//! Holds the committed [`ClusterConfig`] behind an `Arc` so readers take a
//! snapshot without waiting for writers, plus at most one prepared candidate
//! for the receiving side of the two-phase apply. A candidate belongs to the
//! proposer that prepared it; only that proposer can commit or abort it.

use crate::error::{ClusterError, Result};
use crate::topology::ClusterConfig;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A candidate waiting for commit or abort
#[derive(Debug)]
struct Prepared {
    config: Arc<ClusterConfig>,
    proposer: String,
    prepared_at: Instant,
}

/// Authoritative local copy of the cluster configuration
#[derive(Debug)]
pub struct TopologyStore {
    /// Visible config, replaced atomically on commit
    committed: RwLock<Arc<ClusterConfig>>,

    /// Candidate accepted in the prepare phase
    prepared: Mutex<Option<Prepared>>,

    /// A prepared candidate older than this no longer blocks new prepares
    prepare_ttl: Duration,
}

impl TopologyStore {
    /// Create a store holding the empty, unbootstrapped config
    pub fn new(prepare_ttl: Duration) -> Self {
        Self {
            committed: RwLock::new(Arc::new(ClusterConfig::new())),
            prepared: Mutex::new(None),
            prepare_ttl,
        }
    }

    /// Current committed config
    pub fn snapshot(&self) -> Arc<ClusterConfig> {
        self.committed.read().clone()
    }

    /// Current committed version
    pub fn version(&self) -> u64 {
        self.committed.read().version
    }

    /// Replace the committed config.
    ///
    /// The new version must be strictly greater than the current one.
    pub fn commit(&self, config: ClusterConfig) -> Result<Arc<ClusterConfig>> {
        config.check_invariants()?;
        let mut committed = self.committed.write();
        if config.version <= committed.version {
            error!(
                current = committed.version,
                proposed = config.version,
                "Refusing non-monotonic config commit"
            );
            return Err(ClusterError::VersionNotMonotonic {
                current: committed.version,
                proposed: config.version,
            });
        }

        let config = Arc::new(config);
        *committed = config.clone();
        drop(committed);

        let mut prepared = self.prepared.lock();
        if prepared
            .as_ref()
            .is_some_and(|p| p.config.version <= config.version)
        {
            *prepared = None;
        }

        info!(version = config.version, "Committed cluster config");
        Ok(config)
    }

    /// Accept a candidate from `proposer` for a later `commit_prepared`
    pub fn prepare(&self, candidate: ClusterConfig, proposer: &str) -> Result<()> {
        let current = self.version();
        if candidate.version <= current {
            return Err(ClusterError::StaleVersion {
                current,
                proposed: candidate.version,
            });
        }
        candidate.check_invariants()?;

        let mut prepared = self.prepared.lock();
        if let Some(existing) = prepared.as_ref() {
            let expired = existing.prepared_at.elapsed() > self.prepare_ttl;
            // A proposer runs one round at a time, so its newer prepare replaces the old one
            let same_round = existing.proposer == proposer;
            if !expired && !same_round {
                return Err(ClusterError::ConfigLocked {
                    version: existing.config.version,
                });
            }
            if expired {
                warn!(
                    version = existing.config.version,
                    proposer = %existing.proposer,
                    "Dropping expired prepared config"
                );
            }
        }

        debug!(version = candidate.version, proposer, "Prepared cluster config");
        *prepared = Some(Prepared {
            config: Arc::new(candidate),
            proposer: proposer.to_string(),
            prepared_at: Instant::now(),
        });
        Ok(())
    }

    /// Commit the candidate `proposer` prepared with `version`
    pub fn commit_prepared(&self, version: u64, proposer: &str) -> Result<Arc<ClusterConfig>> {
        let candidate = {
            let mut prepared = self.prepared.lock();
            match prepared.take() {
                Some(p) if p.config.version == version && p.proposer == proposer => p.config,
                other => {
                    *prepared = other;
                    return Err(ClusterError::NothingPrepared(version));
                }
            }
        };
        self.commit(Arc::unwrap_or_clone(candidate))
    }

    /// Discard the candidate `proposer` prepared with `version`.
    ///
    /// Returns whether one was held; other proposers' candidates are kept.
    pub fn abort_prepared(&self, version: u64, proposer: &str) -> bool {
        let mut prepared = self.prepared.lock();
        if prepared
            .as_ref()
            .is_some_and(|p| p.config.version == version && p.proposer == proposer)
        {
            *prepared = None;
            debug!(version, proposer, "Aborted prepared config");
            true
        } else {
            false
        }
    }

    /// Version of the held candidate, if any
    pub fn prepared_version(&self) -> Option<u64> {
        self.prepared.lock().as_ref().map(|p| p.config.version)
    }

    /// Proposer of the held candidate, if any
    pub fn prepared_by(&self) -> Option<String> {
        self.prepared.lock().as_ref().map(|p| p.proposer.clone())
    }

    /// Adopt a newer config fetched from a peer.
    ///
    /// Returns `Ok(None)` when the local copy is already as new.
    pub fn install(&self, config: ClusterConfig) -> Result<Option<Arc<ClusterConfig>>> {
        if config.version <= self.version() {
            return Ok(None);
        }
        let version = config.version;
        let installed = self.commit(config)?;
        info!(version, "Installed cluster config from peer");
        Ok(Some(installed))
    }
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{role_set, TopologyCommand};
    use uuid::Uuid;

    fn join(uri: &str) -> TopologyCommand {
        TopologyCommand::JoinServer {
            uuid: Uuid::new_v4(),
            uri: uri.to_string(),
            alias: None,
            replicaset_uuid: Uuid::new_v4(),
            roles: role_set(Vec::<String>::new()),
        }
    }

    #[test]
    fn test_snapshot_is_stable_across_commit() {
        let store = TopologyStore::default();
        let before = store.snapshot();

        let next = before.apply(&join("localhost:3301")).unwrap();
        store.commit(next).unwrap();

        assert_eq!(before.version, 0);
        assert!(!before.bootstrapped);
        assert_eq!(store.version(), 1);
        assert!(store.snapshot().bootstrapped);
    }

    #[test]
    fn test_commit_rejects_non_increasing_version() {
        let store = TopologyStore::default();
        let next = store.snapshot().apply(&join("localhost:3301")).unwrap();
        store.commit(next.clone()).unwrap();

        let err = store.commit(next).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.version(), 1);
    }

    const PROPOSER: &str = "localhost:3301";
    const OTHER: &str = "localhost:3302";

    #[test]
    fn test_prepare_commit() {
        let store = TopologyStore::default();
        let candidate = store.snapshot().apply(&join("localhost:3301")).unwrap();

        store.prepare(candidate.clone(), PROPOSER).unwrap();
        // Re-sending the same candidate is accepted
        store.prepare(candidate, PROPOSER).unwrap();
        assert_eq!(store.prepared_version(), Some(1));
        assert_eq!(store.version(), 0);

        assert!(matches!(
            store.commit_prepared(2, PROPOSER),
            Err(ClusterError::NothingPrepared(2))
        ));
        assert!(matches!(
            store.commit_prepared(1, OTHER),
            Err(ClusterError::NothingPrepared(1))
        ));
        assert_eq!(store.prepared_version(), Some(1));

        store.commit_prepared(1, PROPOSER).unwrap();
        assert_eq!(store.version(), 1);
        assert_eq!(store.prepared_version(), None);
    }

    #[test]
    fn test_prepare_conflict_and_abort() {
        let store = TopologyStore::default();
        let base = store.snapshot();
        let first = base.apply(&join("localhost:3301")).unwrap();
        let second = base.apply(&join("localhost:3302")).unwrap();

        store.prepare(first, PROPOSER).unwrap();
        assert!(matches!(
            store.prepare(second.clone(), OTHER),
            Err(ClusterError::ConfigLocked { version: 1 })
        ));

        assert!(!store.abort_prepared(7, PROPOSER));
        assert!(store.abort_prepared(1, PROPOSER));
        store.prepare(second, OTHER).unwrap();
    }

    #[test]
    fn test_abort_keeps_foreign_candidate() {
        let store = TopologyStore::default();
        let candidate = store.snapshot().apply(&join("localhost:3301")).unwrap();
        store.prepare(candidate, OTHER).unwrap();

        // Same version, different proposer
        assert!(!store.abort_prepared(1, PROPOSER));
        assert_eq!(store.prepared_version(), Some(1));
        assert_eq!(store.prepared_by().as_deref(), Some(OTHER));

        store.commit_prepared(1, OTHER).unwrap();
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_proposer_replaces_own_candidate() {
        let store = TopologyStore::default();
        let base = store.snapshot();
        store
            .prepare(base.apply(&join("localhost:3301")).unwrap(), PROPOSER)
            .unwrap();
        let retry = base.apply(&join("localhost:3302")).unwrap();
        store.prepare(retry.clone(), PROPOSER).unwrap();

        let committed = store.commit_prepared(1, PROPOSER).unwrap();
        assert_eq!(*committed, retry);
    }

    #[test]
    fn test_prepare_lock_expires() {
        let store = TopologyStore::new(Duration::ZERO);
        let base = store.snapshot();
        store
            .prepare(base.apply(&join("localhost:3301")).unwrap(), PROPOSER)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store
            .prepare(base.apply(&join("localhost:3302")).unwrap(), OTHER)
            .unwrap();
    }

    #[test]
    fn test_prepare_rejects_stale() {
        let store = TopologyStore::default();
        let next = store.snapshot().apply(&join("localhost:3301")).unwrap();
        store.commit(next.clone()).unwrap();

        assert!(matches!(
            store.prepare(next, PROPOSER),
            Err(ClusterError::StaleVersion {
                current: 1,
                proposed: 1
            })
        ));
    }

    #[test]
    fn test_install() {
        let source = TopologyStore::default();
        let v1 = source.snapshot().apply(&join("localhost:3301")).unwrap();
        let v2 = v1.apply(&join("localhost:3302")).unwrap();

        let store = TopologyStore::default();
        assert!(store.install(v2.clone()).unwrap().is_some());
        assert_eq!(store.version(), 2);
        assert!(store.install(v1).unwrap().is_none());
        assert_eq!(*store.snapshot(), v2);
    }
}
