//! Member liveness as seen by the prober

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Liveness of a member address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Acked the most recent ping
    Alive,
    /// Missed a ping, not yet declared dead
    Suspect,
    /// Silent for longer than the suspicion timeout
    Dead,
    /// Never heard from
    #[default]
    Unknown,
}

impl Liveness {
    /// Check if the member counts as alive for validation and health
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }

    /// Check if the member might still be reachable
    pub fn is_reachable(&self) -> bool {
        matches!(self, Liveness::Alive | Liveness::Suspect)
    }
}

/// A member address tracked by the prober
#[derive(Debug, Clone)]
pub struct Member {
    /// Advertised `host:port`
    pub uri: String,

    /// Display name the member announced about itself
    pub alias: Option<String>,

    /// Current liveness
    pub state: Liveness,

    /// Last time we heard from this member
    pub last_seen: Instant,

    /// Highest committed config version the member reported
    pub config_version: u64,
}

impl Member {
    /// Create a member we have not heard from yet
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            alias: None,
            state: Liveness::Unknown,
            last_seen: Instant::now(),
            config_version: 0,
        }
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Mark as alive
    pub fn mark_alive(&mut self, config_version: u64) {
        self.state = Liveness::Alive;
        self.config_version = self.config_version.max(config_version);
        self.touch();
    }

    /// Mark as suspect
    pub fn mark_suspect(&mut self) {
        if self.state == Liveness::Alive {
            self.state = Liveness::Suspect;
        }
    }

    /// Mark as dead
    pub fn mark_dead(&mut self) {
        self.state = Liveness::Dead;
    }

    /// Check if member is alive
    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }
}

/// Point-in-time copy of the liveness table.
///
/// Validation and health aggregation read this instead of probing.
#[derive(Debug, Clone, Default)]
pub struct LivenessSnapshot {
    members: HashMap<String, Liveness>,
}

impl LivenessSnapshot {
    /// Build a snapshot from `(uri, liveness)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Liveness)>,
        S: Into<String>,
    {
        Self {
            members: pairs.into_iter().map(|(u, l)| (u.into(), l)).collect(),
        }
    }

    /// Liveness of `uri`, `Unknown` if never seen
    pub fn get(&self, uri: &str) -> Liveness {
        self.members.get(uri).copied().unwrap_or_default()
    }

    /// Check if `uri` is known and alive
    pub fn is_alive(&self, uri: &str) -> bool {
        self.get(uri).is_alive()
    }

    /// Check if `uri` was ever seen
    pub fn contains(&self, uri: &str) -> bool {
        self.members.contains_key(uri)
    }

    /// All alive member uris, sorted
    pub fn alive_uris(&self) -> Vec<&str> {
        let mut uris: Vec<&str> = self
            .members
            .iter()
            .filter(|(_, l)| l.is_alive())
            .map(|(u, _)| u.as_str())
            .collect();
        uris.sort_unstable();
        uris
    }

    /// Number of tracked members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if no member is tracked
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
