//! Membership prober
//!
//! Tracks liveness of member addresses with UDP ping/ack:
//! - a background sweep pings every tracked uri once per `ping_interval`
//! - a member that misses an ack becomes `suspect`, and `dead` after
//!   `suspicion_multiplier * ping_interval` of silence
//! - any ack, or any inbound ping, marks the sender `alive`
//!
//! Explicit probes (`probe`) bypass the sweep and classify the failure as
//! "not sent" (resolution or send error) or "no response" (timeout).
//!
//! Pings and acks carry the sender's advertised uri, alias and committed
//! config version so peers notice when they fall behind.
//!
//! A forgotten uri (one the config no longer names) is not pinged, and its
//! datagrams no longer make it a member until it is tracked or probed again.

use crate::config::ProbeConfig;
use crate::error::{ClusterError, ProbeFailure, Result};
use crate::node::{Liveness, LivenessSnapshot, Member};
use crate::observability::ProbeMetrics;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, trace, warn};

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// HMAC tag length in bytes (SHA-256 → 32 bytes)
const HMAC_TAG_LEN: usize = 32;

/// Probe datagrams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProbeMessage {
    /// Liveness check
    Ping {
        nonce: u64,
        uri: String,
        alias: Option<String>,
        config_version: u64,
    },
    /// Response to ping, echoing its nonce
    Ack {
        nonce: u64,
        uri: String,
        alias: Option<String>,
        config_version: u64,
    },
}

/// Membership change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A member answered after being unknown, suspect or dead
    MemberAlive { uri: String },
    /// A member missed an ack
    MemberSuspected { uri: String },
    /// A suspect stayed silent past the suspicion timeout
    MemberDead { uri: String },
    /// A member reported a config version newer than ours
    PeerVersion { uri: String, version: u64 },
}

/// An outstanding ping
#[derive(Debug)]
struct PendingPing {
    /// The uri the ping was addressed to
    uri: String,
    /// Completion for explicit probes
    reply: Option<oneshot::Sender<()>>,
}

/// UDP membership prober
pub struct Prober {
    /// Our advertised uri
    local_uri: String,

    /// Our alias
    alias: Option<String>,

    /// Prober configuration
    config: ProbeConfig,

    /// UDP socket shared by pings and acks
    socket: UdpSocket,

    /// Tracked members keyed by uri
    members: DashMap<String, Member>,

    /// Pings awaiting ack keyed by nonce
    pending: DashMap<u64, PendingPing>,

    /// Uris dropped from the config
    forgotten: DashSet<String>,

    /// Our committed config version, announced in every datagram
    config_version: AtomicU64,

    /// Event broadcaster
    event_tx: broadcast::Sender<MembershipEvent>,

    /// Shared secret for datagram authentication (None = no auth)
    hmac_key: Option<Vec<u8>>,
}

impl Prober {
    /// Bind the probe socket on `bind_addr`
    pub async fn bind(
        bind_addr: SocketAddr,
        local_uri: impl Into<String>,
        alias: Option<String>,
        config: ProbeConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ClusterError::Network(format!("Failed to bind {}: {}", bind_addr, e)))?;

        let (event_tx, _) = broadcast::channel(1024);
        let local_uri = local_uri.into();

        let members = DashMap::new();
        let mut self_member = Member::new(local_uri.clone());
        self_member.alias = alias.clone();
        self_member.mark_alive(0);
        members.insert(local_uri.clone(), self_member);

        let hmac_key = config
            .cluster_cookie
            .as_ref()
            .map(|cookie| cookie.as_bytes().to_vec());

        Ok(Self {
            local_uri,
            alias,
            config,
            socket,
            members,
            pending: DashMap::new(),
            forgotten: DashSet::new(),
            config_version: AtomicU64::new(0),
            event_tx,
            hmac_key,
        })
    }

    /// Local address of the probe socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Our advertised uri
    pub fn local_uri(&self) -> &str {
        &self.local_uri
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Announce a new committed config version
    pub fn set_config_version(&self, version: u64) {
        self.config_version.fetch_max(version, Ordering::SeqCst);
    }

    /// Start tracking `uri` so the sweep pings it
    pub fn track(&self, uri: &str) {
        self.forgotten.remove(uri);
        if !self.members.contains_key(uri) {
            debug!(uri = %uri, "Tracking member");
            self.members.insert(uri.to_string(), Member::new(uri));
        }
    }

    /// Stop tracking `uri` and ignore its datagrams
    pub fn forget(&self, uri: &str) {
        if uri == self.local_uri {
            return;
        }
        self.forgotten.insert(uri.to_string());
        if self.members.remove(uri).is_some() {
            debug!(uri = %uri, "Forgot member");
        }
    }

    /// Get a specific member
    pub fn member(&self, uri: &str) -> Option<Member> {
        self.members.get(uri).map(|r| r.value().clone())
    }

    /// All tracked members, sorted by uri
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.iter().map(|r| r.value().clone()).collect();
        members.sort_by(|a, b| a.uri.cmp(&b.uri));
        members
    }

    /// Liveness of `uri`
    pub fn liveness(&self, uri: &str) -> Liveness {
        self.members
            .get(uri)
            .map(|r| r.value().state)
            .unwrap_or_default()
    }

    /// Point-in-time copy of the liveness table
    pub fn snapshot(&self) -> LivenessSnapshot {
        LivenessSnapshot::from_pairs(
            self.members
                .iter()
                .map(|r| (r.key().clone(), r.value().state)),
        )
    }

    /// Probe `uri` once, waiting at most `probe_timeout` for the ack.
    ///
    /// On success the uri is added to membership.
    pub async fn probe(&self, uri: &str) -> Result<()> {
        let started = Instant::now();
        let failed = |reason: ProbeFailure| {
            ProbeMetrics::record_failure(reason);
            warn!(uri = %uri, reason = %reason, "Probe failed");
            ClusterError::ProbeFailed {
                uri: uri.to_string(),
                reason,
            }
        };

        let addr = match self.resolve(uri).await {
            Some(addr) => addr,
            None => return Err(failed(ProbeFailure::NotSent)),
        };

        self.forgotten.remove(uri);
        let nonce = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            nonce,
            PendingPing {
                uri: uri.to_string(),
                reply: Some(tx),
            },
        );

        if let Err(e) = self.send_message(&self.ping(nonce), addr).await {
            self.pending.remove(&nonce);
            debug!(uri = %uri, error = %e, "Ping was not sent");
            return Err(failed(ProbeFailure::NotSent));
        }

        match tokio::time::timeout(self.config.probe_timeout, rx).await {
            Ok(Ok(())) => {
                ProbeMetrics::record_success(started.elapsed());
                Ok(())
            }
            _ => {
                self.pending.remove(&nonce);
                Err(failed(ProbeFailure::NoResponse))
            }
        }
    }

    /// Run the receiver and the sweep until `shutdown` fires
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let prober = self.clone();
        tokio::spawn(async move {
            let recv_prober = prober.clone();
            let mut recv_handle = tokio::spawn(async move { recv_prober.run_receiver().await });

            let sweep_prober = prober.clone();
            let mut sweep_handle = tokio::spawn(async move { sweep_prober.run_sweep().await });

            tokio::select! {
                r = &mut recv_handle => {
                    error!("Probe receiver ended: {:?}", r);
                }
                r = &mut sweep_handle => {
                    error!("Probe sweep ended: {:?}", r);
                }
                _ = shutdown.recv() => {
                    info!(uri = %prober.local_uri, "Prober shutting down");
                }
            }

            recv_handle.abort();
            sweep_handle.abort();
        })
    }

    /// Resolve `uri` to an address of the socket's family
    async fn resolve(&self, uri: &str) -> Option<SocketAddr> {
        let local_is_v4 = self.socket.local_addr().map(|a| a.is_ipv4()).unwrap_or(true);
        match tokio::net::lookup_host(uri).await {
            Ok(mut addrs) => addrs.find(|a| a.is_ipv4() == local_is_v4),
            Err(e) => {
                debug!(uri = %uri, error = %e, "Failed to resolve");
                None
            }
        }
    }

    fn ping(&self, nonce: u64) -> ProbeMessage {
        ProbeMessage::Ping {
            nonce,
            uri: self.local_uri.clone(),
            alias: self.alias.clone(),
            config_version: self.config_version.load(Ordering::SeqCst),
        }
    }

    /// Send a probe message with optional HMAC authentication
    async fn send_message(&self, msg: &ProbeMessage, addr: SocketAddr) -> Result<()> {
        let data = postcard::to_allocvec(msg)?;
        let packet = self.sign_message(&data);
        self.socket.send_to(&packet, addr).await?;
        Ok(())
    }

    /// Sign a serialized message by appending an HMAC-SHA256 tag
    fn sign_message(&self, data: &[u8]) -> Vec<u8> {
        if let Some(ref key) = self.hmac_key {
            if let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key) {
                mac.update(data);
                let tag = mac.finalize().into_bytes();
                let mut signed = Vec::with_capacity(data.len() + HMAC_TAG_LEN);
                signed.extend_from_slice(data);
                signed.extend_from_slice(&tag);
                return signed;
            }
        }
        data.to_vec()
    }

    /// Verify and strip an HMAC-SHA256 tag from received data.
    /// Returns the payload (without tag) on success.
    fn verify_message<'a>(&self, data: &'a [u8]) -> std::result::Result<&'a [u8], &'static str> {
        if let Some(ref key) = self.hmac_key {
            if data.len() < HMAC_TAG_LEN {
                return Err("message too short for HMAC tag");
            }
            let (payload, tag) = data.split_at(data.len() - HMAC_TAG_LEN);
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| "invalid HMAC key")?;
            mac.update(payload);
            mac.verify_slice(tag)
                .map_err(|_| "HMAC verification failed")?;
            return Ok(payload);
        }
        Ok(data)
    }

    /// Receive and process probe datagrams
    async fn run_receiver(&self) -> Result<()> {
        let mut buf = vec![0u8; 65536];

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    // ICMP errors from earlier sends surface here
                    trace!("Socket recv error: {}", e);
                    continue;
                }
            };

            let payload = match self.verify_message(&buf[..len]) {
                Ok(p) => p,
                Err(reason) => {
                    warn!("Dropping unauthenticated datagram from {}: {}", from, reason);
                    continue;
                }
            };

            let msg: ProbeMessage = match postcard::from_bytes(payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to deserialize datagram from {}: {}", from, e);
                    continue;
                }
            };

            trace!("Received {:?} from {}", msg, from);

            if let Err(e) = self.handle_message(msg, from).await {
                debug!("Error handling datagram from {}: {}", from, e);
            }
        }
    }

    async fn handle_message(&self, msg: ProbeMessage, from: SocketAddr) -> Result<()> {
        match msg {
            ProbeMessage::Ping {
                nonce,
                uri,
                alias,
                config_version,
            } => {
                let ack = ProbeMessage::Ack {
                    nonce,
                    uri: self.local_uri.clone(),
                    alias: self.alias.clone(),
                    config_version: self.config_version.load(Ordering::SeqCst),
                };
                self.send_message(&ack, from).await?;
                if uri != self.local_uri {
                    self.heard_from(&uri, alias, config_version);
                }
            }
            ProbeMessage::Ack {
                nonce,
                uri,
                alias,
                config_version,
            } => match self.pending.remove(&nonce) {
                Some((_, pending)) => {
                    self.heard_from(&pending.uri, alias, config_version);
                    if pending.uri != uri {
                        self.report_version(&uri, config_version);
                    }
                    if let Some(reply) = pending.reply {
                        let _ = reply.send(());
                    }
                }
                None => trace!(uri = %uri, nonce, "Late ack"),
            },
        }
        Ok(())
    }

    /// Record a sign of life from `uri`
    fn heard_from(&self, uri: &str, alias: Option<String>, config_version: u64) {
        if self.forgotten.contains(uri) {
            trace!(uri = %uri, "Ignoring forgotten member");
            return;
        }
        let recovered = {
            let mut member = self
                .members
                .entry(uri.to_string())
                .or_insert_with(|| Member::new(uri));
            let recovered = !member.is_alive();
            if alias.is_some() {
                member.alias = alias;
            }
            member.mark_alive(config_version);
            recovered
        };

        if recovered && uri != self.local_uri {
            info!(uri = %uri, "Member is alive");
            let _ = self.event_tx.send(MembershipEvent::MemberAlive {
                uri: uri.to_string(),
            });
        }
        self.report_version(uri, config_version);
    }

    fn report_version(&self, uri: &str, version: u64) {
        if uri != self.local_uri
            && !self.forgotten.contains(uri)
            && version > self.config_version.load(Ordering::SeqCst)
        {
            let _ = self.event_tx.send(MembershipEvent::PeerVersion {
                uri: uri.to_string(),
                version,
            });
        }
    }

    /// Periodic ping of every tracked member
    async fn run_sweep(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let targets: Vec<String> = self
                .members
                .iter()
                .filter(|r| r.key() != &self.local_uri)
                .map(|r| r.key().clone())
                .collect();

            let mut sent = Vec::with_capacity(targets.len());
            for uri in targets {
                let Some(addr) = self.resolve(&uri).await else {
                    self.missed(&uri);
                    continue;
                };
                let nonce = rand::random::<u64>();
                self.pending.insert(
                    nonce,
                    PendingPing {
                        uri: uri.clone(),
                        reply: None,
                    },
                );
                if let Err(e) = self.send_message(&self.ping(nonce), addr).await {
                    trace!(uri = %uri, error = %e, "Sweep ping not sent");
                }
                sent.push(nonce);
            }

            tokio::time::sleep(self.config.ping_timeout).await;

            for nonce in sent {
                if let Some((_, pending)) = self.pending.remove(&nonce) {
                    self.missed(&pending.uri);
                }
            }

            self.check_suspect_timeouts();
            ProbeMetrics::update_members(self.members.len(), self.alive_count());
        }
    }

    /// A ping to `uri` went unanswered
    fn missed(&self, uri: &str) {
        let suspected = match self.members.get_mut(uri) {
            Some(mut member) if member.state == Liveness::Alive => {
                member.mark_suspect();
                true
            }
            _ => false,
        };
        if suspected {
            warn!(uri = %uri, "Member is suspected");
            let _ = self.event_tx.send(MembershipEvent::MemberSuspected {
                uri: uri.to_string(),
            });
        }
    }

    /// Declare suspects dead after the suspicion timeout
    fn check_suspect_timeouts(&self) {
        let timeout = self.config.ping_interval * self.config.suspicion_multiplier;
        let now = Instant::now();

        let mut dead = vec![];
        for mut member in self.members.iter_mut() {
            if member.state == Liveness::Suspect && now.duration_since(member.last_seen) > timeout {
                member.mark_dead();
                dead.push(member.uri.clone());
            }
        }

        for uri in dead {
            warn!(uri = %uri, "Member is dead");
            let _ = self.event_tx.send(MembershipEvent::MemberDead { uri });
        }
    }

    fn alive_count(&self) -> usize {
        self.members.iter().filter(|r| r.value().is_alive()).count()
    }
}
