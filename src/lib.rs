use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tokio_util::bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::codec::WireCodec;
use crate::config::{LEAVE_FANOUT, REAPER_FALLBACK_MILLIS, SEEN_BROADCAST_CACHE_SIZE};
use crate::gossip::{BroadcastQueue, SeenCache};
use crate::members::{emit_budget, Membership, MergeOutcome};
use crate::message::{Message, Verb};
use crate::pending::{PendingAck, PendingAckTable, ProbeMode};
use crate::utils::{now_millis, pretty_debug};

mod backoff;
mod codec;
pub mod config;
mod event_handler;
mod gossip;
mod ip_addr;
mod members;
mod message;
mod node;
mod pending;
mod state;
mod stats;
pub mod testing;
mod transport;
mod utils;

pub use codec::CodecError;
pub use config::{ConfigError, IpFamily, ScuttleConfig, ScuttleConfigBuilder};
pub use event_handler::DispatchEventHandler;
pub use ip_addr::IpAddress;
pub use message::{Broadcast, MemberUpdate};
pub use node::{Node, PingMillis};
pub use state::NodeStatus;
pub use stats::{Stats, StatsSnapshot};
pub use transport::{Datagram, DatagramTransport, TransportChannel, UdpTransport};

// # SWIM membership for SCUTTLE
//
/// Scuttle keeps an eventually-consistent view of a cluster's live members
/// over a single UDP socket. Three cooperating pieces do the work:
///
/// * Failure detector: every heartbeat period one random member is pinged.
///   A missed ack escalates to indirect pings through random relays; a
///   missed indirect round makes the member a suspect, and an unrefuted
///   suspicion window makes it dead. Dead members are retained for a while,
///   periodically probed for resurrection, and finally forgotten.
///
/// * Gossip: every outbound datagram piggybacks the member updates with the
///   most dissemination budget left, plus at most one application
///   broadcast. Budgets are sized to O(log N) so news reaches the whole
///   cluster in O(log N) rounds without dedicated traffic.
///
/// * Codec: a compact big-endian binary format, bit-compatible across
///   implementations; see `codec` for the exact layout.
///
/// Each member maintains a heartbeat counter that only it increments.
/// Liveness claims about a node must outrun the heartbeat already on
/// record, suspicion needs an equal-or-newer heartbeat, and death or
/// departure verdicts are absorbing until fresher evidence revives the
/// node. A falsely accused node refutes suspicion by reasserting itself
/// one heartbeat higher.
pub struct Scuttle {
    inner: Arc<InnerScuttle>,
}

enum ScuttleState {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct InnerScuttle {
    /// Configuration settings for this instance.
    config: ScuttleConfig,

    /// Map of all known members and their current state.
    members: Membership,

    /// Pure wire codec, fixed to this cluster's address family.
    codec: WireCodec,

    /// Outstanding probes awaiting acks.
    pending: PendingAckTable,

    /// Application broadcasts awaiting dissemination.
    broadcasts: BroadcastQueue,

    /// Recently seen broadcast identities, for duplicate suppression.
    seen: SeenCache,

    /// Communication layer for sending and receiving datagrams.
    transport: Arc<dyn DatagramTransport>,

    /// Receive half of the transport, taken by `start`.
    channel: Mutex<Option<TransportChannel>>,

    /// Current lifecycle state of the instance.
    state: RwLock<ScuttleState>,

    /// Channel sender for initiating shutdown.
    shutdown: broadcast::Sender<()>,

    /// The local heartbeat counter, bumped once per probe cycle.
    heartbeat: AtomicU32,

    /// Monotonically increasing probe correlation ids.
    nonce: AtomicU32,

    stats: Stats,

    /// Host callbacks for status changes and delivered broadcasts.
    event_handler: Option<Arc<dyn DispatchEventHandler>>,
}

impl Clone for Scuttle {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Scuttle {
    /// Creates an instance bound to the configured UDP address.
    pub async fn new(config: ScuttleConfig) -> Result<Self> {
        let (transport, channel) =
            UdpTransport::bind(config.listen_addr(), config.max_datagram_bytes).await?;
        Self::with_custom(config, Arc::new(transport), channel, None)
    }

    /// Like [`Scuttle::new`] with host callbacks attached.
    pub async fn with_event_handler(
        config: ScuttleConfig,
        event_handler: Arc<dyn DispatchEventHandler>,
    ) -> Result<Self> {
        let (transport, channel) =
            UdpTransport::bind(config.listen_addr(), config.max_datagram_bytes).await?;
        Self::with_custom(config, Arc::new(transport), channel, Some(event_handler))
    }

    /// Creates an instance over a caller-supplied transport, used by tests
    /// to run clusters over an in-memory network.
    pub fn with_custom(
        config: ScuttleConfig,
        transport: Arc<dyn DatagramTransport>,
        channel: TransportChannel,
        event_handler: Option<Arc<dyn DispatchEventHandler>>,
    ) -> Result<Self> {
        let local_addr = transport.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let codec = WireCodec::new(
            config.ip_family(),
            config.max_datagram_bytes,
            config.max_broadcast_bytes,
        );

        Ok(Self {
            inner: Arc::new(InnerScuttle {
                members: Membership::new(local_addr),
                codec,
                pending: PendingAckTable::new(),
                broadcasts: BroadcastQueue::new(),
                seen: SeenCache::new(SEEN_BROADCAST_CACHE_SIZE),
                transport,
                channel: Mutex::new(Some(channel)),
                state: RwLock::new(ScuttleState::Idle),
                shutdown: shutdown_tx,
                heartbeat: AtomicU32::new(0),
                nonce: AtomicU32::new(0),
                stats: Stats::default(),
                event_handler,
                config,
            }),
        })
    }

    /// Runs the protocol until [`Scuttle::stop`] is called: binds the local
    /// record, seeds configured peers, and drives the probe scheduler, the
    /// receive dispatcher, and the timeout reaper.
    pub async fn start(&self) -> Result<()> {
        let channel = self
            .inner
            .channel
            .lock()
            .take()
            .ok_or_else(|| anyhow!("instance was already started"))?;

        info!(addr = %self.local_addr(), "starting membership instance");
        // Every receiver must exist before `stop` can possibly fire, or its
        // signal would be missed.
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let dispatcher_rx = self.inner.shutdown.subscribe();
        let scheduler_rx = self.inner.shutdown.subscribe();
        let reaper_rx = self.inner.shutdown.subscribe();
        *self.inner.state.write() = ScuttleState::Running;

        self.inner.heartbeat.store(1, Ordering::SeqCst);
        self.inner.members.init_local(1);
        for seed in self.inner.config.seed_nodes.clone() {
            self.inner.members.add_seed(seed);
        }

        let dispatcher = self.spawn_dispatcher(channel, dispatcher_rx);
        let scheduler = self.spawn_probe_scheduler(scheduler_rx);
        let reaper = self.spawn_reaper(reaper_rx);

        let _ = shutdown_rx.recv().await;
        info!("initiating graceful shutdown");

        self.leave().await;
        let _ = tokio::join!(dispatcher, scheduler, reaper);
        if let Err(e) = self.inner.transport.shutdown().await {
            warn!("transport shutdown failed: {e}");
        }
        *self.inner.state.write() = ScuttleState::Stopped;

        info!("membership instance stopped");
        Ok(())
    }

    /// Requests an orderly shutdown of a running instance.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        match *state {
            ScuttleState::Running => {
                *state = ScuttleState::Stopped;
                self.inner
                    .shutdown
                    .send(())
                    .map_err(|e| anyhow!(e.to_string()))?;
                Ok(())
            }
            ScuttleState::Idle => Err(anyhow!("instance is not running")),
            ScuttleState::Stopped => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.read(), ScuttleState::Running)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.members.local_addr()
    }

    /// Seeds a peer by address.
    pub fn add_node(&self, addr: SocketAddr) -> Result<()> {
        if !self.inner.config.ip_family().matches(addr.ip()) {
            return Err(anyhow!(
                "peer {addr} does not match cluster ip family {:?}",
                self.inner.config.ip_family()
            ));
        }
        self.inner.members.add_seed(addr);
        Ok(())
    }

    /// Snapshot of every known member.
    pub fn members(&self) -> Vec<Node> {
        self.inner.members.all_nodes()
    }

    /// Snapshot of members currently in `status`.
    pub fn members_with_status(&self, status: NodeStatus) -> Vec<Node> {
        self.inner.members.snapshot_by_status(status)
    }

    /// Snapshot of the protocol counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Enqueues an application broadcast for cluster-wide dissemination.
    ///
    /// Delivery is best-effort and at-least-once on the wire; receivers
    /// apply it at most once. The local handler is invoked immediately.
    pub async fn broadcast_bytes(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.inner.config.max_broadcast_bytes {
            return Err(anyhow!(
                "broadcast of {} bytes exceeds maximum of {}",
                payload.len(),
                self.inner.config.max_broadcast_bytes
            ));
        }
        let broadcast = Broadcast {
            origin: self.local_addr(),
            index: self.inner.broadcasts.next_index(),
            payload: Bytes::copy_from_slice(payload),
        };
        self.inner.seen.observe(broadcast.id());
        self.inner
            .broadcasts
            .enqueue(broadcast.clone(), emit_budget(self.inner.members.len()));
        Stats::incr(&self.inner.stats.broadcasts_applied);

        if let Some(handler) = &self.inner.event_handler {
            if let Err(e) = handler
                .notify_broadcast(broadcast.origin, broadcast.payload)
                .await
            {
                warn!("broadcast handler failed: {e}");
            }
        }
        Ok(())
    }

    fn next_nonce(&self) -> u32 {
        self.inner.nonce.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn spawn_dispatcher(
        &self,
        mut channel: TransportChannel,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = channel.datagram_rx.recv() => {
                        let Some((addr, payload)) = incoming else {
                            debug!("transport channel closed, dispatcher exiting");
                            return;
                        };
                        let this = this.clone();
                        tokio::spawn(async move {
                            this.handle_datagram(addr, payload).await;
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("dispatcher shutting down");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_probe_scheduler(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut probe_interval = time::interval(this.inner.config.heartbeat);
            probe_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so seeds are probed
            // one full period after start.
            probe_interval.tick().await;
            loop {
                tokio::select! {
                    _ = probe_interval.tick() => {
                        this.probe_cycle().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("probe scheduler shutting down");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_reaper(&self, mut shutdown_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let mut wait = Duration::from_millis(REAPER_FALLBACK_MILLIS);
                if let Some(deadline) = this.inner.pending.next_deadline() {
                    wait = wait.min(deadline.saturating_duration_since(Instant::now()));
                }
                let suspicion_millis = this.inner.config.suspicion.as_millis() as u64;
                if let Some(deadline_millis) = this
                    .inner
                    .members
                    .next_suspicion_deadline_millis(suspicion_millis)
                {
                    let remaining = deadline_millis.saturating_sub(now_millis());
                    wait = wait.min(Duration::from_millis(remaining));
                }

                tokio::select! {
                    _ = time::sleep(wait) => {}
                    _ = shutdown_rx.recv() => {
                        debug!("reaper shutting down");
                        return;
                    }
                }

                for expired in this.inner.pending.collect_expired(Instant::now()) {
                    this.handle_probe_timeout(expired).await;
                }
                for (node, old_status) in this.inner.members.expire_suspects(suspicion_millis) {
                    warn!(node = %node, "suspicion window elapsed, declaring dead");
                    this.inner.pending.cancel_target(node.address());
                    this.dispatch_status_change(&node, old_status, NodeStatus::Dead)
                        .await;
                }
            }
        })
    }

    /// One probe cycle: advance the heartbeat, prune expired records, run a
    /// resurrection attempt when due, and probe one random member.
    async fn probe_cycle(&self) {
        let heartbeat = self.inner.heartbeat.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.members.set_local_heartbeat(heartbeat);

        let forgotten = self.inner.members.prune(
            self.inner.config.dead_node_retention_millis,
            self.inner.config.left_flush_millis(),
        );
        for node in &forgotten {
            debug!(node = %node, "forgetting expired record");
        }

        if heartbeat % self.inner.config.resurrection_period == 0 {
            self.resurrection_probe().await;
        }

        let Some(target) = self.inner.members.next_probe_target() else {
            debug!("no probe-eligible members");
            return;
        };
        let target_addr = target.address();
        if self.inner.pending.has_target(target_addr) {
            debug!(peer = %target, "probe already outstanding, skipping");
            return;
        }
        self.send_probe(target_addr, Verb::Ping, ProbeMode::Direct, self.inner.config.direct_timeout)
            .await;
        debug!("{}", pretty_debug("membership:", &self.inner.members.all_nodes()));
    }

    /// Best-effort direct probe of one dead node, giving transient failures
    /// a way back in.
    async fn resurrection_probe(&self) {
        let Some(dead) = self.inner.members.random_dead_node() else {
            return;
        };
        let addr = dead.address();
        if self.inner.pending.has_target(addr) {
            return;
        }
        debug!(node = %dead, "attempting resurrection probe");
        self.send_probe(addr, Verb::Ping, ProbeMode::Direct, self.inner.config.direct_timeout)
            .await;
    }

    async fn send_probe(
        &self,
        target: SocketAddr,
        verb: Verb,
        mode: ProbeMode,
        timeout: Duration,
    ) {
        let nonce = self.next_nonce();
        let inserted = self.inner.pending.insert(PendingAck {
            target,
            nonce,
            mode,
            start_millis: now_millis(),
            deadline: Instant::now() + timeout,
        });
        if !inserted {
            debug!(peer = %target, nonce, "probe with this nonce already outstanding");
            return;
        }
        Stats::incr(&self.inner.stats.probes_sent);
        let msg = self.build_message(verb, nonce, None);
        // A failed send is indistinguishable from a lost packet; the pending
        // entry stays and the reaper resolves it as a timeout.
        self.send_message(target, msg).await;
    }

    /// Assembles an outbound message with its piggyback pack: member updates
    /// by descending budget, plus at most one broadcast, all within the
    /// datagram size.
    fn build_message(&self, verb: Verb, nonce: u32, target: Option<SocketAddr>) -> Message {
        let mut msg = Message::new(
            verb,
            self.local_addr(),
            self.inner.heartbeat.load(Ordering::SeqCst),
            nonce,
        );
        msg.target = target;

        let base = self.inner.codec.base_len(target.is_some());
        let record = self.inner.codec.member_record_len();
        let budget = self.inner.config.max_datagram_bytes.saturating_sub(base);

        let broadcast_room = budget
            .saturating_sub(self.inner.codec.broadcast_len(0))
            .min(self.inner.config.max_broadcast_bytes);
        msg.broadcast = self.inner.broadcasts.select(broadcast_room);

        let reserved = msg
            .broadcast
            .as_ref()
            .map(|b| self.inner.codec.broadcast_len(b.payload.len()))
            .unwrap_or(0);
        let max_members = (budget.saturating_sub(reserved) / record).min(u8::MAX as usize);
        msg.members = self.inner.members.select_piggyback_updates(max_members);
        msg
    }

    async fn send_message(&self, addr: SocketAddr, mut msg: Message) {
        let bytes = match self.inner.codec.encode(&msg) {
            Ok(bytes) => bytes,
            Err(CodecError::Oversize { len, max }) => {
                // The piggyback budget keeps this from happening; fall back
                // to the bare envelope rather than dropping the probe.
                warn!("encoded datagram of {len} bytes exceeds {max}, stripping piggyback");
                msg.members.clear();
                msg.broadcast = None;
                match self.inner.codec.encode(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("failed to encode base message to {addr}: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("failed to encode message to {addr}: {e}");
                return;
            }
        };

        Stats::add(&self.inner.stats.bytes_sent, bytes.len() as u64);
        if let Err(e) = self.inner.transport.send_to(addr, &bytes).await {
            warn!("failed to send datagram to {addr}: {e}");
        }
    }

    async fn handle_datagram(&self, addr: SocketAddr, payload: Vec<u8>) {
        Stats::add(&self.inner.stats.bytes_received, payload.len() as u64);
        let msg = match self.inner.codec.decode(addr, &payload) {
            Ok(msg) => msg,
            Err(e) => {
                Stats::incr(&self.inner.stats.malformed_datagrams);
                debug!("dropping malformed datagram from {addr}: {e}");
                return;
            }
        };
        if msg.sender == self.local_addr() {
            return;
        }

        // Hearing from a node at all proves it is alive at its current
        // heartbeat.
        self.inner.members.upsert(msg.sender, msg.sender_heartbeat);
        self.apply_update(&MemberUpdate {
            addr: msg.sender,
            status: NodeStatus::Alive,
            heartbeat: msg.sender_heartbeat,
            source: self.local_addr(),
        })
        .await;

        for update in &msg.members {
            self.apply_update(update).await;
        }
        if let Some(broadcast) = msg.broadcast.clone() {
            self.apply_broadcast(broadcast).await;
        }

        match msg.verb {
            Verb::Ping | Verb::NfPing => {
                debug!(from = %msg.sender, nonce = msg.nonce, "received ping");
                self.send_ack(msg.sender, msg.nonce).await;
            }
            Verb::PingReq => self.handle_ping_req(&msg).await,
            Verb::Ack => self.handle_ack(&msg).await,
        }
    }

    async fn send_ack(&self, target: SocketAddr, nonce: u32) {
        let ack = self.build_message(Verb::Ack, nonce, None);
        self.send_message(target, ack).await;
    }

    /// Relay side of the indirect path: probe the named target with the
    /// originator's nonce and remember to forward a matching ack.
    async fn handle_ping_req(&self, msg: &Message) {
        let Some(target) = msg.target else {
            Stats::incr(&self.inner.stats.malformed_datagrams);
            debug!(from = %msg.sender, "ping-req without target block");
            return;
        };
        if target == self.local_addr() {
            // Asking us to probe ourselves answers itself.
            self.send_ack(msg.sender, msg.nonce).await;
            return;
        }
        debug!(from = %msg.sender, peer = %target, nonce = msg.nonce, "relaying indirect probe");
        let inserted = self.inner.pending.insert(PendingAck {
            target,
            nonce: msg.nonce,
            mode: ProbeMode::Relay { origin: msg.sender },
            start_millis: now_millis(),
            deadline: Instant::now() + self.inner.config.direct_timeout,
        });
        if !inserted {
            debug!(peer = %target, nonce = msg.nonce, "probe with this nonce already outstanding");
            return;
        }
        let ping = self.build_message(Verb::NfPing, msg.nonce, None);
        self.send_message(target, ping).await;
    }

    async fn handle_ack(&self, msg: &Message) {
        Stats::incr(&self.inner.stats.acks_received);
        let target = msg.target.unwrap_or(msg.sender);
        let Some(pending) = self.inner.pending.remove(target, msg.nonce) else {
            debug!(from = %msg.sender, nonce = msg.nonce, "ack without outstanding probe");
            return;
        };

        match pending.mode {
            ProbeMode::Relay { origin } => {
                debug!(peer = %target, %origin, nonce = msg.nonce, "forwarding indirect ack");
                let ack = self.build_message(Verb::Ack, msg.nonce, Some(target));
                self.send_message(origin, ack).await;
            }
            ProbeMode::Direct | ProbeMode::Indirect => {
                let rtt = now_millis().saturating_sub(pending.start_millis);
                self.inner
                    .members
                    .record_rtt(target, PingMillis::Millis(rtt.min(u32::MAX as u64) as u32));

                // Only a direct ack carries the target's own heartbeat.
                let heartbeat = if msg.sender == target {
                    msg.sender_heartbeat
                } else {
                    0
                };
                if let Some((node, old_status)) =
                    self.inner.members.refresh_alive(target, heartbeat)
                {
                    info!(node = %node, from = %old_status, "probe refreshed member to alive");
                    self.dispatch_status_change(&node, old_status, NodeStatus::Alive)
                        .await;
                }
                self.inner.pending.cancel_target(target);
            }
        }
    }

    /// Resolves an expired pending-ack entry.
    async fn handle_probe_timeout(&self, pending: PendingAck) {
        match pending.mode {
            ProbeMode::Direct => {
                Stats::incr(&self.inner.stats.probe_timeouts);
                self.inner
                    .members
                    .record_rtt(pending.target, PingMillis::TimedOut);
                let Some(node) = self.inner.members.get(pending.target) else {
                    return;
                };
                if node.status.is_dead() {
                    debug!(node = %node, "resurrection probe went unanswered");
                    return;
                }
                warn!(peer = %node, "direct probe timed out, trying indirect probes");
                self.send_indirect_probes(pending.target, pending.nonce).await;
            }
            ProbeMode::Indirect => {
                Stats::incr(&self.inner.stats.probe_timeouts);
                self.suspect_node(pending.target).await;
            }
            ProbeMode::Relay { origin } => {
                debug!(peer = %pending.target, %origin, "relayed probe went unanswered");
            }
        }
    }

    /// Second phase of failure detection: ask random live relays to probe
    /// the unresponsive target, preserving the original nonce.
    async fn send_indirect_probes(&self, target: SocketAddr, nonce: u32) {
        let inserted = self.inner.pending.insert(PendingAck {
            target,
            nonce,
            mode: ProbeMode::Indirect,
            start_millis: now_millis(),
            deadline: Instant::now() + self.inner.config.indirect_timeout,
        });
        if !inserted {
            debug!(peer = %target, nonce, "indirect probe already outstanding");
            return;
        }

        let relays = self.inner.members.select_random_nodes(
            self.inner.config.indirect_count,
            Some(|n: &Node| !n.status.is_alive() || n.address() == target),
        );
        if relays.is_empty() {
            // The indirect deadline still runs; with nobody to vouch the
            // target becomes suspect when it expires.
            debug!(peer = %target, "no relays available for indirect probes");
            return;
        }
        for relay in &relays {
            let ping_req = self.build_message(Verb::PingReq, nonce, Some(target));
            self.send_message(relay.address(), ping_req).await;
        }
        debug!(peer = %target, relays = relays.len(), "sent indirect probes");
    }

    async fn suspect_node(&self, target: SocketAddr) {
        if let Some((node, old_status)) = self.inner.members.mark_suspect(target) {
            warn!(node = %node, "no ack from direct or indirect probes, now suspect");
            self.dispatch_status_change(&node, old_status, NodeStatus::Suspect)
                .await;
        }
    }

    /// Applies one gossiped member update to the registry and dispatches
    /// whatever it caused.
    async fn apply_update(&self, update: &MemberUpdate) {
        match self.inner.members.merge(update) {
            MergeOutcome::Added(node) => {
                debug!(node = %node, "learned about new member");
                if node.status != NodeStatus::Unknown {
                    self.dispatch_status_change(&node, NodeStatus::Unknown, node.status)
                        .await;
                }
            }
            MergeOutcome::Updated { node, old_status } => {
                if node.status != old_status {
                    info!(node = %node, from = %old_status, "member status changed via gossip");
                    if !node.status.is_suspect() {
                        self.inner.pending.cancel_target(node.address());
                    }
                    self.dispatch_status_change(&node, old_status, node.status).await;
                }
            }
            MergeOutcome::SelfRefute { refuted_heartbeat } => {
                self.refute_suspicion(refuted_heartbeat).await;
            }
            MergeOutcome::Unchanged | MergeOutcome::Ignored => {}
        }
    }

    /// Someone claims we are suspect or dead; reassert ourselves above the
    /// refuted heartbeat so the next piggyback pack carries the correction.
    async fn refute_suspicion(&self, refuted_heartbeat: u32) {
        let mut current = self.inner.heartbeat.load(Ordering::SeqCst);
        loop {
            let next = current.max(refuted_heartbeat).wrapping_add(1);
            match self.inner.heartbeat.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    info!(
                        refuted = refuted_heartbeat,
                        reasserted = next,
                        "refuting suspicion about the local node"
                    );
                    self.inner.members.assert_local(NodeStatus::Alive, next);
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Applies a received broadcast: first sighting goes to the host
    /// callback and back into the queue for further dissemination,
    /// duplicates are suppressed.
    async fn apply_broadcast(&self, broadcast: Broadcast) {
        if !self.inner.seen.observe(broadcast.id()) {
            Stats::incr(&self.inner.stats.broadcasts_suppressed);
            return;
        }
        Stats::incr(&self.inner.stats.broadcasts_applied);
        debug!(
            origin = %broadcast.origin,
            index = broadcast.index,
            queued = self.inner.broadcasts.len(),
            "applying broadcast"
        );

        self.inner
            .broadcasts
            .enqueue(broadcast.clone(), emit_budget(self.inner.members.len()));

        if let Some(handler) = &self.inner.event_handler {
            if let Err(e) = handler
                .notify_broadcast(broadcast.origin, broadcast.payload)
                .await
            {
                warn!("broadcast handler failed: {e}");
            }
        }
    }

    async fn dispatch_status_change(
        &self,
        node: &Node,
        old_status: NodeStatus,
        new_status: NodeStatus,
    ) {
        match new_status {
            NodeStatus::Suspect => Stats::incr(&self.inner.stats.suspects),
            NodeStatus::Dead => Stats::incr(&self.inner.stats.deaths),
            NodeStatus::Alive if old_status.is_dead() => {
                Stats::incr(&self.inner.stats.resurrections)
            }
            _ => {}
        }
        if let Some(handler) = &self.inner.event_handler {
            if let Err(e) = handler
                .notify_status_change(node, old_status, new_status)
                .await
            {
                warn!("status change handler failed: {e}");
            }
        }
    }

    /// Final courtesy on shutdown: gossip a `Left` self-update to a few
    /// live peers, once, best effort.
    async fn leave(&self) {
        let heartbeat = self.inner.heartbeat.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.members.assert_local(NodeStatus::Left, heartbeat);

        let peers = self
            .inner
            .members
            .select_random_nodes(LEAVE_FANOUT, Some(|n: &Node| !n.status.is_alive()));
        for peer in &peers {
            let msg = self.build_message(Verb::Ping, self.next_nonce(), None);
            self.send_message(peer.address(), msg).await;
        }
        debug!(
            peers = peers.len(),
            abandoned_probes = self.inner.pending.len(),
            "left the cluster"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHub;

    fn instance(port: u16) -> Scuttle {
        let config = ScuttleConfig::builder()
            .listen_ip("127.0.0.1")
            .listen_port(port)
            .build()
            .unwrap();
        let hub = MockHub::new();
        let (transport, channel) = hub.open(config.listen_addr());
        let scuttle = Scuttle::with_custom(config, Arc::new(transport), channel, None).unwrap();
        scuttle.inner.heartbeat.store(1, Ordering::SeqCst);
        scuttle.inner.members.init_local(1);
        scuttle
    }

    fn update(target: &str, status: NodeStatus, heartbeat: u32) -> MemberUpdate {
        MemberUpdate {
            addr: target.parse().unwrap(),
            status,
            heartbeat,
            source: "127.0.0.1:9099".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_self_refutation_rides_next_datagram() {
        let scuttle = instance(9101);
        let local = scuttle.local_addr();

        scuttle
            .apply_update(&update("127.0.0.1:9101", NodeStatus::Suspect, 9))
            .await;

        assert!(scuttle.inner.heartbeat.load(Ordering::SeqCst) > 9);
        let msg = scuttle.build_message(Verb::Ping, 1, None);
        let self_update = msg
            .members
            .iter()
            .find(|u| u.addr == local)
            .expect("refutation should be piggybacked on the next datagram");
        assert_eq!(self_update.status, NodeStatus::Alive);
        assert!(self_update.heartbeat > 9);
    }

    #[tokio::test]
    async fn test_at_most_one_outstanding_probe_per_target() {
        let scuttle = instance(9102);
        scuttle
            .apply_update(&update("127.0.0.1:9110", NodeStatus::Alive, 2))
            .await;

        scuttle.probe_cycle().await;
        assert_eq!(scuttle.stats().probes_sent, 1);
        assert_eq!(scuttle.inner.pending.len(), 1);

        // The deadline has not expired, so the next cycle must not stack a
        // second probe on the same target.
        scuttle.probe_cycle().await;
        assert_eq!(scuttle.stats().probes_sent, 1);
        assert_eq!(scuttle.inner.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_piggyback_pack_fits_datagram() {
        let scuttle = instance(9103);
        for port in 9200..9260 {
            scuttle
                .apply_update(&update(&format!("127.0.0.1:{port}"), NodeStatus::Alive, 3))
                .await;
        }
        scuttle
            .broadcast_bytes(&[0u8; 200])
            .await
            .expect("broadcast should be accepted");

        let msg = scuttle.build_message(Verb::Ping, 1, None);
        assert!(msg.broadcast.is_some());
        assert!(!msg.members.is_empty());

        let bytes = scuttle.inner.codec.encode(&msg).unwrap();
        assert!(bytes.len() <= scuttle.inner.config.max_datagram_bytes);
    }

    #[tokio::test]
    async fn test_gossiped_death_cancels_outstanding_probes() {
        let scuttle = instance(9104);
        scuttle
            .apply_update(&update("127.0.0.1:9111", NodeStatus::Alive, 2))
            .await;
        scuttle.probe_cycle().await;
        assert_eq!(scuttle.inner.pending.len(), 1);

        scuttle
            .apply_update(&update("127.0.0.1:9111", NodeStatus::Dead, 2))
            .await;
        assert_eq!(scuttle.inner.pending.len(), 0);
    }
}
