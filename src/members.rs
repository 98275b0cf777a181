use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;
use rand::seq::IteratorRandom;

use crate::config::EMIT_BUDGET_LAMBDA;
use crate::message::MemberUpdate;
use crate::node::{Node, PingMillis};
use crate::state::NodeStatus;
use crate::utils::now_millis;

/// Result of merging one remote update into the registry.
#[derive(Debug, Clone)]
pub(crate) enum MergeOutcome {
    /// The address was unknown; a record was created.
    Added(Node),
    /// The update won against the local record.
    Updated { node: Node, old_status: NodeStatus },
    /// The update carried nothing newer than the local record.
    Unchanged,
    /// The update lost against the local record.
    Ignored,
    /// The update claims the local node is suspect or dead; the caller must
    /// answer with an alive self-update above this heartbeat.
    SelfRefute { refuted_heartbeat: u32 },
}

/// The set of known members, keyed by address.
///
/// This is the single owner of [`Node`] records and the single entry point
/// for status transitions: remote gossip goes through `merge`, local
/// failure-detector verdicts through the `mark_*`/`refresh_*` methods. Both
/// serialize on the same lock, so per-node transitions are totally ordered
/// within one process.
#[derive(Debug)]
pub(crate) struct Membership {
    local_addr: SocketAddr,
    nodes: RwLock<HashMap<SocketAddr, Node>>,
}

impl Membership {
    pub(crate) fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers the local node as alive.
    pub(crate) fn init_local(&self, heartbeat: u32) {
        let mut nodes = self.nodes.write();
        let budget = emit_budget(nodes.len() + 1);
        let mut node = Node::new(self.local_addr, NodeStatus::Alive, heartbeat, now_millis());
        node.emit_counter = budget;
        nodes.insert(self.local_addr, node);
    }

    /// Seeds a peer we have been told about but never heard from. Seeds
    /// enter as alive so the prober contacts them; a wrong seed ages out
    /// through the normal suspect/dead path.
    pub(crate) fn add_seed(&self, addr: SocketAddr) {
        if addr == self.local_addr {
            return;
        }
        let mut nodes = self.nodes.write();
        nodes
            .entry(addr)
            .or_insert_with(|| Node::new(addr, NodeStatus::Alive, 0, now_millis()));
    }

    /// Returns the record for `addr`, creating an `Unknown` one if absent.
    pub(crate) fn upsert(&self, addr: SocketAddr, heartbeat: u32) -> Node {
        let mut nodes = self.nodes.write();
        nodes
            .entry(addr)
            .or_insert_with(|| Node::new(addr, NodeStatus::Unknown, heartbeat, now_millis()))
            .clone()
    }

    pub(crate) fn get(&self, addr: SocketAddr) -> Option<Node> {
        self.nodes.read().get(&addr).cloned()
    }

    /// Merges one gossiped update, one rule per incoming status:
    ///
    /// 1. Alive needs a strictly newer heartbeat to replace what is already
    ///    known (equal is enough to settle an `Unknown` record or to revive
    ///    a `Dead` one) and never unseats a departure.
    /// 2. Suspect needs an equal-or-newer heartbeat and only unseats
    ///    `Alive`, `Suspect`, or `Unknown`; a standing suspicion keeps its
    ///    window.
    /// 3. Dead is absorbing: it overwrites any state with no heartbeat
    ///    gate. The record is retained for resurrection.
    /// 4. Left is absorbing for the live states; only a death verdict or
    ///    the flush window removes it.
    /// 5. Anything else is ignored.
    ///
    /// Stored heartbeats never move backwards, and any accepted update
    /// refills the node's dissemination budget so the news keeps spreading.
    pub(crate) fn merge(&self, update: &MemberUpdate) -> MergeOutcome {
        if update.addr == self.local_addr {
            if matches!(update.status, NodeStatus::Suspect | NodeStatus::Dead) {
                return MergeOutcome::SelfRefute {
                    refuted_heartbeat: update.heartbeat,
                };
            }
            return MergeOutcome::Ignored;
        }

        let mut nodes = self.nodes.write();
        let budget = emit_budget(nodes.len().max(1));

        match nodes.entry(update.addr) {
            Entry::Vacant(slot) => {
                let mut node = Node::new(update.addr, update.status, update.heartbeat, now_millis());
                node.emit_counter = budget;
                node.source = update.source;
                MergeOutcome::Added(slot.insert(node).clone())
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let old_status = existing.status;
                let accepted = match update.status {
                    NodeStatus::Alive => match old_status {
                        NodeStatus::Left => false,
                        NodeStatus::Unknown | NodeStatus::Dead => {
                            update.heartbeat >= existing.heartbeat
                        }
                        NodeStatus::Alive | NodeStatus::Suspect => {
                            update.heartbeat > existing.heartbeat
                        }
                    },
                    NodeStatus::Suspect => {
                        matches!(
                            old_status,
                            NodeStatus::Alive | NodeStatus::Suspect | NodeStatus::Unknown
                        ) && update.heartbeat >= existing.heartbeat
                            && !(old_status == NodeStatus::Suspect
                                && update.heartbeat == existing.heartbeat)
                    }
                    NodeStatus::Dead => {
                        old_status != NodeStatus::Dead || update.heartbeat > existing.heartbeat
                    }
                    NodeStatus::Left => {
                        matches!(
                            old_status,
                            NodeStatus::Unknown | NodeStatus::Alive | NodeStatus::Suspect
                        ) || (old_status == NodeStatus::Left
                            && update.heartbeat > existing.heartbeat)
                    }
                    NodeStatus::Unknown => false,
                };
                if !accepted {
                    return if update.status == old_status
                        && update.heartbeat == existing.heartbeat
                    {
                        MergeOutcome::Unchanged
                    } else {
                        MergeOutcome::Ignored
                    };
                }

                existing.heartbeat = existing.heartbeat.max(update.heartbeat);
                existing.source = update.source;
                existing.emit_counter = budget;
                if update.status != old_status {
                    existing.status = update.status;
                    existing.timestamp_millis = now_millis();
                }
                MergeOutcome::Updated {
                    node: existing.clone(),
                    old_status,
                }
            }
        }
    }

    /// Local failure-detector verdict: the node missed its direct and
    /// indirect probes. Dead and left records are not downgraded. Returns
    /// the updated record and its previous status on an actual transition.
    pub(crate) fn mark_suspect(&self, addr: SocketAddr) -> Option<(Node, NodeStatus)> {
        let mut nodes = self.nodes.write();
        let budget = emit_budget(nodes.len().max(1));
        let node = nodes.get_mut(&addr)?;
        if !matches!(
            node.status,
            NodeStatus::Alive | NodeStatus::Unknown
        ) {
            return None;
        }
        let old_status = node.status;
        node.status = NodeStatus::Suspect;
        node.timestamp_millis = now_millis();
        node.emit_counter = budget;
        node.source = self.local_addr;
        Some((node.clone(), old_status))
    }

    /// Refreshes a node that just proved liveness with an ack or a datagram.
    /// Heartbeats only move forward. Returns the transition if the node was
    /// not alive before.
    pub(crate) fn refresh_alive(&self, addr: SocketAddr, heartbeat: u32) -> Option<(Node, NodeStatus)> {
        let mut nodes = self.nodes.write();
        let budget = emit_budget(nodes.len().max(1));
        let node = nodes.get_mut(&addr)?;
        if heartbeat > node.heartbeat {
            node.heartbeat = heartbeat;
            node.emit_counter = budget;
        }
        if node.status.is_alive() {
            return None;
        }
        let old_status = node.status;
        node.status = NodeStatus::Alive;
        node.timestamp_millis = now_millis();
        node.emit_counter = budget;
        node.source = self.local_addr;
        Some((node.clone(), old_status))
    }

    pub(crate) fn record_rtt(&self, addr: SocketAddr, rtt: PingMillis) {
        if let Some(node) = self.nodes.write().get_mut(&addr) {
            node.ping_millis = rtt;
        }
    }

    /// Keeps the local record's heartbeat in step with the probe cycle
    /// counter.
    pub(crate) fn set_local_heartbeat(&self, heartbeat: u32) {
        if let Some(node) = self.nodes.write().get_mut(&self.local_addr) {
            node.heartbeat = heartbeat;
        }
    }

    /// Reasserts the local node as alive at `heartbeat` with a fresh budget,
    /// used to refute suspicion and to announce departure reversal.
    pub(crate) fn assert_local(&self, status: NodeStatus, heartbeat: u32) -> Node {
        let mut nodes = self.nodes.write();
        let budget = emit_budget(nodes.len().max(1));
        let node = nodes
            .entry(self.local_addr)
            .or_insert_with(|| Node::new(self.local_addr, status, heartbeat, now_millis()));
        node.status = status;
        node.heartbeat = heartbeat;
        node.timestamp_millis = now_millis();
        node.emit_counter = budget;
        node.source = self.local_addr;
        node.clone()
    }

    /// Uniform random selection of up to `count` members, without
    /// replacement. The local node is never yielded; `exclude` drops
    /// further candidates.
    pub(crate) fn select_random_nodes<F>(&self, count: usize, exclude: Option<F>) -> Vec<Node>
    where
        F: Fn(&Node) -> bool,
    {
        let nodes = self.nodes.read();
        nodes
            .values()
            .filter(|n| n.address() != self.local_addr)
            .filter(|n| exclude.as_ref().map_or(true, |f| !f(n)))
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    /// Picks the next probe target: one uniform random alive-or-suspect
    /// member.
    pub(crate) fn next_probe_target(&self) -> Option<Node> {
        self.select_random_nodes(1, Some(|n: &Node| !n.status.is_probe_eligible()))
            .into_iter()
            .next()
    }

    /// Picks one dead node for a resurrection attempt.
    pub(crate) fn random_dead_node(&self) -> Option<Node> {
        self.select_random_nodes(1, Some(|n: &Node| !n.status.is_dead()))
            .into_iter()
            .next()
    }

    pub(crate) fn snapshot_by_status(&self, status: NodeStatus) -> Vec<Node> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect()
    }

    pub(crate) fn all_nodes(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Builds the piggyback pack for one outbound datagram: updates with
    /// remaining budget, preferring the largest budget and breaking ties by
    /// the longest-unsent, capped at `max_count`. Selected updates have their
    /// budget decremented and their send time stamped.
    pub(crate) fn select_piggyback_updates(&self, max_count: usize) -> Vec<MemberUpdate> {
        if max_count == 0 {
            return Vec::new();
        }
        let mut nodes = self.nodes.write();
        let mut candidates: Vec<&mut Node> = nodes
            .values_mut()
            .filter(|n| n.can_piggyback() && n.status != NodeStatus::Unknown)
            .collect();
        candidates.sort_by(|a, b| {
            b.emit_counter
                .cmp(&a.emit_counter)
                .then(a.last_piggyback_millis.cmp(&b.last_piggyback_millis))
        });

        let now = now_millis();
        candidates
            .into_iter()
            .take(max_count)
            .map(|node| {
                node.emit_counter -= 1;
                node.last_piggyback_millis = now;
                MemberUpdate {
                    addr: node.address(),
                    status: node.status,
                    heartbeat: node.heartbeat,
                    source: node.source,
                }
            })
            .collect()
    }

    /// Transitions suspects whose window elapsed to dead. Returns the
    /// transitions for event dispatch.
    pub(crate) fn expire_suspects(&self, suspicion_millis: u64) -> Vec<(Node, NodeStatus)> {
        let now = now_millis();
        let mut nodes = self.nodes.write();
        let budget = emit_budget(nodes.len().max(1));
        let mut expired = Vec::new();
        for node in nodes.values_mut() {
            if node.status.is_suspect() && now.saturating_sub(node.timestamp_millis) >= suspicion_millis
            {
                let old_status = node.status;
                node.status = NodeStatus::Dead;
                node.timestamp_millis = now;
                node.emit_counter = budget;
                node.source = self.local_addr;
                expired.push((node.clone(), old_status));
            }
        }
        expired
    }

    /// Earliest instant at which some suspect's window elapses, in wall
    /// milliseconds.
    pub(crate) fn next_suspicion_deadline_millis(&self, suspicion_millis: u64) -> Option<u64> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status.is_suspect())
            .map(|n| n.timestamp_millis + suspicion_millis)
            .min()
    }

    /// Drops dead records past the retention window and left records past
    /// the flush window. Returns the forgotten nodes.
    pub(crate) fn prune(&self, dead_retention_millis: u64, left_flush_millis: u64) -> Vec<Node> {
        let now = now_millis();
        let mut nodes = self.nodes.write();
        let mut forgotten = Vec::new();
        nodes.retain(|addr, node| {
            if *addr == self.local_addr {
                return true;
            }
            let age = now.saturating_sub(node.timestamp_millis);
            let expired = match node.status {
                NodeStatus::Dead => age > dead_retention_millis,
                NodeStatus::Left => age > left_flush_millis,
                _ => false,
            };
            if expired {
                forgotten.push(node.clone());
            }
            !expired
        });
        forgotten
    }
}

/// Dissemination budget for a cluster of `n` known nodes:
/// `ceil(lambda * log2(n + 1))` with lambda = 2.5.
pub(crate) fn emit_budget(n: usize) -> i8 {
    let budget = (EMIT_BUDGET_LAMBDA * ((n + 1) as f64).log2()).ceil();
    budget.min(i8::MAX as f64) as i8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn update(target: &str, status: NodeStatus, heartbeat: u32) -> MemberUpdate {
        MemberUpdate {
            addr: addr(target),
            status,
            heartbeat,
            source: addr("127.0.0.1:9099"),
        }
    }

    fn registry() -> Membership {
        let members = Membership::new(addr("127.0.0.1:9001"));
        members.init_local(1);
        members
    }

    #[test]
    fn test_upsert_creates_unknown_once() {
        let members = registry();
        let node = members.upsert(addr("127.0.0.1:9002"), 7);
        assert_eq!(node.status, NodeStatus::Unknown);
        assert_eq!(node.heartbeat, 7);

        let again = members.upsert(addr("127.0.0.1:9002"), 99);
        assert_eq!(again.heartbeat, 7);
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn test_merge_higher_heartbeat_wins() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 5));

        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 6));
        assert!(matches!(outcome, MergeOutcome::Updated { .. }));

        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Suspect, 4));
        assert!(matches!(outcome, MergeOutcome::Ignored));
        assert_eq!(
            members.get(addr("127.0.0.1:9002")).unwrap().status,
            NodeStatus::Alive
        );
    }

    #[test]
    fn test_merge_suspect_beats_alive_at_equal_heartbeat() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 5));
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Suspect, 5));
        assert!(matches!(outcome, MergeOutcome::Updated { .. }));

        // The refutation needs a strictly higher heartbeat.
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 5));
        assert!(matches!(outcome, MergeOutcome::Ignored));
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 6));
        assert!(matches!(outcome, MergeOutcome::Updated { .. }));
    }

    #[test]
    fn test_merge_alive_revives_dead_at_equal_or_newer_heartbeat() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Dead, 5));

        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 4));
        assert!(matches!(outcome, MergeOutcome::Ignored));

        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 5));
        assert!(matches!(outcome, MergeOutcome::Updated { .. }));
        assert_eq!(
            members.get(addr("127.0.0.1:9002")).unwrap().status,
            NodeStatus::Alive
        );
    }

    #[test]
    fn test_merge_suspect_cannot_unseat_dead_or_left() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Dead, 5));
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Suspect, 10));
        assert!(matches!(outcome, MergeOutcome::Ignored));
        assert_eq!(
            members.get(addr("127.0.0.1:9002")).unwrap().status,
            NodeStatus::Dead
        );

        members.merge(&update("127.0.0.1:9003", NodeStatus::Left, 5));
        let outcome = members.merge(&update("127.0.0.1:9003", NodeStatus::Suspect, 10));
        assert!(matches!(outcome, MergeOutcome::Ignored));
        assert_eq!(
            members.get(addr("127.0.0.1:9003")).unwrap().status,
            NodeStatus::Left
        );
    }

    #[test]
    fn test_merge_dead_overwrites_regardless_of_heartbeat() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 100));

        // The detector that actually caught the failure may know a lower
        // heartbeat than a fresher-looking record elsewhere.
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Dead, 1));
        assert!(matches!(outcome, MergeOutcome::Updated { .. }));
        let node = members.get(addr("127.0.0.1:9002")).unwrap();
        assert_eq!(node.status, NodeStatus::Dead);
        assert_eq!(node.heartbeat, 100);

        // A stale copy of the verdict changes nothing further.
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Dead, 1));
        assert!(matches!(outcome, MergeOutcome::Ignored));
    }

    #[test]
    fn test_merge_left_is_absorbing_for_live_states() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 100));

        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Left, 1));
        assert!(matches!(outcome, MergeOutcome::Updated { .. }));
        let node = members.get(addr("127.0.0.1:9002")).unwrap();
        assert_eq!(node.status, NodeStatus::Left);
        assert_eq!(node.heartbeat, 100);

        // A departed node is not resurrected by liveness gossip.
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 200));
        assert!(matches!(outcome, MergeOutcome::Ignored));

        // A death verdict still lands.
        let outcome = members.merge(&update("127.0.0.1:9002", NodeStatus::Dead, 1));
        assert!(matches!(outcome, MergeOutcome::Updated { .. }));
        assert_eq!(
            members.get(addr("127.0.0.1:9002")).unwrap().status,
            NodeStatus::Dead
        );
    }

    #[test]
    fn test_merge_order_insensitive_for_liveness_updates() {
        let statuses = [NodeStatus::Alive, NodeStatus::Suspect];
        let heartbeats = [3u32, 4, 5];

        for s1 in statuses {
            for s2 in statuses {
                for h1 in heartbeats {
                    for h2 in heartbeats {
                        let u1 = update("127.0.0.1:9002", s1, h1);
                        let u2 = update("127.0.0.1:9002", s2, h2);

                        let a = registry();
                        a.merge(&u1);
                        a.merge(&u2);
                        let b = registry();
                        b.merge(&u2);
                        b.merge(&u1);

                        let left = a.get(addr("127.0.0.1:9002")).unwrap();
                        let right = b.get(addr("127.0.0.1:9002")).unwrap();
                        assert_eq!(
                            (left.status, left.heartbeat),
                            (right.status, right.heartbeat),
                            "order dependence for {s1:?}/{h1} vs {s2:?}/{h2}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_merge_about_self_demands_refutation() {
        let members = registry();
        let outcome = members.merge(&update("127.0.0.1:9001", NodeStatus::Suspect, 9));
        assert!(matches!(
            outcome,
            MergeOutcome::SelfRefute { refuted_heartbeat: 9 }
        ));

        let outcome = members.merge(&update("127.0.0.1:9001", NodeStatus::Alive, 3));
        assert!(matches!(outcome, MergeOutcome::Ignored));
    }

    #[test]
    fn test_random_selection_excludes_local() {
        let members = registry();
        for port in 9002..9012 {
            members.merge(&update(&format!("127.0.0.1:{port}"), NodeStatus::Alive, 1));
        }
        for _ in 0..50 {
            let picked = members.select_random_nodes::<fn(&Node) -> bool>(4, None);
            assert_eq!(picked.len(), 4);
            assert!(picked.iter().all(|n| n.address() != addr("127.0.0.1:9001")));
            let mut addrs: Vec<_> = picked.iter().map(Node::address).collect();
            addrs.dedup();
            assert_eq!(addrs.len(), 4);
        }
    }

    #[test]
    fn test_probe_target_includes_suspects_not_dead() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Suspect, 1));
        members.merge(&update("127.0.0.1:9003", NodeStatus::Dead, 1));

        for _ in 0..20 {
            let target = members.next_probe_target().unwrap();
            assert_eq!(target.address(), addr("127.0.0.1:9002"));
        }
        assert_eq!(
            members.random_dead_node().unwrap().address(),
            addr("127.0.0.1:9003")
        );
    }

    #[test]
    fn test_piggyback_selection_decrements_budget() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 2));
        let before = members.get(addr("127.0.0.1:9002")).unwrap().emit_counter;
        assert!(before > 0);

        let picked = members.select_piggyback_updates(8);
        assert!(picked.iter().any(|u| u.addr == addr("127.0.0.1:9002")));
        let after = members.get(addr("127.0.0.1:9002")).unwrap().emit_counter;
        assert_eq!(after, before - 1);
    }

    #[test]
    fn test_piggyback_budget_runs_dry() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 2));
        let budget = members.get(addr("127.0.0.1:9002")).unwrap().emit_counter;

        let mut last = budget + 1;
        for _ in 0..budget {
            let picked = members.select_piggyback_updates(8);
            let node = members.get(addr("127.0.0.1:9002")).unwrap();
            if picked.iter().any(|u| u.addr == addr("127.0.0.1:9002")) {
                assert!(node.emit_counter < last);
                last = node.emit_counter;
            }
        }
        // Local node's budget drains too; eventually nothing is eligible.
        loop {
            if members.select_piggyback_updates(8).is_empty() {
                break;
            }
        }
        assert!(!members.get(addr("127.0.0.1:9002")).unwrap().can_piggyback());
    }

    #[test]
    fn test_mark_suspect_never_downgrades_dead() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Alive, 2));
        let (node, old) = members.mark_suspect(addr("127.0.0.1:9002")).unwrap();
        assert_eq!(node.status, NodeStatus::Suspect);
        assert_eq!(old, NodeStatus::Alive);

        // Already suspect: no transition to report.
        assert!(members.mark_suspect(addr("127.0.0.1:9002")).is_none());

        members.merge(&update("127.0.0.1:9003", NodeStatus::Dead, 2));
        assert!(members.mark_suspect(addr("127.0.0.1:9003")).is_none());
        assert_eq!(
            members.get(addr("127.0.0.1:9003")).unwrap().status,
            NodeStatus::Dead
        );
    }

    #[test]
    fn test_expire_suspects_and_deadline() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Suspect, 2));
        assert!(members.next_suspicion_deadline_millis(10_000).is_some());

        assert!(members.expire_suspects(10_000).is_empty());
        let expired = members.expire_suspects(0);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0.status, NodeStatus::Dead);
        assert_eq!(expired[0].1, NodeStatus::Suspect);
        assert!(members.next_suspicion_deadline_millis(10_000).is_none());
    }

    #[test]
    fn test_prune_drops_expired_dead() {
        let members = registry();
        members.merge(&update("127.0.0.1:9002", NodeStatus::Dead, 2));
        assert!(members.prune(60_000, 60_000).is_empty());

        std::thread::sleep(std::time::Duration::from_millis(2));
        let forgotten = members.prune(0, 0);
        assert_eq!(forgotten.len(), 1);
        assert!(members.get(addr("127.0.0.1:9002")).is_none());
        // The local record survives any prune.
        assert!(members.get(addr("127.0.0.1:9001")).is_some());
    }

    #[test]
    fn test_emit_budget_scales_with_cluster() {
        assert_eq!(emit_budget(1), 3);
        assert_eq!(emit_budget(3), 5);
        assert_eq!(emit_budget(7), 8);
        assert!(emit_budget(1000) < i8::MAX);
    }
}
