use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;
use tokio::time::Instant;

/// What an outstanding probe was for, and therefore what its timeout means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeMode {
    /// First phase: a ping sent straight at the target.
    Direct,
    /// Second phase: relays were asked; any forwarded ack resolves it.
    Indirect,
    /// This instance is the relay; a matching ack from the target must be
    /// forwarded to `origin`.
    Relay { origin: SocketAddr },
}

#[derive(Debug, Clone)]
pub(crate) struct PendingAck {
    pub target: SocketAddr,
    pub nonce: u32,
    pub mode: ProbeMode,
    pub start_millis: u64,
    pub deadline: Instant,
}

/// Outstanding probes, keyed by `(target, nonce)`.
///
/// The probe paths insert entries; the receive path removes them on a
/// matching ack; the reaper removes the rest at their deadline and hands
/// them to the timeout handler. The table is small (a handful of entries at
/// a time), so deadline lookups scan.
#[derive(Debug, Default)]
pub(crate) struct PendingAckTable {
    entries: RwLock<HashMap<(SocketAddr, u32), PendingAck>>,
}

impl PendingAckTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts one entry. Returns `false` (without replacing) if the same
    /// `(target, nonce)` is already outstanding.
    pub(crate) fn insert(&self, pending: PendingAck) -> bool {
        let mut entries = self.entries.write();
        let key = (pending.target, pending.nonce);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, pending);
        true
    }

    /// Resolves an ack: removes and returns the matching entry, if any.
    pub(crate) fn remove(&self, target: SocketAddr, nonce: u32) -> Option<PendingAck> {
        self.entries.write().remove(&(target, nonce))
    }

    /// Drops every outstanding probe against `target`, used once the
    /// target's status is resolved by other means.
    pub(crate) fn cancel_target(&self, target: SocketAddr) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(addr, _), _| *addr != target);
        before - entries.len()
    }

    /// Whether any probe is outstanding against `target`.
    pub(crate) fn has_target(&self, target: SocketAddr) -> bool {
        self.entries.read().keys().any(|(addr, _)| *addr == target)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.read().values().map(|p| p.deadline).min()
    }

    /// Removes and returns every entry whose deadline has passed.
    pub(crate) fn collect_expired(&self, now: Instant) -> Vec<PendingAck> {
        let mut entries = self.entries.write();
        let expired_keys: Vec<_> = entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| entries.remove(&k))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
