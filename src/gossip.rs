use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::message::Broadcast;

/// A broadcast waiting for dissemination, with its residual budget.
#[derive(Debug, Clone)]
struct QueuedBroadcast {
    broadcast: Broadcast,
    emit_counter: i8,
}

/// Outbound broadcast queue.
///
/// At most one broadcast rides on each outgoing datagram; the queue hands
/// out the one with the most budget left and decrements it, dropping the
/// entry once the budget is spent.
#[derive(Debug, Default)]
pub(crate) struct BroadcastQueue {
    queue: RwLock<HashMap<(SocketAddr, u32), QueuedBroadcast>>,
    next_index: AtomicU32,
}

impl BroadcastQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Index for the next locally originated broadcast.
    pub(crate) fn next_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a broadcast with a fresh budget, or refreshes the budget of an
    /// already queued copy.
    pub(crate) fn enqueue(&self, broadcast: Broadcast, budget: i8) {
        let mut queue = self.queue.write();
        queue.insert(
            broadcast.id(),
            QueuedBroadcast {
                broadcast,
                emit_counter: budget,
            },
        );
    }

    /// Picks the broadcast with the highest remaining budget whose payload
    /// is at most `max_payload` bytes, decrementing the budget. Spent
    /// entries are removed.
    pub(crate) fn select(&self, max_payload: usize) -> Option<Broadcast> {
        let mut queue = self.queue.write();
        let key = queue
            .iter()
            .filter(|(_, q)| q.emit_counter > 0 && q.broadcast.payload.len() <= max_payload)
            .max_by_key(|(id, q)| (q.emit_counter, id.1))
            .map(|(id, _)| *id)?;

        let entry = queue.get_mut(&key)?;
        entry.emit_counter -= 1;
        let broadcast = entry.broadcast.clone();
        if entry.emit_counter <= 0 {
            queue.remove(&key);
        }
        Some(broadcast)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.read().len()
    }
}

/// Bounded record of recently seen broadcast identities.
///
/// Receivers suppress re-delivery of a broadcast they have already applied;
/// the bound keeps memory flat while redundant copies are still in flight.
#[derive(Debug)]
pub(crate) struct SeenCache {
    capacity: usize,
    entries: Mutex<SeenEntries>,
}

#[derive(Debug, Default)]
struct SeenEntries {
    set: HashSet<(SocketAddr, u32)>,
    order: VecDeque<(SocketAddr, u32)>,
}

impl SeenCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(SeenEntries::default()),
        }
    }

    /// Records a broadcast identity. Returns `true` on first sight and
    /// `false` for a duplicate.
    pub(crate) fn observe(&self, id: (SocketAddr, u32)) -> bool {
        let mut entries = self.entries.lock();
        if !entries.set.insert(id) {
            return false;
        }
        entries.order.push_back(id);
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.set.remove(&oldest);
            }
        }
        true
    }
}
