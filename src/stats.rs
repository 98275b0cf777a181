use std::sync::atomic::{AtomicU64, Ordering};

/// Internal protocol counters.
///
/// The detector never surfaces per-probe errors to the host; these counters
/// are the observable record of what the protocol has been doing.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) probes_sent: AtomicU64,
    pub(crate) acks_received: AtomicU64,
    pub(crate) probe_timeouts: AtomicU64,
    pub(crate) suspects: AtomicU64,
    pub(crate) deaths: AtomicU64,
    pub(crate) resurrections: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) broadcasts_applied: AtomicU64,
    pub(crate) broadcasts_suppressed: AtomicU64,
    pub(crate) malformed_datagrams: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub probes_sent: u64,
    pub acks_received: u64,
    pub probe_timeouts: u64,
    pub suspects: u64,
    pub deaths: u64,
    pub resurrections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub broadcasts_applied: u64,
    pub broadcasts_suppressed: u64,
    pub malformed_datagrams: u64,
}

impl Stats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            probe_timeouts: self.probe_timeouts.load(Ordering::Relaxed),
            suspects: self.suspects.load(Ordering::Relaxed),
            deaths: self.deaths.load(Ordering::Relaxed),
            resurrections: self.resurrections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            broadcasts_applied: self.broadcasts_applied.load(Ordering::Relaxed),
            broadcasts_suppressed: self.broadcasts_suppressed.load(Ordering::Relaxed),
            malformed_datagrams: self.malformed_datagrams.load(Ordering::Relaxed),
        }
    }
}
