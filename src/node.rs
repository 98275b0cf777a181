use std::net::{IpAddr, SocketAddr};

use crate::state::NodeStatus;

/// Latest round-trip measurement for a node, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMillis {
    /// No probe has completed against this node yet.
    NoData,
    /// The most recent direct probe expired without an ack.
    TimedOut,
    Millis(u32),
}

/// A known cluster member plus the local bookkeeping attached to it.
///
/// A node's identity is its `(ip, port)` pair; everything else is volatile
/// state that gossip and the failure detector keep up to date. The registry
/// in [`crate::members`] exclusively owns these records; other components
/// refer to nodes by `SocketAddr`.
#[derive(Debug, Clone)]
pub struct Node {
    pub ip: IpAddr,
    pub port: u16,
    pub status: NodeStatus,

    /// Highest heartbeat observed for this node. Monotonically non-decreasing;
    /// orders updates about the node and ages out stale gossip.
    pub heartbeat: u32,

    /// Wall-clock milliseconds of the last local status change. Drives the
    /// suspicion window and dead/left retention.
    pub timestamp_millis: u64,

    /// Residual dissemination budget for this node's current status. Reset to
    /// the cluster-sized budget on every transition, decremented each time the
    /// update is piggybacked; eligible only while positive.
    pub emit_counter: i8,

    pub ping_millis: PingMillis,

    /// Peer that reported the current status; the local address for
    /// transitions the detector observed itself.
    pub(crate) source: SocketAddr,

    /// When this node's update was last piggybacked, for tie-breaking the
    /// piggyback selection.
    pub(crate) last_piggyback_millis: u64,
}

impl Node {
    pub(crate) fn new(addr: SocketAddr, status: NodeStatus, heartbeat: u32, now_millis: u64) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            status,
            heartbeat,
            timestamp_millis: now_millis,
            emit_counter: 0,
            ping_millis: PingMillis::NoData,
            source: addr,
            last_piggyback_millis: 0,
        }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub(crate) fn can_piggyback(&self) -> bool {
        self.emit_counter > 0
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} [{}]", self.ip, self.port, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_identity() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let node = Node::new(addr, NodeStatus::Alive, 7, 1_000);
        assert_eq!(node.address(), addr);
        assert_eq!(node.to_string(), "127.0.0.1:9001 [Alive]");
    }

    #[test]
    fn test_fresh_node_has_no_ping_data() {
        let addr: SocketAddr = "10.0.0.2:9999".parse().unwrap();
        let node = Node::new(addr, NodeStatus::Unknown, 0, 0);
        assert_eq!(node.ping_millis, PingMillis::NoData);
        assert!(!node.can_piggyback());
    }
}
