// In-memory shapes of everything that crosses the wire. The byte layout
// itself lives in `codec`.
use std::net::SocketAddr;

use tokio_util::bytes::Bytes;

use crate::state::NodeStatus;

/// Protocol verb, low four bits of the first wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verb {
    /// Direct probe; the receiver answers with an `Ack` echoing the nonce.
    Ping = 1,
    /// Acknowledgement. Carries a target block when forwarded by a relay.
    Ack = 2,
    /// Ask the receiver to probe the node in the target block on our behalf.
    PingReq = 3,
    /// Relay-side probe of the indirect path. Handled like a `Ping` by the
    /// target, but the echoed nonce belongs to the originator.
    NfPing = 4,
}

impl Verb {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Verb::Ping),
            2 => Some(Verb::Ack),
            3 => Some(Verb::PingReq),
            4 => Some(Verb::NfPing),
            _ => None,
        }
    }
}

/// A single piggybacked membership update: what we know about `addr` and who
/// originally observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUpdate {
    pub addr: SocketAddr,
    pub status: NodeStatus,
    pub heartbeat: u32,
    pub source: SocketAddr,
}

/// An application broadcast riding on membership traffic.
///
/// Identity is `(origin, index)`; receivers keep a bounded cache of recently
/// seen identities so redundant copies are not redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub origin: SocketAddr,
    pub index: u32,
    pub payload: Bytes,
}

impl Broadcast {
    pub(crate) fn id(&self) -> (SocketAddr, u32) {
        (self.origin, self.index)
    }
}

/// One decoded (or to-be-encoded) datagram.
///
/// `sender` is resolved from the UDP source address on receive and never
/// encoded; the single bound socket guarantees the source port is the
/// sender's listen port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub verb: Verb,
    pub sender_heartbeat: u32,
    pub nonce: u32,
    pub sender: SocketAddr,
    /// Probe target, present on `PingReq` and on relayed `Ack`s.
    pub target: Option<SocketAddr>,
    pub members: Vec<MemberUpdate>,
    pub broadcast: Option<Broadcast>,
}

impl Message {
    pub(crate) fn new(verb: Verb, sender: SocketAddr, sender_heartbeat: u32, nonce: u32) -> Self {
        Self {
            verb,
            sender_heartbeat,
            nonce,
            sender,
            target: None,
            members: Vec::new(),
            broadcast: None,
        }
    }
}
