use std::fmt;

/// Membership status of a node as seen by the local instance.
///
/// The wire encoding is a single byte; values are part of the protocol and
/// must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Unknown = 0,
    Alive = 1,
    Suspect = 2,
    Dead = 3,
    Left = 4,
}

impl NodeStatus {
    /// Decode a status byte from the wire. Returns `None` for values outside
    /// the protocol range so the caller can reject the frame.
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(NodeStatus::Unknown),
            1 => Some(NodeStatus::Alive),
            2 => Some(NodeStatus::Suspect),
            3 => Some(NodeStatus::Dead),
            4 => Some(NodeStatus::Left),
            _ => None,
        }
    }

    /// Whether the node should still be picked by the failure detector.
    /// Suspects keep being probed so they can be rescued by an ack.
    pub(crate) fn is_probe_eligible(&self) -> bool {
        matches!(self, NodeStatus::Alive | NodeStatus::Suspect)
    }

    pub(crate) fn is_alive(&self) -> bool {
        matches!(self, NodeStatus::Alive)
    }

    pub(crate) fn is_suspect(&self) -> bool {
        matches!(self, NodeStatus::Suspect)
    }

    pub(crate) fn is_dead(&self) -> bool {
        matches!(self, NodeStatus::Dead)
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus::Unknown
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "Unknown"),
            NodeStatus::Alive => write!(f, "Alive"),
            NodeStatus::Suspect => write!(f, "Suspect"),
            NodeStatus::Dead => write!(f, "Dead"),
            NodeStatus::Left => write!(f, "Left"),
        }
    }
}
