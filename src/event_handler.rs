use std::error::Error;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::bytes::Bytes;

use crate::node::Node;
use crate::state::NodeStatus;

/// [`DispatchEventHandler`] is the host process's view into the protocol.
///
/// The detector never surfaces per-probe errors; these callbacks are the
/// only user-visible events. Handler errors are logged and otherwise
/// ignored so a misbehaving host cannot stall the protocol loops.
#[async_trait]
pub trait DispatchEventHandler: Send + Sync {
    /// A node's status changed, whether observed locally by the failure
    /// detector or learned through gossip.
    async fn notify_status_change(
        &self,
        node: &Node,
        old_status: NodeStatus,
        new_status: NodeStatus,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// A broadcast was accepted for the first time. Called at most once per
    /// `(origin, index)` identity per process.
    async fn notify_broadcast(
        &self,
        origin: SocketAddr,
        payload: Bytes,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}
