//! In-memory network for protocol tests.
//!
//! Instances attach to a [`MockHub`] instead of a real socket; frames are
//! routed by address with UDP semantics (silent loss when a link is dropped,
//! a peer is crashed, or a receive queue is full), so multi-node scenarios
//! run in one process without touching the network stack.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;
use crate::transport::{Datagram, DatagramTransport, TransportChannel};

#[derive(Default)]
struct HubInner {
    routes: RwLock<HashMap<SocketAddr, mpsc::Sender<Datagram>>>,
    dropped_links: RwLock<HashSet<(SocketAddr, SocketAddr)>>,
    crashed: RwLock<HashSet<SocketAddr>>,
}

/// Routing fabric shared by every [`MockTransport`] of one test.
#[derive(Clone, Default)]
pub struct MockHub {
    inner: Arc<HubInner>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a transport at `addr` and returns it with its receive
    /// channel, mirroring [`crate::transport::UdpTransport::bind`].
    pub fn open(&self, addr: SocketAddr) -> (MockTransport, TransportChannel) {
        let (datagram_tx, datagram_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        self.inner.routes.write().insert(addr, datagram_tx);
        (
            MockTransport {
                addr,
                hub: self.inner.clone(),
            },
            TransportChannel { datagram_rx },
        )
    }

    /// Silently discards all traffic between `a` and `b`, both directions.
    pub fn drop_link(&self, a: SocketAddr, b: SocketAddr) {
        let mut dropped = self.inner.dropped_links.write();
        dropped.insert((a, b));
        dropped.insert((b, a));
    }

    pub fn restore_link(&self, a: SocketAddr, b: SocketAddr) {
        let mut dropped = self.inner.dropped_links.write();
        dropped.remove(&(a, b));
        dropped.remove(&(b, a));
    }

    /// Simulates a crashed process: nothing is delivered to or from `addr`
    /// until [`MockHub::revive`].
    pub fn crash(&self, addr: SocketAddr) {
        self.inner.crashed.write().insert(addr);
    }

    pub fn revive(&self, addr: SocketAddr) {
        self.inner.crashed.write().remove(&addr);
    }
}

/// A [`DatagramTransport`] attached to a [`MockHub`].
pub struct MockTransport {
    addr: SocketAddr,
    hub: Arc<HubInner>,
}

#[async_trait]
impl DatagramTransport for MockTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        {
            let crashed = self.hub.crashed.read();
            if crashed.contains(&self.addr) || crashed.contains(&addr) {
                return Ok(());
            }
        }
        if self.hub.dropped_links.read().contains(&(self.addr, addr)) {
            return Ok(());
        }
        let route = self.hub.routes.read().get(&addr).cloned();
        if let Some(tx) = route {
            // Full queue or a closed receiver is packet loss, as on the wire.
            let _ = tx.try_send((self.addr, payload.to_vec()));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.hub.routes.write().remove(&self.addr);
        Ok(())
    }
}
