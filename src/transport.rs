use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, warn};

use crate::backoff::BackOff;
use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;

/// One received frame: source address and raw bytes.
pub type Datagram = (SocketAddr, Vec<u8>);

/// The socket seam of the protocol.
///
/// The default implementation is one bound UDP socket; tests plug in an
/// in-memory network (see [`crate::testing`]).
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;
    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
}

/// Receiving half handed to the dispatcher.
pub struct TransportChannel {
    pub(crate) datagram_rx: mpsc::Receiver<Datagram>,
}

/// A single bound UDP socket used for both sending and receiving, so the
/// source address of outgoing frames is the node's listen address.
pub struct UdpTransport {
    socket: Arc<TokioUdpSocket>,
    max_datagram: usize,
    shutdown_tx: broadcast::Sender<()>,
}

impl UdpTransport {
    /// Binds the socket and starts the receive loop. Incoming frames arrive
    /// on the returned channel until shutdown.
    pub async fn bind(addr: SocketAddr, max_datagram: usize) -> Result<(Self, TransportChannel)> {
        let socket = Arc::new(
            TokioUdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind UDP socket on {addr}"))?,
        );
        let (datagram_tx, datagram_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let transport = Self {
            socket: socket.clone(),
            max_datagram,
            shutdown_tx,
        };
        tokio::spawn(Self::receive_loop(
            socket,
            max_datagram,
            datagram_tx,
            shutdown_rx,
        ));

        Ok((transport, TransportChannel { datagram_rx }))
    }

    async fn receive_loop(
        socket: Arc<TokioUdpSocket>,
        max_datagram: usize,
        datagram_tx: mpsc::Sender<Datagram>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut backoff = BackOff::new();
        let mut buf = vec![0u8; max_datagram];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => {
                        backoff.reset();
                        if datagram_tx.send((addr, buf[..len].to_vec())).await.is_err() {
                            debug!("datagram channel closed, stopping UDP receive loop");
                            return;
                        }
                    }
                    Err(e) => {
                        let failures = backoff.inc_failure();
                        let delay = backoff.calculate_delay();
                        warn!(
                            "UDP receive error: {e}. consecutive failures: {failures}, \
                             retrying in {delay:?}"
                        );
                        tokio::select! {
                            _ = time::sleep(delay) => {}
                            _ = shutdown_rx.recv() => return,
                        }
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("shutdown received, stopping UDP receive loop");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("UDP socket has no local address")
    }

    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_datagram {
            return Err(anyhow!(
                "datagram too large: allowed {} bytes but got {}",
                self.max_datagram,
                payload.len()
            ));
        }
        self.socket
            .send_to(payload, addr)
            .await
            .with_context(|| format!("failed to send datagram to {addr}"))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        Ok(())
    }
}
