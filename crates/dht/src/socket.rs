//! A single UDP socket shared by the whole engine: one receive loop, one
//! send queue. No ordering guarantee between datagrams to different
//! destinations; for a single destination, writes are FIFO but UDP may
//! still reorder them in flight.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, trace, warn};

use crate::error::{Error, Result};

const MAX_DATAGRAM: usize = 4096;

pub struct Socket {
    socket: Arc<UdpSocket>,
    send_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl Socket {
    /// Binds the socket and spawns the send-queue drain loop. The caller
    /// is responsible for driving `recv_loop` with its own dispatch logic.
    pub async fn bind(addr: SocketAddr, cancel: CancellationToken) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::Bind)?;
        let socket = Arc::new(socket);
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();

        core::spawn::spawn_with_cancel(debug_span!("dht_send_loop"), cancel, {
            let socket = socket.clone();
            async move {
                while let Some((to, datagram)) = send_rx.recv().await {
                    if let Err(e) = socket.send_to(&datagram, to).await {
                        warn!(%to, "error sending datagram: {e:#}");
                    }
                }
            }
        });

        Ok(Socket { socket, send_tx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Bind)
    }

    pub fn send(&self, to: SocketAddr, datagram: Vec<u8>) {
        trace!(%to, len = datagram.len(), "queueing datagram");
        // The send loop task owns the receiver for as long as this
        // `Socket` (and its clones) are alive, so this can only fail
        // during shutdown, at which point dropping the datagram is fine.
        let _ = self.send_tx.send((to, datagram));
    }

    /// Blocks until a datagram arrives, returning its source and bytes.
    /// The caller loops this and dispatches each datagram; a malformed
    /// datagram is the dispatch logic's problem, not the socket's.
    pub async fn recv(&self) -> Result<(SocketAddr, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await.map_err(Error::Recv)?;
        buf.truncate(len);
        Ok((from, buf))
    }
}
