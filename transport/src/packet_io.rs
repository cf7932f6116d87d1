use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

use crate::peer_addr::PeerAddr;

/// Everything read from a socket goes through this seam - protocol logic lives behind it,
///  never in the receive loop itself.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, from: PeerAddr, data: Vec<u8>);
}

/// One bound UDP socket with its dedicated receive loop. Inbound datagrams are tagged with the
///  sender address and handed to a [DatagramHandler]; outbound sends pass through unchanged.
///
/// Failing to bind is the one unrecoverable startup error of the whole subsystem - there is no
///  degraded "no network" mode, so it is returned to the caller rather than retried.
pub struct PacketIo {
    socket: Arc<UdpSocket>,
}

impl PacketIo {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<PacketIo> {
        let socket = Arc::new(UdpSocket::bind(addr).await
            .with_context(|| format!("binding UDP socket to {:?}", addr))?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        Ok(PacketIo {
            socket,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<PeerAddr> {
        PeerAddr::from_socket_addr(self.socket.local_addr()?)
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// Send failures are logged and swallowed: retry and recovery are the business of the
    ///  protocol layers, which treat every datagram as lossy anyway.
    pub async fn send_to(&self, to: PeerAddr, data: &[u8]) {
        trace!("sending {} bytes to {}", data.len(), to);
        if let Err(e) = self.socket.send_to(data, to.socket_addr()).await {
            debug!("send to {} failed: {}", to, e);
        }
    }

    pub async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) {
        info!("starting receive loop on port {}", self.local_port());

        let mut buf = [0u8; 1500];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => {
                    x
                }
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let from = match PeerAddr::from_socket_addr(from) {
                Ok(from) => from,
                Err(_) => {
                    debug!("dropping datagram from non-IPv4 sender {:?}", from);
                    continue;
                }
            };

            trace!("received {} bytes from {}", num_read, from);
            handler.on_datagram(from, buf[..num_read].to_vec()).await;
        }
    }
}
