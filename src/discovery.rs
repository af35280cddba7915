//! Multicast discovery transport.
//!
//! Agents announce themselves with a small JSON datagram sent to a
//! multicast group; the coordinator listens on that group and forwards each
//! well-formed announcement, together with its source address, to the
//! membership logic.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::types::DiscoveryDatagram;

/// Largest datagram the listener accepts.
const MAX_DATAGRAM: usize = 2048;

/// Multicast hop limit for announcements.
const MULTICAST_TTL: u32 = 5;

pub fn parse_datagram(bytes: &[u8]) -> serde_json::Result<DiscoveryDatagram> {
    serde_json::from_slice(bytes)
}

/// Coordinator-side multicast listener.
pub struct DatagramServer {
    socket: UdpSocket,
}

impl DatagramServer {
    pub async fn bind(port: u16, multicast_address: Ipv4Addr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.join_multicast_v4(multicast_address, Ipv4Addr::UNSPECIFIED)?;
        info!(
            "Listening for discovery datagrams on {} (group {})",
            socket.local_addr()?,
            multicast_address
        );
        Ok(Self { socket })
    }

    /// Forward announcements until the receiving side goes away.
    pub async fn run(
        self,
        tx: mpsc::Sender<(DiscoveryDatagram, SocketAddr)>,
    ) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Datagram receive failed: {}", e);
                    continue;
                }
            };
            match parse_datagram(&buf[..len]) {
                Ok(datagram) => {
                    debug!("Discovery datagram from {}: {:?}", from, datagram);
                    if tx.send((datagram, from)).await.is_err() {
                        info!("Discovery consumer closed, stopping listener");
                        return Ok(());
                    }
                }
                Err(e) => warn!("Dropping malformed datagram from {}: {}", from, e),
            }
        }
    }
}

/// Sends this machine's announcement.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, tcp_port: u16) -> anyhow::Result<()>;
}

/// Agent-side multicast sender.
pub struct DatagramClient {
    socket: UdpSocket,
    target: SocketAddrV4,
}

impl DatagramClient {
    pub async fn bind(
        port: u16,
        multicast_address: Ipv4Addr,
        server_port: u16,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        Ok(Self {
            socket,
            target: SocketAddrV4::new(multicast_address, server_port),
        })
    }
}

#[async_trait]
impl Announcer for DatagramClient {
    async fn announce(&self, tcp_port: u16) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&DiscoveryDatagram::NewMachine { tcp: tcp_port })?;
        self.socket.send_to(&bytes, self.target).await?;
        debug!("Announced tcp port {} to {}", tcp_port, self.target);
        Ok(())
    }
}
