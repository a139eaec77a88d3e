//! DHCP UDP endpoint (spec.md §4.2/§5, C4).
//!
//! Grounded on `original_source/dhns/dhcp/server.py`'s `UdpServer`: the
//! three-way reply-routing decision (broadcast flag / `0.0.0.0` source /
//! unicast) and the transient broadcast-reply socket are carried over in
//! shape. `IP_PKTINFO` ancillary-data recovery goes through `nix`, the crate
//! the erbium-family sibling projects in the retrieval pack reach for to do
//! exactly this kind of raw socket option work — no teacher file reads cmsg
//! directly.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use nix::cmsg_space;
use nix::sys::socket::{self, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn};
use nix::sys::uio::IoSliceMut;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;

use super::middleware::DhcpMiddlewareChain;
use super::packet::Packet;
use crate::error::StartupError;
use crate::mux::MuxEndpoint;

const RECV_BUF: usize = 512;

/// Binds a UDP socket with `SO_REUSEADDR` set before `bind()`, so a transient
/// socket can share a port already held by a listener bound to `0.0.0.0`.
fn bind_reuseaddr(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let SocketAddr::V4(addr) = addr else {
        return Err(std::io::Error::other("expected an IPv4 address"));
    };

    let fd = socket::socket(
        socket::AddressFamily::Inet,
        socket::SockType::Datagram,
        socket::SockFlag::empty(),
        None,
    )
    .map_err(std::io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(std::io::Error::from)?;

    socket::bind(fd.as_raw_fd(), &SockaddrIn::from(addr)).map_err(std::io::Error::from)?;

    let std_socket = std::net::UdpSocket::from(fd);
    std_socket.set_nonblocking(true)?;
    UdpSocket::from_std(std_socket)
}

struct Received {
    query: Packet,
    reply_to: SocketAddr,
    interface: Option<Ipv4Addr>,
}

pub struct DhcpEndpoint {
    socket: UdpSocket,
    chain: Arc<DhcpMiddlewareChain>,
    port: u16,
    write_queue: AsyncMutex<VecDeque<(SocketAddr, Packet)>>,
}

impl DhcpEndpoint {
    pub fn bind(port: u16, chain: Arc<DhcpMiddlewareChain>) -> Result<Self, StartupError> {
        let fd = socket::socket(
            socket::AddressFamily::Inet,
            socket::SockType::Datagram,
            socket::SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| StartupError::Bind { addr: format!("0.0.0.0:{port}"), source: std::io::Error::from(e) })?;

        socket::setsockopt(&fd, sockopt::ReuseAddr, &true).ok();
        socket::setsockopt(&fd, sockopt::Broadcast, &true).ok();
        socket::setsockopt(&fd, sockopt::Ipv4PacketInfo, &true).ok();

        let bind_addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket::bind(fd.as_raw_fd(), &bind_addr)
            .map_err(|e| StartupError::Bind { addr: format!("0.0.0.0:{port}"), source: std::io::Error::from(e) })?;

        let std_socket = std::net::UdpSocket::from(fd);
        std_socket
            .set_nonblocking(true)
            .map_err(|e| StartupError::Bind { addr: format!("0.0.0.0:{port}"), source: e })?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| StartupError::Bind { addr: format!("0.0.0.0:{port}"), source: e })?;

        Ok(Self { socket, chain, port, write_queue: AsyncMutex::new(VecDeque::new()) })
    }

    /// One multiplexer tick: drains a single ready datagram, dispatches it
    /// through the middleware chain, and enqueues the reply for `write()`.
    pub async fn read(&self) {
        let received = match self.recv_with_interface().await {
            Ok(r) => r,
            Err(e) => {
                warn!("dhcp: recv failed: {e}");
                return;
            }
        };

        let Some(interface) = received.interface else {
            warn!("dhcp: no IP_PKTINFO on received packet, dropping");
            return;
        };

        let (answer, claimant) = self.chain.dispatch(interface, &received.query).await;
        let Some(claimant) = claimant else {
            return;
        };

        let dest = if answer.is_broadcast() {
            info!("dhcp: got net broadcast on {interface}");
            self.send_broadcast(&answer, interface, received.reply_to).await;
            return;
        } else if received.reply_to.ip() == std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
            info!("dhcp: got adr broadcast on {interface}");
            let broadcast = claimant.broadcast_addr().unwrap_or(Ipv4Addr::BROADCAST);
            SocketAddr::new(broadcast.into(), received.reply_to.port())
        } else {
            info!("dhcp: got unicast from {}", received.reply_to);
            received.reply_to
        };

        self.write_queue.lock().await.push_back((dest, answer));
    }

    pub async fn write(&self) {
        let next = self.write_queue.lock().await.pop_front();
        if let Some((dest, answer)) = next {
            if let Err(e) = self.socket.send_to(&answer.pack(), dest).await {
                warn!("dhcp: send failed: {e}");
            }
        }
    }

    pub async fn wqlen(&self) -> usize {
        self.write_queue.lock().await.len()
    }

    /// Opens a transient broadcast-capable socket bound to the pool's own
    /// address, sends once, and closes — matches the source's `broadcast()`.
    ///
    /// The main socket already holds `0.0.0.0:port`, so this bind must set
    /// `SO_REUSEADDR` first or it fails `EADDRINUSE` on every call.
    async fn send_broadcast(&self, answer: &Packet, pool_addr: Ipv4Addr, reply_to: SocketAddr) {
        let bind_addr = SocketAddr::new(pool_addr.into(), self.port);
        let socket = match bind_reuseaddr(bind_addr) {
            Ok(s) => s,
            Err(e) => {
                warn!("dhcp: broadcast socket bind failed: {e}");
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!("dhcp: broadcast socket setsockopt failed: {e}");
            return;
        }
        let dest = SocketAddr::new(Ipv4Addr::BROADCAST.into(), reply_to.port());
        if let Err(e) = socket.send_to(&answer.pack(), dest).await {
            warn!("dhcp: broadcast send failed: {e}");
        }
    }

    async fn recv_with_interface(&self) -> std::io::Result<Received> {
        loop {
            self.socket.readable().await?;

            let result = self.socket.try_io(Interest::READABLE, || {
                let mut buf = [0u8; RECV_BUF];
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsg_buffer = cmsg_space!(libc::in_pktinfo);

                let msg = socket::recvmsg::<SockaddrIn>(
                    self.socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::empty(),
                )
                .map_err(std::io::Error::from)?;

                let interface = msg.cmsgs().ok().into_iter().flatten().find_map(|c| match c {
                    ControlMessageOwned::Ipv4PacketInfo(pktinfo) => {
                        Some(Ipv4Addr::from(u32::from_be(pktinfo.ipi_spec_dst.s_addr)))
                    }
                    _ => None,
                });

                let from = msg
                    .address
                    .map(|a: SockaddrIn| SocketAddr::V4(SocketAddrV4::new(a.ip(), a.port())))
                    .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));

                Ok((buf[..msg.bytes].to_vec(), from, interface))
            });

            match result {
                Ok((bytes, from, interface)) => {
                    let query = Packet::parse(&bytes).map_err(std::io::Error::other)?;
                    return Ok(Received { query, reply_to: from, interface });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl MuxEndpoint for DhcpEndpoint {
    async fn read(&self) {
        DhcpEndpoint::read(self).await
    }

    async fn write(&self) {
        DhcpEndpoint::write(self).await
    }

    async fn wqlen(&self) -> usize {
        DhcpEndpoint::wqlen(self).await
    }
}
