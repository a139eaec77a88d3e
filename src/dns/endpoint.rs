//! DNS UDP endpoint (spec.md §4.4/§5, C5).
//!
//! Grounded on `original_source/dhns/dns/server.py`'s `UdpServer`: recovers
//! the arrival interface via `IP_PKTINFO`, spawns a worker per request, and
//! replies from a transient socket bound to that interface and the
//! configured DNS port.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use nix::cmsg_space;
use nix::sys::socket::{self, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn};
use nix::sys::uio::IoSliceMut;
use tokio::io::Interest;
use tokio::net::UdpSocket;

use super::message::DnsMessage;
use super::middleware::DnsMiddlewareChain;
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

pub struct DnsEndpoint {
    socket: Arc<UdpSocket>,
    chain: Arc<DnsMiddlewareChain>,
    port: u16,
}

impl DnsEndpoint {
    pub fn bind(port: u16, chain: Arc<DnsMiddlewareChain>) -> Result<Self, StartupError> {
        let fd = socket::socket(
            socket::AddressFamily::Inet,
            socket::SockType::Datagram,
            socket::SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| StartupError::Bind { addr: format!("0.0.0.0:{port}"), source: std::io::Error::from(e) })?;

        socket::setsockopt(&fd, sockopt::ReuseAddr, &true).ok();
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

        Ok(Self { socket: Arc::new(socket), chain, port })
    }

    /// One multiplexer tick: receives a single ready datagram and spawns its
    /// own processing task, so a slow upstream lookup never blocks the next
    /// read (spec.md §5's "spawned per-request worker task").
    pub async fn read(&self) {
        let (buf, from, interface) = match self.recv_with_interface().await {
            Ok(r) => r,
            Err(e) => {
                warn!("dns: recv failed: {e}");
                return;
            }
        };

        let Some(interface) = interface else {
            warn!("dns: no IP_PKTINFO on received packet, dropping");
            return;
        };

        let chain = self.chain.clone();
        let port = self.port;
        tokio::spawn(async move {
            Self::process(chain, port, buf, from, interface).await;
        });
    }

    async fn process(chain: Arc<DnsMiddlewareChain>, port: u16, buf: Vec<u8>, from: SocketAddr, interface: Ipv4Addr) {
        let query = match DnsMessage::parse(&buf) {
            Ok(q) => q,
            Err(e) => {
                warn!("dns: parse failed: {e}");
                return;
            }
        };
        debug!("dns: Q {} FROM: {from}", query.qname());

        let answer = chain.dispatch(&query).await;

        let reply_addr = SocketAddr::new(interface.into(), port);
        let socket = match bind_reuseaddr(reply_addr) {
            Ok(s) => s,
            Err(e) => {
                warn!("dns: reply socket bind failed: {e}");
                return;
            }
        };
        if let Err(e) = socket.send_to(&answer.to_bytes(), from).await {
            warn!("dns: send failed: {e}");
        }
    }

    async fn recv_with_interface(&self) -> std::io::Result<(Vec<u8>, SocketAddr, Option<Ipv4Addr>)> {
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
                Ok(r) => return Ok(r),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl MuxEndpoint for DnsEndpoint {
    async fn read(&self) {
        DnsEndpoint::read(self).await
    }

    // Replies are sent directly from the per-request task's own transient
    // socket (see `process`); this endpoint never queues a write.
    async fn write(&self) {}

    async fn wqlen(&self) -> usize {
        0
    }
}
