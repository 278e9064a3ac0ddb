//! Non-Linux fallback: a plain, unpinned UDP socket. Replies go out from
//! whatever address the kernel's routing picks rather than the address
//! the query arrived on, and `PacketInfo::if_index` is always 0.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::interface::PacketInfo;

pub fn bind_pktinfo_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

pub async fn recv_with_pktinfo(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, PacketInfo)> {
    let (n, from) = socket.recv_from(buf).await?;
    let local = socket.local_addr()?;
    let unspecified = match from {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let info = PacketInfo {
        local_addr: if local.ip().is_unspecified() { unspecified } else { local.ip() },
        if_index: 0,
    };
    Ok((n, from, info))
}

pub async fn send_from(socket: &UdpSocket, buf: &[u8], dest: SocketAddr, _from: PacketInfo) -> io::Result<usize> {
    socket.send_to(buf, dest).await
}

pub fn interface_name(_if_index: u32) -> Option<String> {
    None
}
