//! Raw ancillary-data sockets.
//!
//! Preserving the client's original destination address — so a reply can
//! be sent back *from* the same local address it arrived on — needs
//! `IP_PKTINFO`/`IPV6_PKTINFO` ancillary data on `recvmsg`/`sendmsg`.
//! Nothing in `tokio::net::UdpSocket` exposes that, so this module talks
//! to the raw file descriptor directly, the same way the original calls
//! straight into the platform's socket API rather than going through a
//! higher-level abstraction.
//!
//! The pktinfo cmsg layout is Linux-specific; on every other target we
//! fall back to an unpinned socket (no source-address preservation,
//! `if_index` always reported as 0).

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::interface::PacketInfo;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod fallback;

#[cfg(target_os = "linux")]
use linux as imp;
#[cfg(not(target_os = "linux"))]
use fallback as imp;

/// Binds a UDP socket at `addr` with pktinfo ancillary data enabled (where
/// supported) and `SO_REUSEADDR` set, matching how the original sets up
/// each listening socket once at startup.
pub fn bind_pktinfo_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    imp::bind_pktinfo_socket(addr)
}

/// Receives one datagram, returning the sender's address and the local
/// packet info (destination address + interface) it arrived on.
pub async fn recv_with_pktinfo(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, PacketInfo)> {
    imp::recv_with_pktinfo(socket, buf).await
}

/// Sends `buf` to `dest`, pinning the source address to `from.local_addr`
/// where the platform allows it. Falls back to an unpinned send on
/// `EINVAL` — the original's `send_from` does the same when the kernel
/// refuses a source address that is no longer configured on the host.
pub async fn send_from(socket: &UdpSocket, buf: &[u8], dest: SocketAddr, from: PacketInfo) -> io::Result<usize> {
    imp::send_from(socket, buf, dest, from).await
}

/// Resolves a `PacketInfo::if_index` to its interface name for
/// `InterfacePolicy`. Returns `None` when the platform can't tell us
/// (the non-Linux fallback never reports a specific interface) or the
/// index no longer names a live interface.
pub fn interface_name(if_index: u32) -> Option<String> {
    imp::interface_name(if_index)
}
