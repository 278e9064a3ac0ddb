use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::UdpSocket;

use crate::interface::PacketInfo;

const CMSG_BUF_LEN: usize = 128;

pub fn bind_pktinfo_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let fd = socket.as_raw_fd();
    let enable: libc::c_int = 1;
    let rc = unsafe {
        if addr.is_ipv4() {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_PKTINFO,
                &enable as *const _ as *const libc::c_void,
                mem::size_of_val(&enable) as libc::socklen_t,
            )
        } else {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_RECVPKTINFO,
                &enable as *const _ as *const libc::c_void,
                mem::size_of_val(&enable) as libc::socklen_t,
            )
        }
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

pub async fn recv_with_pktinfo(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, PacketInfo)> {
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || recvmsg_once(socket.as_raw_fd(), buf)) {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn recvmsg_once(fd: i32, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, PacketInfo)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut name: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = name.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let from = sockaddr_to_std(unsafe { name.assume_init() }, msg.msg_namelen)?;
    let info = extract_pktinfo(&msg).unwrap_or(PacketInfo {
        local_addr: match from {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        },
        if_index: 0,
    });

    Ok((n as usize, from, info))
}

fn extract_pktinfo(msg: &libc::msghdr) -> Option<PacketInfo> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                let info: libc::in_pktinfo = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _);
                return Some(PacketInfo {
                    local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr))),
                    if_index: info.ipi_ifindex as u32,
                });
            }
            if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
                let info: libc::in6_pktinfo = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _);
                return Some(PacketInfo {
                    local_addr: IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)),
                    if_index: info.ipi6_ifindex,
                });
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

pub async fn send_from(socket: &UdpSocket, buf: &[u8], dest: SocketAddr, from: PacketInfo) -> io::Result<usize> {
    loop {
        socket.writable().await?;
        let result = socket.try_io(Interest::WRITABLE, || sendmsg_once(socket.as_raw_fd(), buf, dest, from));
        match result {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            // The pinned source address is no longer configured on this
            // host (interfaces change under us); fall back to an
            // unpinned send rather than dropping the reply.
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => return socket.send_to(buf, dest).await,
            Err(e) => return Err(e),
        }
    }
}

fn sendmsg_once(fd: i32, buf: &[u8], dest: SocketAddr, from: PacketInfo) -> io::Result<usize> {
    let dest_storage = std_to_sockaddr(dest);
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &dest_storage.0 as *const _ as *mut libc::c_void;
    msg.msg_namelen = dest_storage.1;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let controllen = match from.local_addr {
        IpAddr::V4(addr) => unsafe { write_v4_pktinfo(&mut cmsg_buf, addr, from.if_index) },
        IpAddr::V6(addr) => unsafe { write_v6_pktinfo(&mut cmsg_buf, addr, from.if_index) },
    };
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = controllen;

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

unsafe fn write_v4_pktinfo(buf: &mut [u8], addr: Ipv4Addr, if_index: u32) -> usize {
    let pktinfo = libc::in_pktinfo {
        ipi_ifindex: if_index as libc::c_int,
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        ipi_addr: libc::in_addr { s_addr: 0 },
    };
    let cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as u32) as usize;
    let mut msg: libc::msghdr = mem::zeroed();
    msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_len;
    let cmsg = libc::CMSG_FIRSTHDR(&msg);
    (*cmsg).cmsg_level = libc::IPPROTO_IP;
    (*cmsg).cmsg_type = libc::IP_PKTINFO;
    (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as u32) as _;
    std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, pktinfo);
    cmsg_len
}

unsafe fn write_v6_pktinfo(buf: &mut [u8], addr: Ipv6Addr, if_index: u32) -> usize {
    let pktinfo = libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr { s6_addr: addr.octets() },
        ipi6_ifindex: if_index,
    };
    let cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as usize;
    let mut msg: libc::msghdr = mem::zeroed();
    msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_len;
    let cmsg = libc::CMSG_FIRSTHDR(&msg);
    (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
    (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
    (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as _;
    std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, pktinfo);
    cmsg_len
}

fn sockaddr_to_std(storage: libc::sockaddr_storage, len: libc::socklen_t) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let addr: libc::sockaddr_in = unsafe { std::ptr::read(&storage as *const _ as *const _) };
            Ok(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr))),
                u16::from_be(addr.sin_port),
            ))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let addr: libc::sockaddr_in6 = unsafe { std::ptr::read(&storage as *const _ as *const _) };
            Ok(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr)),
                u16::from_be(addr.sin6_port),
            ))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}

pub fn interface_name(if_index: u32) -> Option<String> {
    if if_index == 0 {
        return None;
    }
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let rc = unsafe { libc::if_indextoname(if_index, buf.as_mut_ptr() as *mut libc::c_char) };
    if rc.is_null() {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..len]).into_owned())
}

fn std_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
