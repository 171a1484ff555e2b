//! Low-level socket creation and option helpers
//!
//! Sockets are created through `libc` so options that must precede `bind`
//! (SO_REUSEADDR, SO_REUSEPORT, IPV6_V6ONLY, buffer sizes) can be applied, and
//! are then handed over to the standard library types.
//!
//! # Safety
//!
//! This module contains `unsafe` code for raw socket system calls and socket
//! address conversion. The public helpers take ownership of the descriptors
//! they create; callers convert them exactly once through the `*_from_os`
//! functions.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};

pub type OsSocket = RawFd;

/// IP protocol domain for sockets
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    Ipv4,
    Ipv6,
}

/// Socket type for protocol communication
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    /// TCP stream socket
    Stream,
    /// UDP datagram socket
    Dgram,
}

/// Platform-specific socket address storage
#[derive(Debug)]
pub enum SockAddr {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

/// Convert SocketAddr to platform-specific socket address
pub fn to_sockaddr(addr: SocketAddr) -> (Domain, SockAddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut s: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            s.sin_family = libc::AF_INET as _;
            s.sin_port = a.port().to_be();
            s.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
            (Domain::Ipv4, SockAddr::V4(s), std::mem::size_of::<libc::sockaddr_in>() as _)
        }
        SocketAddr::V6(a) => {
            let mut s: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            s.sin6_family = libc::AF_INET6 as _;
            s.sin6_port = a.port().to_be();
            s.sin6_flowinfo = a.flowinfo();
            s.sin6_scope_id = a.scope_id();
            s.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
            (Domain::Ipv6, SockAddr::V6(s), std::mem::size_of::<libc::sockaddr_in6>() as _)
        }
    }
}

/// Create a new close-on-exec socket of the given domain and type
pub fn socket(domain: Domain, ty: Type) -> io::Result<OsSocket> {
    let d = match domain {
        Domain::Ipv4 => libc::AF_INET,
        Domain::Ipv6 => libc::AF_INET6,
    };
    let (t, p) = match ty {
        Type::Stream => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
        Type::Dgram => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
    };
    let fd = unsafe { libc::socket(d, t, p) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(e) = set_cloexec(fd) {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Bind `os` to `sa`.
pub fn bind_raw(os: OsSocket, sa: &SockAddr, len: libc::socklen_t) -> io::Result<()> {
    let ptr = match sa {
        SockAddr::V4(s) => s as *const _ as *const libc::sockaddr,
        SockAddr::V6(s) => s as *const _ as *const libc::sockaddr,
    };
    if unsafe { libc::bind(os, ptr, len) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Start listening on socket with specified backlog
pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(os, backlog) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Set socket non-blocking mode
pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(os, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let nb = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        if libc::fcntl(os, libc::F_SETFL, nb) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_cloexec(os: OsSocket) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(os, libc::F_GETFD);
        if flags < 0 || libc::fcntl(os, libc::F_SETFD, flags | libc::FD_CLOEXEC) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Close a descriptor that was never handed to a std type
pub fn close(os: OsSocket) {
    unsafe {
        libc::close(os);
    }
}

/// Set socket receive buffer size
pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz)
}
/// Set socket send buffer size
pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz)
}
/// Allow rebinding a port still in TIME_WAIT
pub fn set_reuse_addr(os: OsSocket, on: bool) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32)
}
/// Enable port reuse for multiple binds
pub fn set_reuse_port(os: OsSocket, on: bool) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as i32)
}
/// Configure IPv6-only mode (disable dual-stack)
pub fn set_ipv6_only(os: OsSocket, only: bool) -> io::Result<()> {
    setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, only as i32)
}
/// Disable TCP Nagle algorithm for low latency
pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> {
    setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32)
}

fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
    let v = val as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Convert an owned OS socket to a std UDP socket
pub fn udp_from_os(fd: RawFd) -> std::net::UdpSocket {
    unsafe { std::net::UdpSocket::from_raw_fd(fd) }
}
/// Convert an owned OS socket to a std TCP listener
pub fn tcp_listener_from_os(fd: RawFd) -> std::net::TcpListener {
    unsafe { std::net::TcpListener::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_v4_layout() {
        let (domain, sa, len) = to_sockaddr("127.0.0.1:8080".parse().unwrap());
        assert_eq!(domain, Domain::Ipv4);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        match sa {
            SockAddr::V4(s) => {
                assert_eq!(u16::from_be(s.sin_port), 8080);
                assert_eq!(s.sin_addr.s_addr.to_ne_bytes(), [127, 0, 0, 1]);
            }
            SockAddr::V6(_) => panic!("expected v4"),
        }
    }

    #[test]
    fn test_socket_bind_and_convert() {
        let (domain, sa, len) = to_sockaddr("127.0.0.1:0".parse().unwrap());
        let fd = socket(domain, Type::Dgram).unwrap();
        set_nonblocking(fd, true).unwrap();
        bind_raw(fd, &sa, len).unwrap();
        let udp = udp_from_os(fd);
        assert_ne!(udp.local_addr().unwrap().port(), 0);
    }
}
