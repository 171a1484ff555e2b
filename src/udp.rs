//! UDP socket binding and the datagram seam used by channels.

use crate::config::{apply_socket_options, NetConfig};
use crate::raw as r;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, UdpSocket};

/// Non-blocking, unconnected datagram endpoint
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds a non-blocking UDP socket with the options of `cfg` applied before
/// `bind`.
pub fn bind_udp(addr: SocketAddr, cfg: &NetConfig) -> io::Result<UdpSocket> {
    let (domain, sa, len) = r::to_sockaddr(addr);
    let os = r::socket(domain, r::Type::Dgram)?;
    let socket = r::udp_from_os(os);
    r::set_nonblocking(os, true)?;
    apply_socket_options(os, domain, r::Type::Dgram, cfg)?;
    r::bind_raw(os, &sa, len)?;
    Ok(socket)
}

/// Binds `[::]:port`, dual-stack unless `cfg.ipv6_only` says otherwise.
pub fn bind_dual_stack(port: u16, cfg: &NetConfig) -> io::Result<UdpSocket> {
    let cfg = NetConfig {
        ipv6_only: Some(cfg.ipv6_only.unwrap_or(false)),
        ..cfg.clone()
    };
    bind_udp(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port), &cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_udp_is_nonblocking() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap(), &NetConfig::default()).unwrap();
        let mut buf = [0u8; 16];
        let err = DatagramSocket::recv_from(&socket, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_datagram_round_trip() {
        let cfg = NetConfig::default();
        let a = bind_udp("127.0.0.1:0".parse().unwrap(), &cfg).unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        DatagramSocket::send_to(&b, b"hey", DatagramSocket::local_addr(&a).unwrap()).unwrap();

        let mut buf = [0u8; 16];
        let mut got = None;
        for _ in 0..100 {
            match DatagramSocket::recv_from(&a, &mut buf) {
                Ok(r) => {
                    got = Some(r);
                    break;
                }
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
        let (n, from) = got.expect("datagram");
        assert_eq!(&buf[..n], b"hey");
        assert_eq!(from, b.local_addr().unwrap());
    }
}
