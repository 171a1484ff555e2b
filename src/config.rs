//! Transport configuration and socket tuning
//!
//! [`NetConfig`] carries two groups of settings:
//!
//! ## Socket options
//! - `tcp_nodelay`: Disables Nagle's algorithm for immediate send
//! - `recv_buf`/`send_buf`: Kernel socket buffer sizes
//! - `reuse_port`: SO_REUSEPORT for sharing a port across sockets
//! - `ipv6_only`, `tcp_backlog`
//!
//! ## Transport behaviour
//! - `read_buffer_size`: per-session read buffer / datagram receive size
//! - `write_chunk_size` and `write_chunk_count`: shape of a session's write queue
//! - `worker_threads` and `worker_queue_capacity`: UDP worker pool
//! - `outbound_queue_capacity`: per-channel queue of datagrams awaiting
//!   write readiness
//! - `connect_timeout`, `idle_timeout`
//! - `overflow`: what a producer does when a bounded queue is full
//!
//! # Examples
//!
//! ```rust
//! use horizon_aio::config::{NetConfig, OverflowStrategy};
//! use std::time::Duration;
//!
//! let cfg = NetConfig {
//!     read_buffer_size: 4096,
//!     worker_threads: 4,
//!     overflow: OverflowStrategy::Discard,
//!     idle_timeout: Some(Duration::from_secs(30)),
//!     ..Default::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```

use crate::error::{Error, Result};
use crate::raw;
use std::io;
use std::time::Duration;

/// Behaviour of a producer facing a full bounded queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Block the producer until room frees up
    #[default]
    Wait,
    /// Drop the newest unit of work
    Discard,
}

/// Socket tuning and transport settings shared by TCP and UDP services
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// Enable TCP_NODELAY. Ignored for UDP sockets.
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// Enable SO_REUSEPORT so several sockets can bind the same port.
    ///
    /// **Default**: `false`
    pub reuse_port: bool,

    /// Socket receive buffer size in bytes; `None` keeps the system default.
    pub recv_buf: Option<usize>,

    /// Socket send buffer size in bytes; `None` keeps the system default.
    pub send_buf: Option<usize>,

    /// IPv6-only mode for IPv6 sockets; `Some(false)` is dual-stack.
    ///
    /// **Default**: `Some(false)`
    pub ipv6_only: Option<bool>,

    /// TCP listen backlog.
    ///
    /// **Default**: `Some(1024)`
    pub tcp_backlog: Option<i32>,

    /// Upper bound on one readiness wait, in milliseconds. Also the granularity
    /// of idle-timeout sweeps.
    ///
    /// **Default**: `Some(100)`
    pub poll_timeout_ms: Option<u64>,

    /// Bytes of the per-session read buffer. For UDP this is the largest
    /// datagram received intact.
    ///
    /// **Default**: `2048`
    pub read_buffer_size: usize,

    /// Size of one chunk in a session's write queue; also the largest UDP
    /// reply datagram.
    ///
    /// **Default**: `1024`
    pub write_chunk_size: usize,

    /// Chunks a session's write queue may hold before `overflow` applies.
    ///
    /// **Default**: `16`
    pub write_chunk_count: usize,

    /// Threads in the UDP worker pool.
    ///
    /// **Default**: available parallelism
    pub worker_threads: usize,

    /// Slots in the ring feeding the UDP worker pool.
    ///
    /// **Default**: `256`
    pub worker_queue_capacity: usize,

    /// Slots in each UDP channel's outbound ring.
    ///
    /// **Default**: `1024`
    pub outbound_queue_capacity: usize,

    /// Deadline for establishing a client connection.
    pub connect_timeout: Option<Duration>,

    /// Sessions without traffic for this long are closed.
    pub idle_timeout: Option<Duration>,

    /// **Default**: [`OverflowStrategy::Wait`]
    pub overflow: OverflowStrategy,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            reuse_port: false,
            recv_buf: None,
            send_buf: None,
            ipv6_only: Some(false),
            tcp_backlog: Some(1024),
            poll_timeout_ms: Some(100),
            read_buffer_size: 2048,
            write_chunk_size: 1024,
            write_chunk_count: 16,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            worker_queue_capacity: 256,
            outbound_queue_capacity: 1024,
            connect_timeout: None,
            idle_timeout: None,
            overflow: OverflowStrategy::Wait,
        }
    }
}

impl NetConfig {
    /// Small buffers and short poll waits for request/response traffic.
    ///
    /// Queues drop work instead of blocking so a slow peer cannot stall the
    /// latency-sensitive path.
    pub fn low_latency() -> Self {
        Self {
            recv_buf: Some(256 * 1024),
            send_buf: Some(256 * 1024),
            poll_timeout_ms: Some(1),
            write_chunk_count: 8,
            worker_queue_capacity: 128,
            overflow: OverflowStrategy::Discard,
            ..Self::default()
        }
    }

    /// Large kernel buffers and deep queues for bulk transfer.
    pub fn high_throughput() -> Self {
        Self {
            tcp_nodelay: false,
            reuse_port: true,
            recv_buf: Some(16 << 20),
            send_buf: Some(16 << 20),
            tcp_backlog: Some(2048),
            poll_timeout_ms: Some(50),
            read_buffer_size: 64 * 1024,
            write_chunk_size: 16 * 1024,
            write_chunk_count: 64,
            worker_queue_capacity: 4096,
            outbound_queue_capacity: 8192,
            ..Self::default()
        }
    }

    /// Rejects settings the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("read_buffer_size", self.read_buffer_size),
            ("write_chunk_size", self.write_chunk_size),
            ("write_chunk_count", self.write_chunk_count),
            ("worker_threads", self.worker_threads),
            ("worker_queue_capacity", self.worker_queue_capacity),
            ("outbound_queue_capacity", self.outbound_queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub(crate) fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.unwrap_or(100))
    }
}

/// Applies the socket options of `cfg` to a freshly created socket, before it
/// is bound.
///
/// Unsupported options are skipped rather than failing the bind.
pub fn apply_socket_options(
    os: raw::OsSocket,
    domain: raw::Domain,
    ty: raw::Type,
    cfg: &NetConfig,
) -> io::Result<()> {
    use crate::raw as r;

    if let Some(sz) = cfg.recv_buf {
        r::set_recv_buffer(os, sz as i32)?;
    }
    if let Some(sz) = cfg.send_buf {
        r::set_send_buffer(os, sz as i32)?;
    }

    if let r::Domain::Ipv6 = domain {
        if let Some(only) = cfg.ipv6_only {
            r::set_ipv6_only(os, only)?;
        }
    }

    if ty == r::Type::Stream {
        r::set_reuse_addr(os, true)?;
    }
    if cfg.reuse_port {
        if let Err(e) = r::set_reuse_port(os, true) {
            log::warn!("SO_REUSEPORT not applied: {}", e);
        }
    }

    if ty == r::Type::Stream && cfg.tcp_nodelay {
        r::set_tcp_nodelay(os, true)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetConfig::default();
        assert!(config.tcp_nodelay);
        assert_eq!(config.ipv6_only, Some(false));
        assert_eq!(config.worker_queue_capacity, 256);
        assert_eq!(config.overflow, OverflowStrategy::Wait);
        assert!(config.worker_threads >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_low_latency_config() {
        let config = NetConfig::low_latency();
        assert_eq!(config.recv_buf, Some(256 * 1024));
        assert_eq!(config.poll_timeout_ms, Some(1));
        assert_eq!(config.overflow, OverflowStrategy::Discard);
    }

    #[test]
    fn test_high_throughput_config() {
        let config = NetConfig::high_throughput();
        assert_eq!(config.recv_buf, Some(16 << 20));
        assert!(!config.tcp_nodelay);
        assert_eq!(config.tcp_backlog, Some(2048));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = NetConfig {
            worker_queue_capacity: 0,
            ..Default::default()
        };
        match config.validate() {
            Err(Error::InvalidConfig(msg)) => assert!(msg.contains("worker_queue_capacity")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_config_clone() {
        let config1 = NetConfig::low_latency();
        let config2 = config1.clone();
        assert_eq!(config1, config2);
    }
}
