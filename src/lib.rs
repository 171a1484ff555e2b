#![deny(unsafe_op_in_unsafe_fn)]

//! Pooled-buffer TCP and UDP transport.
//!
//! TCP connections run on a readiness event loop with optional TLS record
//! wrapping; UDP channels share a selector thread that hands datagrams to a
//! worker pool through a [`RingBuffer`].

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("horizon_aio supports unix targets only");
    }
}

pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod protocol;
pub mod raw; // OS-level socket helpers
pub mod ring_buffer;
pub mod rt_mio;
pub mod tls;
pub mod transport;

pub mod session;
pub mod tcp;

pub mod bootstrap;
pub mod selector;
pub mod udp;
pub mod udp_channel;

pub mod plugins;

/// Convenience re-exports
pub use bootstrap::UdpBootstrap;
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use config::{NetConfig, OverflowStrategy};
pub use error::{DecodeError, Error, Result, TlsError};
pub use plugins::{BlackListPlugin, MonitorPlugin, Plugin, PluginProcessor};
pub use protocol::{AioSession, MessageProcessor, Protocol, StateEvent};
pub use ring_buffer::RingBuffer;
pub use rt_mio::Runtime;
pub use session::{Session, SessionStatus};
pub use tcp::{TcpClient, TcpServer};
pub use tls::{TlsEngineFactory, TlsRecordEngine};
pub use udp_channel::{OutboundDatagram, UdpChannel, UdpSession};
