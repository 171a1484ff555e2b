//! Entry point for UDP services
//!
//! A [`UdpBootstrap`] owns one selector (polling thread plus worker pool),
//! started on the first [`open`](UdpBootstrap::open), and any number of bound
//! channels multiplexed on it.
//!
//! ```rust,no_run
//! use horizon_aio::protocol::{AioSession, DelimiterProtocol, MessageProcessor};
//! use horizon_aio::UdpBootstrap;
//!
//! struct Echo;
//!
//! impl MessageProcessor<Vec<u8>> for Echo {
//!     fn process(&self, session: &dyn AioSession, mut line: Vec<u8>) {
//!         line.push(b'\n');
//!         let _ = session.write(&line);
//!     }
//! }
//!
//! let bootstrap = UdpBootstrap::new(DelimiterProtocol::lines(512), Echo).set_worker_threads(4);
//! let channel = bootstrap.open("0.0.0.0:9000".parse()?)?;
//! println!("udp echo on {}", channel.local_addr()?);
//! # bootstrap.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::buffer_pool::BufferPool;
use crate::config::NetConfig;
use crate::error::Result;
use crate::protocol::{MessageProcessor, Protocol};
use crate::selector::SelectorWorker;
use crate::udp::bind_udp;
use crate::udp_channel::UdpChannel;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Service id sequence, shared by every bootstrap in the process and never
/// reset. Ids name selector threads.
static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct UdpBootstrap<P: Protocol, H: MessageProcessor<P::Message>> {
    id: u64,
    protocol: Arc<P>,
    processor: Arc<H>,
    config: NetConfig,
    pool: BufferPool,
    selector: Mutex<Option<SelectorWorker>>,
    channels: Mutex<Vec<Arc<UdpChannel>>>,
}

impl<P: Protocol, H: MessageProcessor<P::Message>> UdpBootstrap<P, H> {
    pub fn new(protocol: P, processor: H) -> Self {
        Self::with_config(protocol, processor, NetConfig::default())
    }

    pub fn with_config(protocol: P, processor: H, config: NetConfig) -> Self {
        Self {
            id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
            protocol: Arc::new(protocol),
            processor: Arc::new(processor),
            pool: BufferPool::new(64, config.read_buffer_size.max(config.write_chunk_size)),
            config,
            selector: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Largest datagram received intact
    pub fn set_read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self.pool = BufferPool::new(64, size.max(self.config.write_chunk_size));
        self
    }

    pub fn set_worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Binds `addr` and starts serving it. May be called repeatedly; all
    /// channels share one selector.
    pub fn open(&self, addr: SocketAddr) -> Result<Arc<UdpChannel>> {
        self.config.validate()?;
        let mut guard = lock(&self.selector);
        let selector = match &mut *guard {
            Some(selector) => selector,
            None => guard.insert(SelectorWorker::start(
                self.id,
                self.protocol.clone(),
                self.processor.clone(),
                &self.config,
                self.pool.clone(),
            )?),
        };
        let socket = bind_udp(addr, &self.config)?;
        let channel = UdpChannel::new(socket, &self.config, self.pool.clone());
        selector.register(channel.clone())?;
        lock(&self.channels).push(channel.clone());
        log::info!("udp service {} bound {}", self.id, channel.local_addr()?);
        Ok(channel)
    }

    /// Opens a channel on an ephemeral port, for client use with
    /// [`UdpChannel::connect`].
    pub fn open_ephemeral(&self) -> Result<Arc<UdpChannel>> {
        self.open(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
    }

    /// Stops the selector and its workers and closes every channel.
    pub fn shutdown(&self) {
        if let Some(mut selector) = lock(&self.selector).take() {
            selector.shutdown();
        }
        for channel in lock(&self.channels).drain(..) {
            channel.close();
        }
    }
}

impl<P: Protocol, H: MessageProcessor<P::Message>> Drop for UdpBootstrap<P, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::{AioSession, DelimiterProtocol};

    struct Sink;

    impl MessageProcessor<Vec<u8>> for Sink {
        fn process(&self, _session: &dyn AioSession, _msg: Vec<u8>) {}
    }

    #[test]
    fn test_service_ids_are_distinct() {
        let a = UdpBootstrap::new(DelimiterProtocol::lines(8), Sink);
        let b = UdpBootstrap::new(DelimiterProtocol::lines(8), Sink);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_channels_share_one_selector_and_close_on_shutdown() {
        let bootstrap = UdpBootstrap::new(DelimiterProtocol::lines(8), Sink).set_worker_threads(1);
        let first = bootstrap.open("127.0.0.1:0".parse().unwrap()).unwrap();
        let second = bootstrap.open("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(first.local_addr().unwrap(), second.local_addr().unwrap());

        bootstrap.shutdown();
        assert!(first.is_closed());
        assert!(second.is_closed());
    }

    #[test]
    fn test_invalid_config_is_rejected_on_open() {
        let bootstrap = UdpBootstrap::new(DelimiterProtocol::lines(8), Sink).set_worker_threads(0);
        match bootstrap.open("127.0.0.1:0".parse().unwrap()) {
            Err(Error::InvalidConfig(msg)) => assert!(msg.contains("worker_threads")),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("zero workers accepted"),
        }
    }

    #[test]
    fn test_read_buffer_setter() {
        let bootstrap = UdpBootstrap::new(DelimiterProtocol::lines(8), Sink).set_read_buffer_size(4096);
        assert_eq!(bootstrap.config().read_buffer_size, 4096);
    }
}
