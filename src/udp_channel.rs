//! One bound UDP socket, its per-remote sessions and its outbound queue.
//!
//! Sends are attempted synchronously while nothing is queued. Once the socket
//! reports `WouldBlock`, datagrams go through the channel's outbound
//! [`RingBuffer`] and write interest is switched on; the selector thread
//! drains the ring in order on write readiness and switches interest off when
//! it empties. A datagram the socket refuses mid-drain stays in its slot
//! (still `Reading`) and is retried first on the next readiness event.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::{NetConfig, OverflowStrategy};
use crate::error::{Error, Result};
use crate::protocol::{next_session_id, AioSession};
use crate::ring_buffer::{DefaultFactory, RingBuffer};
use crate::rt_mio::{deregister_fd, register_fd, reregister_fd};
use crate::udp::DatagramSocket;
use mio::{Interest, Registry, Token};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A datagram waiting for the socket
#[derive(Debug)]
pub struct OutboundDatagram {
    pub target: SocketAddr,
    pub payload: PooledBuffer,
}

struct Registration {
    registry: Arc<Registry>,
    fd: RawFd,
    token: Token,
}

pub struct UdpChannel<S: DatagramSocket = UdpSocket> {
    id: u64,
    socket: S,
    pool: BufferPool,
    reply_size: usize,
    overflow: OverflowStrategy,
    sessions: Mutex<HashMap<SocketAddr, Arc<UdpSession<S>>>>,
    outbound: RingBuffer<Option<OutboundDatagram>>,
    /// Datagrams in `outbound`, including a stalled one
    queued: AtomicUsize,
    /// Slot whose send hit `WouldBlock`; retried before anything else
    stalled: Mutex<Option<usize>>,
    write_interest: AtomicBool,
    registration: Mutex<Option<Registration>>,
    closed: AtomicBool,
    this: Weak<Self>,
}

impl<S: DatagramSocket> UdpChannel<S> {
    pub fn new(socket: S, config: &NetConfig, pool: BufferPool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: next_session_id(),
            socket,
            pool,
            reply_size: config.write_chunk_size,
            overflow: config.overflow,
            sessions: Mutex::new(HashMap::new()),
            outbound: RingBuffer::new(config.outbound_queue_capacity, DefaultFactory),
            queued: AtomicUsize::new(0),
            stalled: Mutex::new(None),
            write_interest: AtomicBool::new(false),
            registration: Mutex::new(None),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Datagrams waiting for write readiness
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn wants_write(&self) -> bool {
        self.write_interest.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Client-side session for `remote`; replies from `remote` arrive on it.
    pub fn connect(&self, remote: SocketAddr) -> Arc<UdpSession<S>> {
        self.session_for(remote).0
    }

    /// Cached session for `remote`, and whether it was just created. A closed
    /// session is replaced.
    pub(crate) fn session_for(&self, remote: SocketAddr) -> (Arc<UdpSession<S>>, bool) {
        let mut sessions = lock(&self.sessions);
        if let Some(existing) = sessions.get(&remote) {
            if !existing.is_invalid() {
                return (existing.clone(), false);
            }
        }
        let session = Arc::new(UdpSession {
            id: next_session_id(),
            remote,
            channel: self.this.clone(),
            reply: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        sessions.insert(remote, session.clone());
        (session, true)
    }

    /// Copies `bytes` into a pooled buffer and sends it to `target`.
    pub fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<()> {
        let mut payload = self.pool.allocate(bytes.len());
        payload.put(bytes);
        self.send(OutboundDatagram { target, payload })
    }

    /// Sends `datagram`, or queues it behind earlier ones for the selector to
    /// send on write readiness.
    ///
    /// When the queue is full, [`OverflowStrategy::Wait`] blocks until a slot
    /// frees up and [`OverflowStrategy::Discard`] drops the datagram.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use horizon_aio::udp::bind_udp;
    /// use horizon_aio::{BufferPool, NetConfig, OutboundDatagram, UdpChannel};
    ///
    /// let config = NetConfig::default();
    /// let pool = BufferPool::new(16, config.read_buffer_size);
    /// let channel = UdpChannel::new(bind_udp("0.0.0.0:0".parse()?, &config)?, &config, pool.clone());
    ///
    /// let mut payload = pool.allocate(5);
    /// payload.put(b"hello");
    /// channel.send(OutboundDatagram { target: "127.0.0.1:9000".parse()?, payload })?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    ///
    /// # Performance Notes
    ///
    /// - With nothing queued the datagram goes out synchronously on the
    ///   caller's thread
    /// - Otherwise it is queued, never sent ahead of earlier datagrams
    /// - The payload returns to its pool once sent or dropped
    pub fn send(&self, datagram: OutboundDatagram) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        if self.queued() == 0 {
            match self.socket.send_to(datagram.payload.readable(), datagram.target) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.enqueue(datagram)
    }

    fn enqueue(&self, datagram: OutboundDatagram) -> Result<()> {
        let index = match self.outbound.try_acquire_write_slot() {
            Some(index) => index,
            None => match self.overflow {
                OverflowStrategy::Discard => {
                    log::debug!(
                        "channel {} outbound queue full, dropping datagram to {}",
                        self.id,
                        datagram.target
                    );
                    return Ok(());
                }
                OverflowStrategy::Wait => {
                    self.request_write_interest();
                    self.outbound.acquire_write_slot()
                }
            },
        };
        self.queued.fetch_add(1, Ordering::SeqCst);
        *self.outbound.get(index) = Some(datagram);
        self.outbound.publish_write(index);
        self.request_write_interest();
        if self.is_closed() {
            self.discard_outbound();
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn request_write_interest(&self) {
        if self.write_interest.swap(true, Ordering::SeqCst) {
            return;
        }
        let registration = lock(&self.registration);
        self.apply_interest(&registration, Interest::READABLE | Interest::WRITABLE);
    }

    fn apply_interest(&self, registration: &Option<Registration>, interest: Interest) {
        if let Some(reg) = registration {
            if let Err(e) = reregister_fd(&reg.registry, reg.fd, reg.token, interest) {
                log::warn!("channel {} interest update failed: {}", self.id, e);
            }
        }
    }

    /// Sends queued datagrams until the ring is empty or the socket would
    /// block. Called by the selector thread on write readiness.
    pub(crate) fn flush_outbound(&self) -> io::Result<()> {
        let mut stalled = lock(&self.stalled);
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let index = match stalled.take() {
                Some(index) => index,
                None => match self.outbound.try_acquire_read_slot() {
                    Some(index) => index,
                    None => {
                        let registration = lock(&self.registration);
                        self.write_interest.store(false, Ordering::SeqCst);
                        self.apply_interest(&registration, Interest::READABLE);
                        // a producer may have published after the ring looked empty
                        if self.outbound.is_empty() {
                            return Ok(());
                        }
                        self.write_interest.store(true, Ordering::SeqCst);
                        self.apply_interest(&registration, Interest::READABLE | Interest::WRITABLE);
                        continue;
                    }
                },
            };
            let sent = match &*self.outbound.get(index) {
                Some(d) => self.socket.send_to(d.payload.readable(), d.target).map(|_| ()),
                None => Ok(()),
            };
            match sent {
                Ok(()) => {
                    self.outbound.publish_read(index);
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    *stalled = Some(index);
                    return Ok(());
                }
                Err(e) => {
                    *stalled = Some(index);
                    return Err(e);
                }
            }
        }
    }

    /// Stops the channel: deregisters it, closes its sessions and drops
    /// anything still queued.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reg) = lock(&self.registration).take() {
            if let Err(e) = deregister_fd(&reg.registry, reg.fd) {
                log::debug!("channel {} deregister: {}", self.id, e);
            }
        }
        let sessions = std::mem::take(&mut *lock(&self.sessions));
        for session in sessions.values() {
            session.close(true);
        }
        self.discard_outbound();
        log::debug!("channel {} closed", self.id);
    }

    fn discard_outbound(&self) {
        let mut stalled = lock(&self.stalled);
        let mut dropped = 0;
        if let Some(index) = stalled.take() {
            self.outbound.publish_read(index);
            dropped += 1;
        }
        while let Some(index) = self.outbound.try_acquire_read_slot() {
            self.outbound.publish_read(index);
            dropped += 1;
        }
        self.queued.fetch_sub(dropped, Ordering::SeqCst);
    }
}

impl<S: DatagramSocket + AsRawFd> UdpChannel<S> {
    /// Registers the socket with a selector under `token`.
    pub(crate) fn attach(&self, registry: Arc<Registry>, token: Token) -> io::Result<()> {
        let mut registration = lock(&self.registration);
        let fd = self.socket.as_raw_fd();
        let interest = if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        register_fd(&registry, fd, token, interest)?;
        *registration = Some(Registration { registry, fd, token });
        Ok(())
    }
}

/// Per-remote view of a [`UdpChannel`]. Writes are collected into one reply
/// datagram until [`flush`](AioSession::flush).
pub struct UdpSession<S: DatagramSocket = UdpSocket> {
    id: u64,
    remote: SocketAddr,
    channel: Weak<UdpChannel<S>>,
    reply: Mutex<Option<PooledBuffer>>,
    closed: AtomicBool,
}

impl<S: DatagramSocket> UdpSession<S> {
    /// Bytes written since the last flush
    pub fn pending_reply(&self) -> usize {
        lock(&self.reply).as_ref().map_or(0, |r| r.len())
    }

    fn channel(&self) -> Result<Arc<UdpChannel<S>>> {
        match self.channel.upgrade() {
            Some(channel) if !channel.is_closed() => Ok(channel),
            _ => Err(Error::SessionClosed),
        }
    }
}

impl<S: DatagramSocket> AioSession for UdpSession<S> {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let channel = self.channel()?;
        let mut reply = lock(&self.reply);
        if reply.as_ref().is_some_and(|r| r.remaining_mut() < data.len()) {
            if let Some(payload) = reply.take() {
                channel.send(OutboundDatagram { target: self.remote, payload })?;
            }
        }
        let buf = reply.get_or_insert_with(|| channel.pool.allocate(data.len().max(channel.reply_size)));
        buf.put(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let Some(payload) = lock(&self.reply).take() else {
            return Ok(());
        };
        if payload.is_empty() {
            return Ok(());
        }
        self.channel()?.send(OutboundDatagram { target: self.remote, payload })
    }

    fn close(&self, _immediate: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.reply).take();
        }
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.channel.upgrade() {
            Some(channel) => channel.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn is_invalid(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.channel().is_err()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// Datagram socket whose send side can be switched to `WouldBlock`
    #[derive(Default)]
    pub(crate) struct FakeSocket {
        pub(crate) saturated: AtomicBool,
        pub(crate) sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl FakeSocket {
        pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    impl DatagramSocket for FakeSocket {
        fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            if self.saturated.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.sent.lock().unwrap().push((target, buf.to_vec()));
            Ok(buf.len())
        }

        fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(([127, 0, 0, 1], 5000).into())
        }
    }

    fn channel(capacity: usize, overflow: OverflowStrategy) -> Arc<UdpChannel<FakeSocket>> {
        let config = NetConfig {
            outbound_queue_capacity: capacity,
            write_chunk_size: 32,
            overflow,
            ..Default::default()
        };
        UdpChannel::new(FakeSocket::default(), &config, BufferPool::new(8, 64))
    }

    fn peer() -> SocketAddr {
        ([127, 0, 0, 1], 6000).into()
    }

    #[test]
    fn test_send_goes_out_immediately_when_idle() {
        let ch = channel(4, OverflowStrategy::Wait);
        ch.send_to(b"now", peer()).unwrap();
        assert_eq!(ch.socket().payloads(), vec![b"now".to_vec()]);
        assert_eq!(ch.queued(), 0);
        assert!(!ch.wants_write());
    }

    #[test]
    fn test_saturated_socket_queues_and_drains_in_order() {
        let ch = channel(4, OverflowStrategy::Wait);
        ch.socket().saturated.store(true, Ordering::SeqCst);
        for i in 0..3u8 {
            ch.send_to(&[i], peer()).unwrap();
        }
        assert_eq!(ch.queued(), 3);
        assert!(ch.wants_write());

        // still saturated: the head datagram stalls and nothing is lost
        ch.flush_outbound().unwrap();
        assert_eq!(ch.queued(), 3);

        ch.socket().saturated.store(false, Ordering::SeqCst);
        ch.flush_outbound().unwrap();
        assert_eq!(ch.socket().payloads(), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(ch.queued(), 0);
        assert!(!ch.wants_write());
    }

    #[test]
    fn test_wait_producer_outruns_ring_without_reordering() {
        let ch = channel(4, OverflowStrategy::Wait);
        ch.socket().saturated.store(true, Ordering::SeqCst);

        let producer = {
            let ch = ch.clone();
            thread::spawn(move || {
                for i in 0..10u8 {
                    ch.send_to(&[i], peer()).unwrap();
                }
            })
        };
        for _ in 0..200 {
            if ch.queued() == 4 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ch.queued(), 4);
        assert!(!producer.is_finished());

        ch.socket().saturated.store(false, Ordering::SeqCst);
        while !producer.is_finished() || ch.queued() > 0 {
            ch.flush_outbound().unwrap();
            thread::yield_now();
        }
        producer.join().unwrap();
        ch.flush_outbound().unwrap();

        let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
        assert_eq!(ch.socket().payloads(), expected);
    }

    #[test]
    fn test_discard_drops_when_ring_full() {
        let ch = channel(2, OverflowStrategy::Discard);
        ch.socket().saturated.store(true, Ordering::SeqCst);
        for i in 0..3u8 {
            ch.send_to(&[i], peer()).unwrap();
        }
        assert_eq!(ch.queued(), 2);
        ch.socket().saturated.store(false, Ordering::SeqCst);
        ch.flush_outbound().unwrap();
        assert_eq!(ch.socket().payloads(), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_sessions_are_cached_per_remote() {
        let ch = channel(4, OverflowStrategy::Wait);
        let (a, created) = ch.session_for(peer());
        assert!(created);
        let (b, created) = ch.session_for(peer());
        assert!(!created);
        assert_eq!(a.id(), b.id());
        assert_eq!(ch.session_count(), 1);

        a.close(true);
        assert!(a.write(b"x").is_err());
        let (c, created) = ch.session_for(peer());
        assert!(created);
        assert_ne!(c.id(), a.id());
    }

    #[test]
    fn test_session_writes_form_one_datagram() {
        let ch = channel(4, OverflowStrategy::Wait);
        let s = ch.connect(peer());
        s.write(b"hello ").unwrap();
        s.write(b"world").unwrap();
        assert!(ch.socket().payloads().is_empty());
        s.flush().unwrap();
        s.flush().unwrap();
        assert_eq!(ch.socket().payloads(), vec![b"hello world".to_vec()]);
        assert_eq!(s.remote_addr().unwrap(), peer());
    }

    #[test]
    fn test_close_discards_queue_and_rejects_sends() {
        let ch = channel(4, OverflowStrategy::Wait);
        let s = ch.connect(peer());
        ch.socket().saturated.store(true, Ordering::SeqCst);
        ch.send_to(b"a", peer()).unwrap();
        ch.send_to(b"b", peer()).unwrap();

        ch.close();
        assert_eq!(ch.queued(), 0);
        assert!(ch.outbound.is_empty());
        assert!(matches!(ch.send_to(b"c", peer()), Err(Error::SessionClosed)));
        assert!(s.is_invalid());
        assert_eq!(ch.session_count(), 0);
    }
}
