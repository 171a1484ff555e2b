//! UDP selector: one polling thread multiplexing many channels, feeding a
//! pool of worker threads through a bounded task ring.
//!
//! The polling thread receives at most [`MAX_READ_PER_WAKE`] datagrams per
//! channel per wake into a standby buffer, swaps a fresh one in, and hands the
//! filled buffer to the workers. When the task ring is full it stops reading:
//! the datagram already in hand is parked and the channel goes on a backlog
//! that is retried before the next blocking wait, since edge-triggered
//! readiness will not be reported again for data left in the socket.
//!
//! Workers decode each datagram completely, dispatch the messages, then flush
//! the session's reply.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::NetConfig;
use crate::error::{DecodeError, Error};
use crate::protocol::{AioSession, MessageProcessor, Protocol, StateEvent};
use crate::ring_buffer::{DefaultFactory, RingBuffer};
use crate::rt_mio::{Readiness, Runtime};
use crate::udp::DatagramSocket;
use crate::udp_channel::UdpChannel;
use mio::{Token, Waker};
use slab::Slab;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Datagrams read from one channel before the others get a turn
pub const MAX_READ_PER_WAKE: usize = 16;

const EVENT_CAPACITY: usize = 256;
/// Wait between retries while the task ring is full
const BACKLOG_RETRY: Duration = Duration::from_millis(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) enum WorkItem {
    Datagram {
        channel: Arc<UdpChannel>,
        remote: SocketAddr,
        payload: PooledBuffer,
    },
    Shutdown,
}

type TaskRing = RingBuffer<Option<WorkItem>>;

/// Handle to a running selector and its workers
pub struct SelectorWorker {
    id: u64,
    pending: Arc<Mutex<Vec<Arc<UdpChannel>>>>,
    waker: Arc<Waker>,
    tasks: Arc<TaskRing>,
    shutdown: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl SelectorWorker {
    /// Spawns the polling thread and `config.worker_threads` workers.
    ///
    /// Channels are added afterwards with [`register`](SelectorWorker::register).
    /// [`UdpBootstrap`](crate::UdpBootstrap) wraps this for the common case.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use horizon_aio::protocol::{AioSession, DelimiterProtocol, MessageProcessor};
    /// use horizon_aio::selector::SelectorWorker;
    /// use horizon_aio::udp::bind_udp;
    /// use horizon_aio::{BufferPool, NetConfig, UdpChannel};
    /// use std::sync::Arc;
    ///
    /// struct Echo;
    ///
    /// impl MessageProcessor<Vec<u8>> for Echo {
    ///     fn process(&self, session: &dyn AioSession, mut line: Vec<u8>) {
    ///         line.push(b'\n');
    ///         let _ = session.write(&line);
    ///     }
    /// }
    ///
    /// let config = NetConfig::default();
    /// let pool = BufferPool::new(64, config.read_buffer_size);
    /// let mut selector = SelectorWorker::start(
    ///     1,
    ///     Arc::new(DelimiterProtocol::lines(512)),
    ///     Arc::new(Echo),
    ///     &config,
    ///     pool.clone(),
    /// )?;
    /// let socket = bind_udp("0.0.0.0:9000".parse()?, &config)?;
    /// selector.register(UdpChannel::new(socket, &config, pool))?;
    /// // ...
    /// selector.shutdown();
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    ///
    /// # Performance Notes
    ///
    /// - One thread polls every registered channel; decoding and processing
    ///   run on the workers
    /// - Datagrams are read into pooled buffers and handed over without copying
    /// - A full task queue parks the datagram and pauses reads instead of
    ///   dropping it
    pub fn start<P, H>(
        id: u64,
        protocol: Arc<P>,
        processor: Arc<H>,
        config: &NetConfig,
        pool: BufferPool,
    ) -> io::Result<Self>
    where
        P: Protocol,
        H: MessageProcessor<P::Message>,
    {
        let runtime = Runtime::with_capacity(EVENT_CAPACITY, config.poll_timeout())?;
        let waker = runtime.waker();
        let tasks: Arc<TaskRing> = Arc::new(RingBuffer::new(config.worker_queue_capacity, DefaultFactory));
        let pending = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_threads);
        for i in 0..config.worker_threads {
            let tasks = tasks.clone();
            let protocol = protocol.clone();
            let processor = processor.clone();
            let handle = thread::Builder::new()
                .name(format!("udp-worker-{id}-{i}"))
                .spawn(move || work(&tasks, &*protocol, &*processor))?;
            workers.push(handle);
        }

        let poller = Poller::<P, H> {
            id,
            runtime,
            channels: Slab::new(),
            pending: pending.clone(),
            tasks: tasks.clone(),
            read_size: config.read_buffer_size,
            standby: pool.allocate(config.read_buffer_size),
            pool,
            parked: None,
            backlog: Vec::new(),
            busy: false,
            shutdown: shutdown.clone(),
            processor,
            _protocol: PhantomData,
        };
        let poller = thread::Builder::new()
            .name(format!("udp-selector-{id}"))
            .spawn(move || poller.run())?;

        log::info!("udp selector {} started with {} workers", id, workers.len());
        Ok(Self {
            id,
            pending,
            waker,
            tasks,
            shutdown,
            poller: Some(poller),
            workers,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hands `channel` to the polling thread, which registers it.
    pub fn register(&self, channel: Arc<UdpChannel>) -> io::Result<()> {
        lock(&self.pending).push(channel);
        self.waker.wake()
    }

    /// Stops polling, closes every channel, lets the workers finish queued
    /// datagrams and joins all threads.
    pub fn shutdown(&mut self) {
        let Some(poller) = self.poller.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::warn!("failed to wake udp selector {}: {}", self.id, e);
        }
        if poller.join().is_err() {
            log::error!("udp selector {} panicked", self.id);
        }
        for _ in 0..self.workers.len() {
            let slot = self.tasks.acquire_write_slot();
            *self.tasks.get(slot) = Some(WorkItem::Shutdown);
            self.tasks.publish_write(slot);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("udp worker of selector {} panicked", self.id);
            }
        }
        log::info!("udp selector {} stopped", self.id);
    }
}

impl Drop for SelectorWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Poller<P: Protocol, H: MessageProcessor<P::Message>> {
    id: u64,
    runtime: Runtime,
    channels: Slab<Arc<UdpChannel>>,
    pending: Arc<Mutex<Vec<Arc<UdpChannel>>>>,
    tasks: Arc<TaskRing>,
    pool: BufferPool,
    read_size: usize,
    standby: PooledBuffer,
    /// Received datagram the full task ring could not take
    parked: Option<WorkItem>,
    /// Channels that may still hold unread datagrams
    backlog: Vec<usize>,
    /// A channel hit the per-wake read limit
    busy: bool,
    shutdown: Arc<AtomicBool>,
    processor: Arc<H>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol, H: MessageProcessor<P::Message>> Poller<P, H> {
    fn run(mut self) {
        let mut ready: Vec<Readiness> = Vec::with_capacity(EVENT_CAPACITY);
        let mut failure = None;
        while !self.shutdown.load(Ordering::Acquire) {
            self.register_pending();
            let timeout = match (self.backlog.is_empty(), self.busy && self.parked.is_none()) {
                (true, _) => None,
                (false, true) => Some(Duration::ZERO),
                (false, false) => Some(BACKLOG_RETRY),
            };
            self.busy = false;
            if let Err(e) = self.runtime.poll_once(timeout, |r| ready.push(r)) {
                failure = Some(e);
                break;
            }
            for r in ready.drain(..) {
                self.dispatch(r);
            }
            if self.unpark() {
                for key in std::mem::take(&mut self.backlog) {
                    self.drain(key);
                }
            }
        }
        self.close_all();
        if let Some(e) = failure {
            log::error!("udp selector {} failed: {}", self.id, e);
            self.processor.service_stopped(Some(&Error::Io(e)));
        }
    }

    fn register_pending(&mut self) {
        let pending = std::mem::take(&mut *lock(&self.pending));
        for channel in pending {
            let entry = self.channels.vacant_entry();
            let key = entry.key();
            match channel.attach(self.runtime.registry(), Token(key)) {
                Ok(()) => {
                    log::debug!("udp selector {} registered channel {}", self.id, channel.id());
                    entry.insert(channel);
                }
                Err(e) => {
                    log::warn!("channel {} registration failed: {}", channel.id(), e);
                    channel.close();
                }
            }
        }
    }

    fn dispatch(&mut self, r: Readiness) {
        let key = r.token.0;
        let Some(channel) = self.channels.get(key).cloned() else {
            return;
        };
        if r.writable {
            if let Err(e) = channel.flush_outbound() {
                log::warn!("channel {} send failed: {}", channel.id(), e);
                self.remove(key);
                return;
            }
        }
        if r.readable || r.failed {
            self.drain(key);
        }
    }

    fn drain(&mut self, key: usize) {
        let Some(channel) = self.channels.get(key).cloned() else {
            return;
        };
        if self.parked.is_some() {
            self.defer(key);
            return;
        }
        for _ in 0..MAX_READ_PER_WAKE {
            match channel.socket().recv_from(self.standby.writable()) {
                Ok((n, remote)) => {
                    self.standby.fill(n);
                    let payload = std::mem::replace(&mut self.standby, self.pool.allocate(self.read_size));
                    let item = WorkItem::Datagram { channel: channel.clone(), remote, payload };
                    if !self.hand_off(item) {
                        self.defer(key);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("channel {} receive failed: {}", channel.id(), e);
                    self.remove(key);
                    return;
                }
            }
        }
        self.busy = true;
        self.defer(key);
    }

    fn defer(&mut self, key: usize) {
        if !self.backlog.contains(&key) {
            self.backlog.push(key);
        }
    }

    /// Publishes `item` to the workers; parks it when the ring is full.
    fn hand_off(&mut self, item: WorkItem) -> bool {
        match self.tasks.try_acquire_write_slot() {
            Some(slot) => {
                *self.tasks.get(slot) = Some(item);
                self.tasks.publish_write(slot);
                true
            }
            None => {
                self.parked = Some(item);
                false
            }
        }
    }

    /// Retries the parked datagram; true when nothing is parked any more.
    fn unpark(&mut self) -> bool {
        match self.parked.take() {
            Some(item) => self.hand_off(item),
            None => true,
        }
    }

    fn remove(&mut self, key: usize) {
        if let Some(channel) = self.channels.try_remove(key) {
            channel.close();
        }
        self.backlog.retain(|k| *k != key);
    }

    fn close_all(&mut self) {
        for channel in self.channels.drain() {
            channel.close();
        }
        for channel in lock(&self.pending).drain(..) {
            channel.close();
        }
        self.parked = None;
    }
}

fn work<P, H>(tasks: &TaskRing, protocol: &P, processor: &H)
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    loop {
        let index = tasks.acquire_read_slot();
        let item = tasks.get(index).take();
        tasks.publish_read(index);
        match item {
            Some(WorkItem::Datagram { channel, remote, payload }) => {
                let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                    handle_datagram(protocol, processor, &*channel, remote, payload)
                }));
                if handled.is_err() {
                    log::error!("datagram handler panicked on channel {}", channel.id());
                }
            }
            Some(WorkItem::Shutdown) => return,
            None => {}
        }
    }
}

/// Decodes every message in one datagram, dispatches them, then sends the
/// session's reply.
pub(crate) fn handle_datagram<P, H, S>(
    protocol: &P,
    processor: &H,
    channel: &UdpChannel<S>,
    remote: SocketAddr,
    payload: PooledBuffer,
) where
    P: Protocol,
    H: MessageProcessor<P::Message>,
    S: DatagramSocket,
{
    let (session, created) = channel.session_for(remote);
    if created {
        if !processor.should_accept(remote) {
            log::debug!("channel {} rejected datagram from {}", channel.id(), remote);
            session.close(true);
            return;
        }
        processor.state_event(&*session, StateEvent::NewSession, None);
    }
    processor.after_read(&*session, payload.len());
    let mut src = payload.readable();
    while !src.is_empty() {
        let before = src.len();
        match protocol.decode(&mut src, &*session) {
            Ok(Some(msg)) => {
                processor.process(&*session, msg);
                if src.len() == before {
                    break;
                }
            }
            Ok(None) => {
                let err = Error::Decode(DecodeError::new(format!(
                    "{} trailing bytes in datagram from {}",
                    src.len(),
                    remote
                )));
                processor.state_event(&*session, StateEvent::DecodeException, Some(&err));
                break;
            }
            Err(e) => {
                processor.state_event(&*session, StateEvent::DecodeException, Some(&e.into()));
                break;
            }
        }
    }
    let reply = session.pending_reply();
    match session.flush() {
        Ok(()) if reply > 0 => processor.after_write(&*session, reply),
        Ok(()) | Err(Error::SessionClosed) => {}
        Err(e) => {
            log::warn!("channel {} reply to {} failed: {}", channel.id(), remote, e);
            channel.close();
        }
    }
    payload.release();
}
