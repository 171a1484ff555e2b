//! TCP server and client
//!
//! Both run one polling thread that owns a [`Runtime`] and a slab of
//! [`Session`]s keyed by their mio token. Streams are registered for
//! `READABLE | WRITABLE` once, edge-triggered, and every readiness event is
//! handed to the session; closed sessions are deregistered and dropped by the
//! loop.
//!
//! # Examples
//!
//! ```rust,no_run
//! use horizon_aio::protocol::{AioSession, DelimiterProtocol, MessageProcessor};
//! use horizon_aio::{NetConfig, TcpServer};
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
//! let mut server = TcpServer::bind(
//!     "127.0.0.1:7000".parse()?,
//!     DelimiterProtocol::lines(1024),
//!     Echo,
//!     NetConfig::default(),
//! )?;
//! println!("listening on {}", server.local_addr());
//! server.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::buffer_pool::BufferPool;
use crate::config::{apply_socket_options, NetConfig};
use crate::error::{Error, Result};
use crate::protocol::{AioSession, MessageProcessor, Protocol};
use crate::raw as r;
use crate::rt_mio::{deregister_fd, register_fd, Readiness, Runtime};
use crate::session::Session;
use crate::tls::TlsEngineFactory;
use mio::{Interest, Token, Waker};
use slab::Slab;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

const LISTENER: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 1024;

/// Binds a non-blocking listener with the socket options of `cfg` applied
/// before `bind`.
pub fn bind_listener(addr: SocketAddr, cfg: &NetConfig) -> io::Result<TcpListener> {
    let (domain, sa, len) = r::to_sockaddr(addr);
    let os = r::socket(domain, r::Type::Stream)?;
    // owned from here on; dropped (closed) on any error below
    let listener = r::tcp_listener_from_os(os);
    r::set_nonblocking(os, true)?;
    apply_socket_options(os, domain, r::Type::Stream, cfg)?;
    r::bind_raw(os, &sa, len)?;
    r::listen_raw(os, cfg.tcp_backlog.unwrap_or(1024))?;
    Ok(listener)
}

/// Polling thread state shared by server and client
struct Reactor<P: Protocol, H: MessageProcessor<P::Message>> {
    runtime: Runtime,
    listener: Option<TcpListener>,
    sessions: Slab<Arc<Session<P, H>>>,
    protocol: Arc<P>,
    processor: Arc<H>,
    config: NetConfig,
    pool: BufferPool,
    tls: Option<Arc<dyn TlsEngineFactory>>,
    shutdown: Arc<AtomicBool>,
    last_sweep: Instant,
}

impl<P: Protocol, H: MessageProcessor<P::Message>> Reactor<P, H> {
    fn new(
        protocol: Arc<P>,
        processor: Arc<H>,
        config: NetConfig,
        tls: Option<Arc<dyn TlsEngineFactory>>,
    ) -> io::Result<Self> {
        let runtime = Runtime::with_capacity(EVENT_CAPACITY, config.poll_timeout())?;
        Ok(Self {
            runtime,
            listener: None,
            sessions: Slab::new(),
            protocol,
            processor,
            pool: BufferPool::new(64, config.read_buffer_size.max(config.write_chunk_size)),
            config,
            tls,
            shutdown: Arc::new(AtomicBool::new(false)),
            last_sweep: Instant::now(),
        })
    }

    fn listen(&mut self, listener: TcpListener) -> io::Result<()> {
        register_fd(&self.runtime.registry(), listener.as_raw_fd(), LISTENER, Interest::READABLE)?;
        self.listener = Some(listener);
        Ok(())
    }

    fn session_for(&self, stream: TcpStream, client_mode: bool) -> Result<Arc<Session<P, H>>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.config.tcp_nodelay)?;
        let engine = match &self.tls {
            Some(factory) => Some(factory.create(client_mode)?),
            None => None,
        };
        Ok(Session::new(
            stream,
            self.protocol.clone(),
            self.processor.clone(),
            &self.config,
            self.pool.clone(),
            engine,
        ))
    }

    fn register(&mut self, session: Arc<Session<P, H>>) -> io::Result<usize> {
        let entry = self.sessions.vacant_entry();
        let key = entry.key();
        register_fd(
            &self.runtime.registry(),
            session.transport().as_raw_fd(),
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(session);
        Ok(key)
    }

    fn run(mut self) {
        let started: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in started {
            self.sessions[key].start();
            self.reap(key);
        }

        let mut ready = Vec::with_capacity(EVENT_CAPACITY);
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.runtime.poll_once(None, |r| ready.push(r)) {
                log::error!("tcp event loop failed: {}", e);
                self.processor.service_stopped(Some(&Error::Io(e)));
                break;
            }
            for r in ready.drain(..) {
                self.dispatch(r);
            }
            self.sweep_idle();
            if self.listener.is_none() && self.sessions.is_empty() {
                break;
            }
        }
        self.close_all();
    }

    fn dispatch(&mut self, r: Readiness) {
        if r.token == LISTENER {
            self.accept();
            return;
        }
        let Some(session) = self.sessions.get(r.token.0).cloned() else {
            return;
        };
        if r.failed && !r.readable {
            session.close(true);
        } else {
            if r.readable {
                session.on_readable();
            }
            if r.writable {
                session.on_writable();
            }
        }
        self.reap(r.token.0);
    }

    fn accept(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    return;
                }
            };
            if !self.processor.should_accept(peer) {
                log::debug!("rejected connection from {}", peer);
                continue;
            }
            let adopted = self
                .session_for(stream, false)
                .and_then(|s| Ok(self.register(s)?));
            match adopted {
                Ok(key) => {
                    log::debug!("accepted {} as session {}", peer, self.sessions[key].id());
                    self.sessions[key].start();
                    self.reap(key);
                }
                Err(e) => log::warn!("dropping connection from {}: {}", peer, e),
            }
        }
    }

    /// Drops the session at `key` if it has closed.
    fn reap(&mut self, key: usize) {
        if self.sessions.get(key).is_some_and(|s| s.is_closed()) {
            let session = self.sessions.remove(key);
            if let Err(e) = deregister_fd(&self.runtime.registry(), session.transport().as_raw_fd()) {
                log::debug!("deregister session {}: {}", session.id(), e);
            }
        }
    }

    fn sweep_idle(&mut self) {
        let Some(limit) = self.config.idle_timeout else {
            return;
        };
        if self.last_sweep.elapsed() < self.config.poll_timeout() {
            return;
        }
        self.last_sweep = Instant::now();
        let idle: Vec<usize> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.idle_for() >= limit)
            .map(|(key, _)| key)
            .collect();
        for key in idle {
            log::debug!("session {} idle for over {:?}, closing", self.sessions[key].id(), limit);
            self.sessions[key].close(true);
            self.reap(key);
        }
    }

    fn close_all(&mut self) {
        let registry = self.runtime.registry();
        if let Some(listener) = self.listener.take() {
            let _ = deregister_fd(&registry, listener.as_raw_fd());
        }
        for session in self.sessions.drain() {
            let _ = deregister_fd(&registry, session.transport().as_raw_fd());
            session.close(true);
        }
    }
}

/// Handle to a running polling thread
struct LoopHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl LoopHandle {
    fn spawn<P, H>(name: String, reactor: Reactor<P, H>) -> io::Result<Self>
    where
        P: Protocol,
        H: MessageProcessor<P::Message>,
    {
        let shutdown = reactor.shutdown.clone();
        let waker = reactor.runtime.waker();
        let thread = thread::Builder::new().name(name).spawn(move || reactor.run())?;
        Ok(Self { shutdown, waker, thread: Some(thread) })
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::warn!("failed to wake event loop: {}", e);
        }
        if thread.join().is_err() {
            log::error!("event loop thread panicked");
        }
    }
}

/// Accepts connections and runs one [`Session`] per stream
pub struct TcpServer {
    local_addr: SocketAddr,
    handle: LoopHandle,
}

impl TcpServer {
    pub fn bind<P, H>(addr: SocketAddr, protocol: P, processor: H, config: NetConfig) -> Result<Self>
    where
        P: Protocol,
        H: MessageProcessor<P::Message>,
    {
        Self::start(addr, protocol, processor, config, None)
    }

    /// Like [`bind`](TcpServer::bind), terminating TLS on every accepted
    /// stream with engines from `factory`.
    pub fn bind_tls<P, H>(
        addr: SocketAddr,
        protocol: P,
        processor: H,
        config: NetConfig,
        factory: Arc<dyn TlsEngineFactory>,
    ) -> Result<Self>
    where
        P: Protocol,
        H: MessageProcessor<P::Message>,
    {
        Self::start(addr, protocol, processor, config, Some(factory))
    }

    fn start<P, H>(
        addr: SocketAddr,
        protocol: P,
        processor: H,
        config: NetConfig,
        tls: Option<Arc<dyn TlsEngineFactory>>,
    ) -> Result<Self>
    where
        P: Protocol,
        H: MessageProcessor<P::Message>,
    {
        config.validate()?;
        let listener = bind_listener(addr, &config)?;
        let local_addr = listener.local_addr()?;
        let mut reactor = Reactor::new(Arc::new(protocol), Arc::new(processor), config, tls)?;
        reactor.listen(listener)?;
        let handle = LoopHandle::spawn(format!("tcp-server-{}", local_addr.port()), reactor)?;
        log::info!("tcp server listening on {}", local_addr);
        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every session and joins the polling thread.
    pub fn shutdown(&mut self) {
        if self.handle.thread.is_some() {
            self.handle.stop();
            log::info!("tcp server on {} stopped", self.local_addr);
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One outbound connection driven by its own polling thread
pub struct TcpClient<P: Protocol, H: MessageProcessor<P::Message>> {
    session: Arc<Session<P, H>>,
    handle: LoopHandle,
}

impl<P: Protocol, H: MessageProcessor<P::Message>> TcpClient<P, H> {
    /// Connects to `addr`, bounded by `config.connect_timeout` when set.
    pub fn connect(addr: SocketAddr, protocol: P, processor: H, config: NetConfig) -> Result<Self> {
        Self::start(addr, protocol, processor, config, None)
    }

    pub fn connect_tls(
        addr: SocketAddr,
        protocol: P,
        processor: H,
        config: NetConfig,
        factory: Arc<dyn TlsEngineFactory>,
    ) -> Result<Self> {
        Self::start(addr, protocol, processor, config, Some(factory))
    }

    fn start(
        addr: SocketAddr,
        protocol: P,
        processor: H,
        config: NetConfig,
        tls: Option<Arc<dyn TlsEngineFactory>>,
    ) -> Result<Self> {
        config.validate()?;
        let stream = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        let mut reactor = Reactor::new(Arc::new(protocol), Arc::new(processor), config, tls)?;
        let session = reactor.session_for(stream, true)?;
        reactor.register(session.clone())?;
        let handle = LoopHandle::spawn(format!("tcp-client-{}", session.id()), reactor)?;
        log::debug!("session {} connected to {}", session.id(), addr);
        Ok(Self { session, handle })
    }

    pub fn session(&self) -> &Arc<Session<P, H>> {
        &self.session
    }

    /// Closes the session and joins the polling thread.
    pub fn shutdown(&mut self) {
        self.handle.stop();
    }
}

impl<P: Protocol, H: MessageProcessor<P::Message>> Drop for TcpClient<P, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
