//! Stream session: read buffer, decode loop, chunked write queue and the
//! optional TLS record layer.
//!
//! A session moves `Initializing -> Running -> Closing -> Closed`. Plain
//! sessions start in `Running`; TLS sessions stay in `Initializing` until the
//! engine reports the handshake complete. Application writes on a TLS session
//! wait for that moment, except on the event-loop thread itself, where they
//! are queued and sent once the handshake finishes.
//!
//! The owning event loop calls [`Session::start`] once, then
//! [`Session::on_readable`] and [`Session::on_writable`] as readiness arrives.
//! Application threads call the [`AioSession`] methods concurrently with it.
//!
//! Lock order is `reader -> writer -> engine`; no path takes them the other
//! way round and no processor callback runs while the writer lock is held.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::{NetConfig, OverflowStrategy};
use crate::error::{DecodeError, Error, Result};
use crate::protocol::{next_session_id, AioSession, MessageProcessor, Protocol, StateEvent};
use crate::tls::{self, HandshakeStep, TlsRecordEngine, Unwrapped, Wrapped};
use crate::transport::{write_some, Transport};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// How long a writer blocked on a full queue sleeps before retrying a flush
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionStatus {
    Initializing = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Initializing,
            1 => SessionStatus::Running,
            2 => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }
}

/// Record layer selected when the session is built
enum Security {
    Plain,
    Tls(TlsLayer),
}

struct TlsLayer {
    engine: Mutex<Box<dyn TlsRecordEngine>>,
    /// Opens once, when the handshake completes
    handshaken: Mutex<bool>,
    gate: Condvar,
}

impl TlsLayer {
    fn open_gate(&self) {
        let mut open = lock(&self.handshaken);
        if !*open {
            *open = true;
            self.gate.notify_all();
        }
    }

    /// Wakes gate waiters so they observe a closed session
    fn release_waiters(&self) {
        drop(lock(&self.handshaken));
        self.gate.notify_all();
    }
}

struct ReadHalf {
    /// Plaintext awaiting decode
    app: PooledBuffer,
    /// Ciphertext awaiting unwrap (TLS only)
    net: Option<PooledBuffer>,
}

struct WriteHalf {
    queue: VecDeque<PooledBuffer>,
    /// Ciphertext awaiting the socket (TLS only)
    net: Option<PooledBuffer>,
}

impl WriteHalf {
    fn free_space(&self, chunk_size: usize, chunk_count: usize) -> usize {
        let tail = self.queue.back().map_or(0, |c| c.remaining_mut());
        tail + chunk_count.saturating_sub(self.queue.len()) * chunk_size
    }

    /// Appends what fits and returns the rest.
    fn append<'a>(
        &mut self,
        mut data: &'a [u8],
        pool: &BufferPool,
        chunk_size: usize,
        chunk_count: usize,
    ) -> &'a [u8] {
        while !data.is_empty() {
            if let Some(tail) = self.queue.back_mut() {
                if !tail.is_full() {
                    let n = tail.put(data);
                    data = &data[n..];
                    continue;
                }
            }
            if self.queue.len() >= chunk_count {
                break;
            }
            self.queue.push_back(pool.allocate(chunk_size));
        }
        data
    }

    fn is_drained(&self) -> bool {
        self.queue.iter().all(|c| c.is_empty()) && self.net.as_ref().map_or(true, |n| n.is_empty())
    }
}

enum Input {
    Open,
    /// Peer finished sending (EOF or TLS close)
    Ended,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session<P, H, T = TcpStream>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
    T: Transport,
{
    id: u64,
    transport: T,
    protocol: Arc<P>,
    processor: Arc<H>,
    pool: BufferPool,
    status: AtomicU8,
    security: Security,
    reader: Mutex<ReadHalf>,
    writer: Mutex<WriteHalf>,
    /// Signalled whenever a flush made room in the write queue
    drained: Condvar,
    chunk_size: usize,
    chunk_count: usize,
    overflow: OverflowStrategy,
    event_loop: OnceLock<ThreadId>,
    created: Instant,
    last_active_ms: AtomicU64,
    /// Bytes written but not yet reported through `after_write`
    unreported: AtomicUsize,
}

impl<P, H, T> Session<P, H, T>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
    T: Transport,
{
    /// Builds a session over a connected, non-blocking transport. Passing an
    /// engine makes it a TLS session.
    ///
    /// The session does nothing until [`start`](Session::start) is called on
    /// the thread that will drive its readiness events.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use horizon_aio::protocol::{AioSession, DelimiterProtocol, MessageProcessor};
    /// use horizon_aio::{BufferPool, NetConfig, Session};
    /// use std::net::TcpStream;
    /// use std::sync::Arc;
    ///
    /// struct Print;
    ///
    /// impl MessageProcessor<Vec<u8>> for Print {
    ///     fn process(&self, _session: &dyn AioSession, line: Vec<u8>) {
    ///         println!("{}", String::from_utf8_lossy(&line));
    ///     }
    /// }
    ///
    /// let stream = TcpStream::connect("127.0.0.1:7000")?;
    /// stream.set_nonblocking(true)?;
    /// let config = NetConfig::default();
    /// let session = Session::new(
    ///     stream,
    ///     Arc::new(DelimiterProtocol::lines(1024)),
    ///     Arc::new(Print),
    ///     &config,
    ///     BufferPool::new(8, config.read_buffer_size),
    ///     None,
    /// );
    /// session.start();
    /// session.write(b"hello\n")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    ///
    /// # Performance Notes
    ///
    /// - Allocates the read buffer up front, plus two packet-sized buffers for
    ///   TLS sessions
    /// - Write chunks are taken from `pool` lazily and returned once sent
    pub fn new(
        transport: T,
        protocol: Arc<P>,
        processor: Arc<H>,
        config: &NetConfig,
        pool: BufferPool,
        engine: Option<Box<dyn TlsRecordEngine>>,
    ) -> Arc<Self> {
        let app = pool.allocate(config.read_buffer_size);
        let (security, net_in, net_out, status) = match engine {
            Some(engine) => {
                let packet = engine.packet_buffer_size();
                let layer = TlsLayer {
                    engine: Mutex::new(engine),
                    handshaken: Mutex::new(false),
                    gate: Condvar::new(),
                };
                (
                    Security::Tls(layer),
                    Some(pool.allocate(packet)),
                    Some(pool.allocate(packet)),
                    SessionStatus::Initializing,
                )
            }
            None => (Security::Plain, None, None, SessionStatus::Running),
        };
        Arc::new(Self {
            id: next_session_id(),
            transport,
            protocol,
            processor,
            status: AtomicU8::new(status as u8),
            security,
            reader: Mutex::new(ReadHalf { app, net: net_in }),
            writer: Mutex::new(WriteHalf { queue: VecDeque::new(), net: net_out }),
            drained: Condvar::new(),
            chunk_size: config.write_chunk_size,
            chunk_count: config.write_chunk_count,
            overflow: config.overflow,
            event_loop: OnceLock::new(),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            unreported: AtomicUsize::new(0),
            pool,
        })
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.security, Security::Tls(_))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Time since the last read or write
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        self.last_active_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Called once by the owning event loop, on its thread.
    pub fn start(&self) {
        // first call wins; a session is started exactly once
        let _ = self.event_loop.set(thread::current().id());
        self.processor.state_event(self, StateEvent::NewSession, None);
        if let Security::Tls(layer) = &self.security {
            let res = {
                let mut reader = lock(&self.reader);
                self.advance_handshake(&mut reader, layer)
            };
            self.report_written();
            if let Err(e) = res {
                self.fail(&e);
            }
        }
    }

    pub fn on_readable(&self) {
        if self.is_closed() {
            return;
        }
        let res = {
            let mut reader = lock(&self.reader);
            self.read_and_dispatch(&mut reader)
        };
        match res {
            Ok(Input::Open) => {
                if let Err(e) = self.flush_queued() {
                    self.fail(&e);
                }
            }
            Ok(Input::Ended) => {
                self.processor.state_event(self, StateEvent::InputShutdown, None);
                self.close(false);
            }
            Err(e) => self.fail(&e),
        }
    }

    pub fn on_writable(&self) {
        if self.is_closed() {
            return;
        }
        if let Security::Tls(layer) = &self.security {
            if self.status() == SessionStatus::Initializing {
                let res = {
                    let mut reader = lock(&self.reader);
                    self.advance_handshake(&mut reader, layer)
                };
                if let Err(e) = res {
                    self.fail(&e);
                    return;
                }
            }
        }
        if let Err(e) = self.flush_queued() {
            self.fail(&e);
        }
    }

    /// Reads until the transport would block, decoding after every read.
    fn read_and_dispatch(&self, reader: &mut ReadHalf) -> Result<Input> {
        loop {
            let target = match reader.net.as_mut() {
                Some(net) => net,
                None => &mut reader.app,
            };
            if target.is_full() {
                return Err(DecodeError::new(format!(
                    "no frame fits the {} byte read buffer",
                    target.capacity()
                ))
                .into());
            }
            match self.transport.read(target.writable()) {
                Ok(0) => return Ok(Input::Ended),
                Ok(n) => {
                    target.fill(n);
                    self.touch();
                    self.processor.after_read(self, n);
                    if let Input::Ended = self.process_input(reader)? {
                        return Ok(Input::Ended);
                    }
                    if self.status() >= SessionStatus::Closing {
                        return Ok(Input::Open);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Input::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn process_input(&self, reader: &mut ReadHalf) -> Result<Input> {
        let layer = match &self.security {
            Security::Plain => {
                self.decode_all(&mut reader.app)?;
                return Ok(Input::Open);
            }
            Security::Tls(layer) => layer,
        };
        if self.status() == SessionStatus::Initializing {
            self.advance_handshake(reader, layer)?;
        }
        let ReadHalf { app, net } = reader;
        let Some(net) = net.as_mut() else {
            return Ok(Input::Open);
        };
        loop {
            if self.status() != SessionStatus::Running {
                return Ok(Input::Open);
            }
            let outcome = {
                let mut engine = lock(&layer.engine);
                tls::unwrap_records(&mut **engine, net, app)?
            };
            let consumed = self.decode_all(app)?;
            match outcome {
                Unwrapped::NeedInput => return Ok(Input::Open),
                Unwrapped::Closed => return Ok(Input::Ended),
                Unwrapped::Drain if consumed == 0 => {
                    let max = lock(&layer.engine).application_buffer_size();
                    tls::grow_buffer(app, max, "application")?;
                }
                Unwrapped::Drain => {}
            }
        }
    }

    /// Decodes and dispatches complete messages; returns the bytes consumed.
    fn decode_all(&self, app: &mut PooledBuffer) -> Result<usize> {
        let mut consumed = 0;
        while !app.is_empty() && self.status() == SessionStatus::Running {
            let mut src = app.readable();
            let before = src.len();
            let decoded = self.protocol.decode(&mut src, self)?;
            let used = before - src.len();
            let Some(msg) = decoded else {
                break;
            };
            app.consume(used);
            consumed += used;
            self.processor.process(self, msg);
            if used == 0 {
                break;
            }
        }
        app.compact();
        Ok(consumed)
    }

    fn advance_handshake(&self, reader: &mut ReadHalf, layer: &TlsLayer) -> Result<()> {
        let mut writer = lock(&self.writer);
        let ReadHalf { app, net } = reader;
        let (Some(net_in), Some(net_out)) = (net.as_mut(), writer.net.as_mut()) else {
            return Ok(());
        };
        loop {
            let step = {
                let mut engine = lock(&layer.engine);
                tls::drive_handshake(&mut **engine, net_in, app, net_out)?
            };
            let sent_all = self.write_out(net_out)?;
            match step {
                HandshakeStep::Complete => {
                    let done = self.status.compare_exchange(
                        SessionStatus::Initializing as u8,
                        SessionStatus::Running as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    if done.is_ok() {
                        log::debug!("session {} handshake complete", self.id);
                        layer.open_gate();
                    }
                    return Ok(());
                }
                HandshakeStep::NeedInput => return Ok(()),
                HandshakeStep::Flush if sent_all => continue,
                // rest goes out on the next writable event
                HandshakeStep::Flush => return Ok(()),
            }
        }
    }

    /// Writes `buf` until empty or the transport would block; true when empty.
    fn write_out(&self, buf: &mut PooledBuffer) -> io::Result<bool> {
        if buf.is_empty() {
            return Ok(true);
        }
        let n = write_some(&self.transport, buf.readable())?;
        buf.consume(n);
        if n > 0 {
            self.touch();
            self.unreported.fetch_add(n, Ordering::Relaxed);
        }
        Ok(buf.is_empty())
    }

    /// Pushes queued chunks to the transport; true once nothing is left.
    fn flush_locked(&self, writer: &mut WriteHalf) -> Result<bool> {
        let WriteHalf { queue, net } = writer;
        match (&self.security, net.as_mut()) {
            (Security::Tls(layer), Some(net)) => loop {
                if !self.write_out(net)? {
                    return Ok(false);
                }
                if self.status() == SessionStatus::Initializing {
                    return Ok(queue.is_empty());
                }
                let Some(chunk) = queue.front_mut() else {
                    return Ok(true);
                };
                if chunk.is_empty() {
                    queue.pop_front();
                    continue;
                }
                let step = {
                    let mut engine = lock(&layer.engine);
                    tls::wrap_records(&mut **engine, chunk, net)?
                };
                if step == Wrapped::Done {
                    queue.pop_front();
                }
            },
            _ => loop {
                let Some(chunk) = queue.front_mut() else {
                    return Ok(true);
                };
                if !self.write_out(chunk)? {
                    return Ok(false);
                }
                queue.pop_front();
            },
        }
    }

    fn flush_queued(&self) -> Result<()> {
        let drained = {
            let mut writer = lock(&self.writer);
            let res = self.flush_locked(&mut writer);
            self.drained.notify_all();
            res
        };
        self.report_written();
        let drained = drained?;
        if drained && self.status() == SessionStatus::Closing {
            self.close_now();
        }
        Ok(())
    }

    /// Hands written byte counts to the processor, outside the writer lock.
    fn report_written(&self) {
        let n = self.unreported.swap(0, Ordering::Relaxed);
        if n > 0 {
            self.processor.after_write(self, n);
        }
    }

    /// Blocks until the TLS handshake completes. Returns false when the caller
    /// is the event loop, which must not wait on itself.
    fn await_handshake(&self) -> Result<bool> {
        let Security::Tls(layer) = &self.security else {
            return Ok(true);
        };
        let mut open = lock(&layer.handshaken);
        if !*open && self.event_loop.get() == Some(&thread::current().id()) {
            return Ok(false);
        }
        while !*open {
            if self.is_closed() {
                return Err(Error::SessionClosed);
            }
            open = layer.gate.wait(open).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(true)
    }

    fn queue_write(&self, data: &[u8], may_flush: bool) -> Result<()> {
        let mut writer = lock(&self.writer);
        if self.overflow == OverflowStrategy::Discard
            && writer.free_space(self.chunk_size, self.chunk_count) < data.len()
        {
            if may_flush {
                self.flush_locked(&mut writer)?;
                self.drained.notify_all();
            }
            if writer.free_space(self.chunk_size, self.chunk_count) < data.len() {
                log::debug!(
                    "session {} write queue full, dropping {} bytes",
                    self.id,
                    data.len()
                );
                return Ok(());
            }
        }
        // the event loop cannot wait on itself: writes it makes before the
        // handshake completes may exceed the queue limit
        let limit = if may_flush { self.chunk_count } else { usize::MAX };
        let mut rest = data;
        loop {
            rest = writer.append(rest, &self.pool, self.chunk_size, limit);
            if rest.is_empty() {
                return Ok(());
            }
            if may_flush && self.flush_locked(&mut writer)? {
                continue;
            }
            writer = self
                .drained
                .wait_timeout(writer, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if self.is_closed() {
                return Err(Error::SessionClosed);
            }
        }
    }

    /// Reports `err` to the processor and closes the session.
    fn fail(&self, err: &Error) {
        match err {
            Error::SessionClosed => {}
            Error::Decode(_) => {
                self.processor.state_event(self, StateEvent::DecodeException, Some(err))
            }
            Error::Tls(_) if self.status() == SessionStatus::Initializing => {
                self.processor.state_event(self, StateEvent::HandshakeFailure, Some(err))
            }
            Error::Tls(_) => {
                self.processor.state_event(self, StateEvent::DecodeException, Some(err))
            }
            _ => log::debug!("session {} failed: {}", self.id, err),
        }
        self.close_now();
    }

    fn close_now(&self) {
        let prev = self.status.swap(SessionStatus::Closed as u8, Ordering::SeqCst);
        if prev == SessionStatus::Closed as u8 {
            return;
        }
        if let Security::Tls(layer) = &self.security {
            lock(&layer.engine).close_outbound();
            layer.release_waiters();
        }
        self.drained.notify_all();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.queue.clear();
        }
        if let Err(e) = self.transport.shutdown() {
            log::debug!("session {} shutdown: {}", self.id, e);
        }
        self.processor.state_event(self, StateEvent::SessionClosed, None);
    }
}

impl<P, H, T> AioSession for Session<P, H, T>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
    T: Transport,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let may_flush = self.await_handshake()?;
        if self.status() >= SessionStatus::Closing {
            return Err(Error::SessionClosed);
        }
        self.touch();
        if let Err(e) = self.queue_write(data, may_flush) {
            self.fail(&e);
            return Err(e);
        }
        if !may_flush {
            return Ok(());
        }
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.flush_queued().inspect_err(|e| self.fail(e))
    }

    fn close(&self, immediate: bool) {
        if immediate {
            self.close_now();
            return;
        }
        loop {
            let current = self.status.load(Ordering::SeqCst);
            if current >= SessionStatus::Closing as u8 {
                return;
            }
            let swapped = self.status.compare_exchange(
                current,
                SessionStatus::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if swapped.is_ok() {
                break;
            }
        }
        self.processor.state_event(self, StateEvent::SessionClosing, None);
        if let Security::Tls(layer) = &self.security {
            layer.release_waiters();
        }
        let drained = lock(&self.writer).is_drained();
        if drained {
            self.close_now();
        } else if let Err(e) = self.flush_queued() {
            self.fail(&e);
        }
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.transport.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    fn is_invalid(&self) -> bool {
        self.status() >= SessionStatus::Closing
    }
}

impl<P, H, T> Drop for Session<P, H, T>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
    T: Transport,
{
    fn drop(&mut self) {
        if let Security::Tls(layer) = &self.security {
            if self.status() != SessionStatus::Closed {
                lock(&layer.engine).close_outbound();
            }
        }
    }
}
