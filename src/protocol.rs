//! Application-facing seams: message decoding, processing and the session
//! handle passed to both.

use crate::error::{DecodeError, Error, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle and error notifications delivered to a [`MessageProcessor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    NewSession,
    /// The protocol rejected inbound bytes
    DecodeException,
    /// TLS handshake did not complete
    HandshakeFailure,
    /// The peer closed its sending side
    InputShutdown,
    /// Graceful close started; queued output is still being flushed
    SessionClosing,
    SessionClosed,
}

/// Handle to a TCP or UDP session, as seen by protocols and processors
pub trait AioSession: Send + Sync {
    /// Process-unique session id
    fn id(&self) -> u64;

    /// Queues `data` for sending. Whether it leaves immediately depends on the
    /// transport; call [`flush`](AioSession::flush) to push it out.
    fn write(&self, data: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Closes the session. A non-immediate close lets queued output drain
    /// first.
    fn close(&self, immediate: bool);

    fn remote_addr(&self) -> io::Result<SocketAddr>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// True once the session started closing
    fn is_invalid(&self) -> bool;
}

/// Turns inbound bytes into messages.
///
/// `decode` advances `src` past the bytes of a returned message. `Ok(None)`
/// means more input is needed and must leave `src` untouched; malformed input
/// is an `Err`, which the transport reports as
/// [`StateEvent::DecodeException`].
pub trait Protocol: Send + Sync + 'static {
    type Message: Send + 'static;

    fn decode(
        &self,
        src: &mut &[u8],
        session: &dyn AioSession,
    ) -> std::result::Result<Option<Self::Message>, DecodeError>;
}

/// Consumes decoded messages and lifecycle events
pub trait MessageProcessor<M>: Send + Sync + 'static {
    fn process(&self, session: &dyn AioSession, msg: M);

    fn state_event(&self, session: &dyn AioSession, event: StateEvent, cause: Option<&Error>) {
        match cause {
            Some(e) => log::debug!("session {} {:?}: {}", session.id(), event, e),
            None => log::debug!("session {} {:?}", session.id(), event),
        }
    }

    /// Admission check for a new peer: an accepted TCP connection, or the
    /// first datagram from a UDP remote. Rejected peers are dropped before a
    /// session is started.
    fn should_accept(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// `n` bytes arrived on `session` (ciphertext for TLS sessions).
    fn after_read(&self, _session: &dyn AioSession, _n: usize) {}

    /// `n` bytes left through `session`'s transport.
    fn after_write(&self, _session: &dyn AioSession, _n: usize) {}

    /// The polling thread of a service stopped on its own, e.g. after a fatal
    /// readiness error.
    fn service_stopped(&self, cause: Option<&Error>) {
        match cause {
            Some(e) => log::error!("service stopped: {}", e),
            None => log::info!("service stopped"),
        }
    }
}

/// Frames separated by a fixed delimiter; the delimiter is stripped.
#[derive(Debug, Clone)]
pub struct DelimiterProtocol {
    delimiter: Vec<u8>,
    max_frame: usize,
}

impl DelimiterProtocol {
    /// # Panics
    ///
    /// Panics if `delimiter` is empty.
    pub fn new(delimiter: impl Into<Vec<u8>>, max_frame: usize) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "delimiter must not be empty");
        Self { delimiter, max_frame }
    }

    /// `\n`-terminated lines up to `max_frame` bytes
    pub fn lines(max_frame: usize) -> Self {
        Self::new(b"\n".to_vec(), max_frame)
    }
}

impl Protocol for DelimiterProtocol {
    type Message = Vec<u8>;

    fn decode(
        &self,
        src: &mut &[u8],
        _session: &dyn AioSession,
    ) -> std::result::Result<Option<Vec<u8>>, DecodeError> {
        let found = src
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_slice());
        match found {
            Some(pos) if pos > self.max_frame => Err(DecodeError::new(format!(
                "frame of {pos} bytes exceeds limit {}",
                self.max_frame
            ))),
            Some(pos) => {
                let frame = src[..pos].to_vec();
                *src = &src[pos + self.delimiter.len()..];
                Ok(Some(frame))
            }
            None if src.len() > self.max_frame + self.delimiter.len() => Err(DecodeError::new(
                format!("no delimiter within {} bytes", self.max_frame),
            )),
            None => Ok(None),
        }
    }
}

/// Process-wide session id sequence. Lives for the whole process; ids are
/// never reused.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}
