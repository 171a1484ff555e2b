//! Mio-based readiness runtime
//!
//! Thin wrapper over `mio::Poll` used by every polling thread in the crate:
//!
//! - **Linux**: epoll
//! - **macOS / BSD**: kqueue
//!
//! Sockets stay plain `std::net` types shared between threads; they are
//! registered by raw descriptor through [`SourceFd`], so interest can be
//! changed from any thread holding the [`Registry`] without exclusive access
//! to the socket. Registrations are edge-triggered.
//!
//! The runtime owns a [`Waker`] bound to [`WAKE_TOKEN`] so other threads can
//! interrupt a blocked wait to hand over commands or request shutdown.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the runtime's waker
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Readiness reported for one registered source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up on the descriptor
    pub failed: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(ev: &mio::event::Event) -> Self {
        Self {
            token: ev.token(),
            readable: ev.is_readable() || ev.is_read_closed(),
            writable: ev.is_writable(),
            failed: ev.is_error(),
        }
    }
}

/// Poll instance plus its event buffer and waker
#[derive(Debug)]
pub struct Runtime {
    poll: Poll,
    events: Events,
    poll_timeout: Duration,
    registry: Arc<Registry>,
    waker: Arc<Waker>,
}

impl Runtime {
    /// Creates a runtime with room for `event_capacity` events per wait
    pub fn with_capacity(event_capacity: usize, poll_timeout: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            poll_timeout,
            registry,
            waker,
        })
    }

    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Shared handle for (re)registering sources from any thread
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Waits once (up to `timeout`, or the configured poll timeout) and feeds
    /// each event to `f`. Waker events are swallowed; the return value counts
    /// the events delivered to `f`.
    pub fn poll_once<F: FnMut(Readiness)>(
        &mut self,
        timeout: Option<Duration>,
        mut f: F,
    ) -> io::Result<usize> {
        let timeout = timeout.unwrap_or(self.poll_timeout);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }
        let mut count = 0;
        for ev in self.events.iter() {
            if ev.token() == WAKE_TOKEN {
                continue;
            }
            count += 1;
            f(Readiness::from(ev));
        }
        Ok(count)
    }
}

/// Registers a raw descriptor
pub fn register_fd(registry: &Registry, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
    registry.register(&mut SourceFd(&fd), token, interest)
}

/// Replaces the interest set of a registered descriptor
pub fn reregister_fd(registry: &Registry, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
    registry.reregister(&mut SourceFd(&fd), token, interest)
}

pub fn deregister_fd(registry: &Registry, fd: RawFd) -> io::Result<()> {
    registry.deregister(&mut SourceFd(&fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;

    fn runtime() -> Runtime {
        Runtime::with_capacity(64, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_poll_timeout_configuration() {
        let mut rt = runtime();
        rt.set_poll_timeout(Duration::from_millis(5));
        assert_eq!(rt.poll_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn test_udp_readiness() {
        let mut rt = runtime();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        register_fd(&rt.registry(), socket.as_raw_fd(), Token(3), Interest::READABLE).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", socket.local_addr().unwrap()).unwrap();

        let mut seen = Vec::new();
        for _ in 0..100 {
            rt.poll_once(Some(Duration::from_millis(20)), |r| seen.push(r)).unwrap();
            if !seen.is_empty() {
                break;
            }
        }
        assert!(seen.iter().any(|r| r.token == Token(3) && r.readable));
        deregister_fd(&rt.registry(), socket.as_raw_fd()).unwrap();
    }

    #[test]
    fn test_waker_interrupts_wait_without_events() {
        let mut rt = runtime();
        rt.waker().wake().unwrap();
        let delivered = rt.poll_once(Some(Duration::from_secs(5)), |_| {}).unwrap();
        assert_eq!(delivered, 0);
    }
}
