//! Processor plugins
//!
//! A [`PluginProcessor`] wraps a [`MessageProcessor`] and runs a chain of
//! [`Plugin`]s in front of it. Plugins see every admission check, message,
//! lifecycle event and byte count before the wrapped processor does, and can
//! veto peers ([`Plugin::should_accept`]) or messages ([`Plugin::pre_process`]).
//!
//! Two plugins ship with the crate:
//!
//! - [`BlackListPlugin`] rejects peers by IP or by custom rule.
//! - [`MonitorPlugin`] counts traffic, messages and sessions, and can log a
//!   periodic report.
//!
//! # Examples
//!
//! ```rust,no_run
//! use horizon_aio::plugins::{BlackListPlugin, MonitorPlugin, PluginProcessor};
//! use horizon_aio::protocol::{AioSession, DelimiterProtocol, MessageProcessor};
//! use horizon_aio::{NetConfig, TcpServer};
//! use std::sync::Arc;
//! use std::time::Duration;
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
//! let blacklist = BlackListPlugin::new();
//! blacklist.block("10.0.0.66".parse()?);
//! let monitor = Arc::new(MonitorPlugin::new());
//! let _reporter = monitor.start_reporter(Duration::from_secs(60))?;
//!
//! let processor = PluginProcessor::new(Echo)
//!     .with_plugin(blacklist)
//!     .with_plugin(monitor.clone());
//! let server = TcpServer::bind(
//!     "0.0.0.0:7000".parse()?,
//!     DelimiterProtocol::lines(1024),
//!     processor,
//!     NetConfig::default(),
//! )?;
//! # drop(server);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::Error;
use crate::protocol::{AioSession, MessageProcessor, StateEvent};
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Hook set run by a [`PluginProcessor`]. Every method has a pass-through
/// default.
pub trait Plugin<M>: Send + Sync + 'static {
    fn should_accept(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// Returning false keeps `msg` from the wrapped processor. Later plugins
    /// still see it.
    fn pre_process(&self, _session: &dyn AioSession, _msg: &M) -> bool {
        true
    }

    fn state_event(&self, _session: &dyn AioSession, _event: StateEvent, _cause: Option<&Error>) {}

    fn after_read(&self, _session: &dyn AioSession, _n: usize) {}

    fn after_write(&self, _session: &dyn AioSession, _n: usize) {}
}

impl<M, T: Plugin<M>> Plugin<M> for Arc<T> {
    fn should_accept(&self, peer: SocketAddr) -> bool {
        (**self).should_accept(peer)
    }

    fn pre_process(&self, session: &dyn AioSession, msg: &M) -> bool {
        (**self).pre_process(session, msg)
    }

    fn state_event(&self, session: &dyn AioSession, event: StateEvent, cause: Option<&Error>) {
        (**self).state_event(session, event, cause)
    }

    fn after_read(&self, session: &dyn AioSession, n: usize) {
        (**self).after_read(session, n)
    }

    fn after_write(&self, session: &dyn AioSession, n: usize) {
        (**self).after_write(session, n)
    }
}

/// Runs plugins, in insertion order, in front of `H`
pub struct PluginProcessor<M, H> {
    inner: H,
    plugins: Vec<Box<dyn Plugin<M>>>,
}

impl<M: Send + 'static, H: MessageProcessor<M>> PluginProcessor<M, H> {
    pub fn new(inner: H) -> Self {
        Self { inner, plugins: Vec::new() }
    }

    pub fn with_plugin(mut self, plugin: impl Plugin<M>) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<M: Send + 'static, H: MessageProcessor<M>> MessageProcessor<M> for PluginProcessor<M, H> {
    fn process(&self, session: &dyn AioSession, msg: M) {
        let mut pass = true;
        for plugin in &self.plugins {
            if !plugin.pre_process(session, &msg) {
                pass = false;
            }
        }
        if pass {
            self.inner.process(session, msg);
        }
    }

    fn state_event(&self, session: &dyn AioSession, event: StateEvent, cause: Option<&Error>) {
        for plugin in &self.plugins {
            plugin.state_event(session, event, cause);
        }
        self.inner.state_event(session, event, cause);
    }

    fn should_accept(&self, peer: SocketAddr) -> bool {
        self.plugins.iter().all(|p| p.should_accept(peer)) && self.inner.should_accept(peer)
    }

    fn after_read(&self, session: &dyn AioSession, n: usize) {
        for plugin in &self.plugins {
            plugin.after_read(session, n);
        }
        self.inner.after_read(session, n);
    }

    fn after_write(&self, session: &dyn AioSession, n: usize) {
        for plugin in &self.plugins {
            plugin.after_write(session, n);
        }
        self.inner.after_write(session, n);
    }

    fn service_stopped(&self, cause: Option<&Error>) {
        self.inner.service_stopped(cause);
    }
}

/// Access rule: true lets the peer in
pub type AccessRule = Box<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Rejects blocked IPs and peers failing any custom rule
#[derive(Default)]
pub struct BlackListPlugin {
    blocked: RwLock<HashSet<IpAddr>>,
    rules: RwLock<Vec<AccessRule>>,
}

impl BlackListPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, ip: IpAddr) {
        self.blocked.write().unwrap_or_else(PoisonError::into_inner).insert(ip);
    }

    pub fn unblock(&self, ip: IpAddr) -> bool {
        self.blocked.write().unwrap_or_else(PoisonError::into_inner).remove(&ip)
    }

    pub fn add_rule(&self, rule: impl Fn(&SocketAddr) -> bool + Send + Sync + 'static) {
        self.rules.write().unwrap_or_else(PoisonError::into_inner).push(Box::new(rule));
    }

    pub fn allows(&self, peer: &SocketAddr) -> bool {
        if self.blocked.read().unwrap_or_else(PoisonError::into_inner).contains(&peer.ip()) {
            return false;
        }
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|rule| rule(peer))
    }
}

impl<M> Plugin<M> for BlackListPlugin {
    fn should_accept(&self, peer: SocketAddr) -> bool {
        let allowed = self.allows(&peer);
        if !allowed {
            log::debug!("blacklist rejected {}", peer);
        }
        allowed
    }
}

/// Counters collected over one reporting period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub inflow: u64,
    pub outflow: u64,
    pub reads: u64,
    pub writes: u64,
    pub messages: u64,
    pub decode_failures: u64,
    pub connected: u64,
    pub disconnected: u64,
    /// Sessions open at the end of the period
    pub online: u64,
    /// Messages since the plugin was created
    pub total_messages: u64,
}

/// Traffic and session counters.
///
/// # Performance Notes
///
/// Every hook is a single relaxed atomic add; nothing locks on the I/O path.
#[derive(Debug, Default)]
pub struct MonitorPlugin {
    inflow: AtomicU64,
    outflow: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    messages: AtomicU64,
    decode_failures: AtomicU64,
    connected: AtomicU64,
    disconnected: AtomicU64,
    online: AtomicU64,
    total_messages: AtomicU64,
}

impl MonitorPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters of the period just ended and starts a new one.
    pub fn take_stats(&self) -> MonitorStats {
        let take = |c: &AtomicU64| c.swap(0, Ordering::Relaxed);
        MonitorStats {
            inflow: take(&self.inflow),
            outflow: take(&self.outflow),
            reads: take(&self.reads),
            writes: take(&self.writes),
            messages: take(&self.messages),
            decode_failures: take(&self.decode_failures),
            connected: take(&self.connected),
            disconnected: take(&self.disconnected),
            online: self.online.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
        }
    }

    /// Logs the counters of the period just ended at info level.
    pub fn report(&self, period: Duration) -> MonitorStats {
        let stats = self.take_stats();
        let secs = period.as_secs_f64().max(f64::EPSILON);
        log::info!(
            "{:?} period: inflow {} B, outflow {} B, reads {}, writes {}, messages {} ({:.1}/s), \
             decode failures {}, connected {}, disconnected {}, online {}, messages total {}",
            period,
            stats.inflow,
            stats.outflow,
            stats.reads,
            stats.writes,
            stats.messages,
            stats.messages as f64 / secs,
            stats.decode_failures,
            stats.connected,
            stats.disconnected,
            stats.online,
            stats.total_messages,
        );
        stats
    }

    /// Calls [`report`](MonitorPlugin::report) every `period` on a background
    /// thread until the returned handle is dropped.
    pub fn start_reporter(self: &Arc<Self>, period: Duration) -> io::Result<Reporter> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let monitor = self.clone();
        let signal = stop.clone();
        let thread = thread::Builder::new()
            .name("monitor-reporter".into())
            .spawn(move || {
                let (flag, cv) = &*signal;
                let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    let (guard, timeout) = cv
                        .wait_timeout(stopped, period)
                        .unwrap_or_else(PoisonError::into_inner);
                    stopped = guard;
                    if *stopped {
                        return;
                    }
                    if timeout.timed_out() {
                        monitor.report(period);
                    }
                }
            })?;
        Ok(Reporter { stop, thread: Some(thread) })
    }
}

impl<M> Plugin<M> for MonitorPlugin {
    fn pre_process(&self, _session: &dyn AioSession, _msg: &M) -> bool {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn state_event(&self, _session: &dyn AioSession, event: StateEvent, _cause: Option<&Error>) {
        match event {
            StateEvent::NewSession => {
                self.connected.fetch_add(1, Ordering::Relaxed);
                self.online.fetch_add(1, Ordering::Relaxed);
            }
            StateEvent::SessionClosed => {
                self.disconnected.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .online
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            }
            StateEvent::DecodeException => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn after_read(&self, _session: &dyn AioSession, n: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inflow.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn after_write(&self, _session: &dyn AioSession, n: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.outflow.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Background reporting thread of a [`MonitorPlugin`]
pub struct Reporter {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Reporter {
    fn drop(&mut self) {
        let (flag, cv) = &*self.stop;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("monitor reporter panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::protocol::tests::NullSession;

    #[derive(Default)]
    struct Inner {
        seen: Mutex<Vec<u32>>,
        events: Mutex<Vec<StateEvent>>,
    }

    impl MessageProcessor<u32> for Arc<Inner> {
        fn process(&self, _session: &dyn AioSession, msg: u32) {
            self.seen.lock().unwrap().push(msg);
        }

        fn state_event(&self, _session: &dyn AioSession, event: StateEvent, _cause: Option<&Error>) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct OddFilter;

    impl Plugin<u32> for OddFilter {
        fn pre_process(&self, _session: &dyn AioSession, msg: &u32) -> bool {
            msg % 2 == 0
        }
    }

    #[test]
    fn test_veto_keeps_message_from_processor_but_not_from_later_plugins() {
        let inner = Arc::new(Inner::default());
        let monitor = Arc::new(MonitorPlugin::new());
        let processor = PluginProcessor::new(inner.clone())
            .with_plugin(OddFilter)
            .with_plugin(monitor.clone());

        for n in 1..=4 {
            processor.process(&NullSession, n);
        }
        assert_eq!(*inner.seen.lock().unwrap(), vec![2, 4]);
        assert_eq!(monitor.take_stats().messages, 4);
    }

    #[test]
    fn test_state_events_reach_plugins_and_processor() {
        let inner = Arc::new(Inner::default());
        let monitor = Arc::new(MonitorPlugin::new());
        let processor = PluginProcessor::<u32, _>::new(inner.clone()).with_plugin(monitor.clone());

        processor.state_event(&NullSession, StateEvent::NewSession, None);
        processor.state_event(&NullSession, StateEvent::NewSession, None);
        let err = Error::Decode(DecodeError::new("bad"));
        processor.state_event(&NullSession, StateEvent::DecodeException, Some(&err));
        processor.state_event(&NullSession, StateEvent::SessionClosed, None);

        let stats = monitor.take_stats();
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.disconnected, 1);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.online, 1);
        assert_eq!(inner.events.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_monitor_period_counters_reset() {
        let monitor = MonitorPlugin::new();
        Plugin::<u32>::after_read(&monitor, &NullSession, 100);
        Plugin::<u32>::after_read(&monitor, &NullSession, 20);
        Plugin::<u32>::after_write(&monitor, &NullSession, 7);
        Plugin::<u32>::pre_process(&monitor, &NullSession, &1);

        let first = monitor.take_stats();
        assert_eq!((first.inflow, first.reads), (120, 2));
        assert_eq!((first.outflow, first.writes), (7, 1));

        let second = monitor.take_stats();
        assert_eq!(second.inflow, 0);
        assert_eq!(second.messages, 0);
        assert_eq!(second.total_messages, 1);
    }

    #[test]
    fn test_blacklist_by_ip_and_rule() {
        let blacklist = BlackListPlugin::new();
        let bad: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let good: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        assert!(blacklist.allows(&bad));

        blacklist.block(bad.ip());
        assert!(!blacklist.allows(&bad));
        assert!(blacklist.allows(&good));

        blacklist.add_rule(|peer| peer.port() != 4000);
        assert!(!blacklist.allows(&good));
        assert!(blacklist.unblock(bad.ip()));
        assert!(!blacklist.allows(&bad));
    }

    #[test]
    fn test_processor_admission_combines_plugins() {
        let blacklist = Arc::new(BlackListPlugin::new());
        let processor =
            PluginProcessor::<u32, _>::new(Arc::new(Inner::default())).with_plugin(blacklist.clone());
        let peer: SocketAddr = "192.0.2.9:1".parse().unwrap();
        assert!(processor.should_accept(peer));
        blacklist.block(peer.ip());
        assert!(!processor.should_accept(peer));
    }

    #[test]
    fn test_reporter_stops_on_drop() {
        let monitor = Arc::new(MonitorPlugin::new());
        Plugin::<u32>::after_read(&*monitor, &NullSession, 5);
        let reporter = monitor.start_reporter(Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(60));
        drop(reporter);
        // the reporter took the period counters
        assert_eq!(monitor.take_stats().inflow, 0);
    }
}
