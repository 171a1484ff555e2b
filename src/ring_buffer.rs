//! Bounded handoff ring with a per-slot state machine
//!
//! Every slot cycles through `Writable -> Writing -> Readable -> Reading ->
//! Writable`. Producers claim the slot under the write cursor, fill it through
//! [`RingBuffer::get`] and hand it over with [`RingBuffer::publish_write`];
//! consumers do the mirror image. The slot status is the only thing that
//! transfers ownership of a payload between threads.
//!
//! Cursors live behind one mutex. Waiting threads announce themselves through
//! a pending-signal flag before they re-check the slot, so a publisher only
//! touches the mutex and the condition variable when somebody is actually
//! parked.
//!
//! ```rust
//! use horizon_aio::ring_buffer::{DefaultFactory, RingBuffer};
//!
//! let ring: RingBuffer<Option<u32>> = RingBuffer::new(4, DefaultFactory);
//! let w = ring.acquire_write_slot();
//! *ring.get(w) = Some(7);
//! ring.publish_write(w);
//!
//! let r = ring.acquire_read_slot();
//! let value = ring.get(r).take();
//! ring.publish_read(r);
//! assert_eq!(value, Some(7));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Ownership state of one slot
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotStatus {
    Writable = 0,
    Writing = 1,
    Readable = 2,
    Reading = 3,
}

impl SlotStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotStatus::Writable,
            1 => SlotStatus::Writing,
            2 => SlotStatus::Readable,
            _ => SlotStatus::Reading,
        }
    }
}

/// Builds slot payloads once and resets them in place on recycle.
pub trait SlotFactory<T>: Send + Sync {
    fn create(&self) -> T;
    fn reset(&self, item: &mut T);
}

/// Factory for payloads whose reset state is `T::default()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory;

impl<T: Default> SlotFactory<T> for DefaultFactory {
    fn create(&self) -> T {
        T::default()
    }

    fn reset(&self, item: &mut T) {
        *item = T::default();
    }
}

struct Slot<T> {
    status: AtomicU8,
    payload: Mutex<T>,
}

struct Cursors {
    write_index: usize,
    read_index: usize,
}

pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    cursors: Mutex<Cursors>,
    not_full: Condvar,
    not_empty: Condvar,
    /// A producer is (about to be) parked on `not_full`
    pending_full_signal: AtomicBool,
    /// A consumer is (about to be) parked on `not_empty`
    pending_empty_signal: AtomicBool,
    factory: Box<dyn SlotFactory<T>>,
}

impl<T> RingBuffer<T> {
    /// Creates a ring of `capacity` slots, constructing every payload up front.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: SlotFactory<T> + 'static,
    {
        assert!(capacity >= 1, "ring buffer capacity must be at least 1");
        let slots = (0..capacity)
            .map(|_| Slot {
                status: AtomicU8::new(SlotStatus::Writable as u8),
                payload: Mutex::new(factory.create()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            cursors: Mutex::new(Cursors { write_index: 0, read_index: 0 }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            pending_full_signal: AtomicBool::new(false),
            pending_empty_signal: AtomicBool::new(false),
            factory: Box::new(factory),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Current status of slot `index`. Racy by nature; meant for diagnostics.
    pub fn status(&self, index: usize) -> SlotStatus {
        SlotStatus::from_u8(self.slots[index].status.load(Ordering::SeqCst))
    }

    /// Blocks until the slot under the write cursor is writable, claims it and
    /// returns its index.
    pub fn acquire_write_slot(&self) -> usize {
        let mut cursors = self.lock_cursors();
        loop {
            // announce before checking so a concurrent publish_read sees us
            self.pending_full_signal.store(true, Ordering::SeqCst);
            if let Some(index) = self.claim_write(&mut cursors) {
                return index;
            }
            cursors = self
                .not_full
                .wait(cursors)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Claims the slot under the write cursor if it is writable.
    pub fn try_acquire_write_slot(&self) -> Option<usize> {
        let mut cursors = self.lock_cursors();
        self.claim_write(&mut cursors)
    }

    /// Hands a filled slot to consumers.
    ///
    /// # Panics
    ///
    /// Panics if slot `index` is not in `Writing`.
    pub fn publish_write(&self, index: usize) {
        self.transition(index, SlotStatus::Writing, SlotStatus::Readable, "publish_write");
        self.signal(&self.pending_empty_signal, &self.not_empty);
    }

    /// Blocks until the slot under the read cursor is readable, claims it and
    /// returns its index.
    pub fn acquire_read_slot(&self) -> usize {
        let mut cursors = self.lock_cursors();
        loop {
            self.pending_empty_signal.store(true, Ordering::SeqCst);
            if let Some(index) = self.claim_read(&mut cursors) {
                return index;
            }
            cursors = self
                .not_empty
                .wait(cursors)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Claims the slot under the read cursor if it is readable.
    pub fn try_acquire_read_slot(&self) -> Option<usize> {
        let mut cursors = self.lock_cursors();
        self.claim_read(&mut cursors)
    }

    /// Resets the payload of a consumed slot and returns it to producers.
    ///
    /// # Panics
    ///
    /// Panics if slot `index` is not in `Reading`.
    pub fn publish_read(&self, index: usize) {
        let status = self.status(index);
        if status != SlotStatus::Reading {
            panic!("publish_read on slot {index} in state {status:?}");
        }
        {
            let mut payload = self.slots[index]
                .payload
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.factory.reset(&mut payload);
        }
        self.transition(index, SlotStatus::Reading, SlotStatus::Writable, "publish_read");
        self.signal(&self.pending_full_signal, &self.not_full);
    }

    /// Payload of a slot currently held in `Writing` or `Reading`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not acquired.
    pub fn get(&self, index: usize) -> MutexGuard<'_, T> {
        let status = self.status(index);
        if !matches!(status, SlotStatus::Writing | SlotStatus::Reading) {
            panic!("slot {index} accessed in state {status:?}");
        }
        self.slots[index]
            .payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// True when no published slot is waiting under the read cursor.
    pub fn is_empty(&self) -> bool {
        let cursors = self.lock_cursors();
        self.status(cursors.read_index) != SlotStatus::Readable
    }

    fn claim_write(&self, cursors: &mut Cursors) -> Option<usize> {
        let index = cursors.write_index;
        if self.try_transition(index, SlotStatus::Writable, SlotStatus::Writing) {
            cursors.write_index = (index + 1) % self.slots.len();
            Some(index)
        } else {
            None
        }
    }

    fn claim_read(&self, cursors: &mut Cursors) -> Option<usize> {
        let index = cursors.read_index;
        if self.try_transition(index, SlotStatus::Readable, SlotStatus::Reading) {
            cursors.read_index = (index + 1) % self.slots.len();
            Some(index)
        } else {
            None
        }
    }

    fn try_transition(&self, index: usize, from: SlotStatus, to: SlotStatus) -> bool {
        self.slots[index]
            .status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn transition(&self, index: usize, from: SlotStatus, to: SlotStatus, op: &str) {
        if let Err(actual) = self.slots[index].status.compare_exchange(
            from as u8,
            to as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            panic!(
                "{op} on slot {index} in state {:?}, expected {from:?}",
                SlotStatus::from_u8(actual)
            );
        }
    }

    /// Wakes the waiters behind `pending` if any announced themselves.
    ///
    /// Taking the cursor lock once orders this wake after a waiter's re-check:
    /// the waiter holds the lock from the check until `wait` releases it.
    fn signal(&self, pending: &AtomicBool, condvar: &Condvar) {
        if pending.swap(false, Ordering::SeqCst) {
            drop(self.lock_cursors());
            condvar.notify_all();
        }
    }

    fn lock_cursors(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursors = self.lock_cursors();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.slots.len())
            .field("write_index", &cursors.write_index)
            .field("read_index", &cursors.read_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn push(ring: &RingBuffer<Option<u32>>, v: u32) -> usize {
        let idx = ring.acquire_write_slot();
        *ring.get(idx) = Some(v);
        ring.publish_write(idx);
        idx
    }

    fn pop(ring: &RingBuffer<Option<u32>>) -> u32 {
        let idx = ring.acquire_read_slot();
        let v = ring.get(idx).take().expect("published slot carries a value");
        ring.publish_read(idx);
        v
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn test_zero_capacity_is_fatal() {
        let _ring: RingBuffer<Option<u32>> = RingBuffer::new(0, DefaultFactory);
    }

    #[test]
    fn test_round_trip() {
        let ring = RingBuffer::new(2, DefaultFactory);
        push(&ring, 42);
        assert_eq!(pop(&ring), 42);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_full_ring_rejects_then_reuses_first_position() {
        let ring = RingBuffer::new(4, DefaultFactory);
        let positions: Vec<usize> = [1, 2, 3, 4].iter().map(|v| push(&ring, *v)).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
        assert_eq!(ring.try_acquire_write_slot(), None);

        assert_eq!(pop(&ring), 1);
        let idx = ring.try_acquire_write_slot().expect("slot freed by read");
        assert_eq!(idx, positions[0]);
        assert_eq!(ring.status(idx), SlotStatus::Writing);
    }

    #[test]
    fn test_publish_write_without_acquire_always_panics() {
        let ring: RingBuffer<Option<u32>> = RingBuffer::new(2, DefaultFactory);
        for _ in 0..3 {
            let r = catch_unwind(AssertUnwindSafe(|| ring.publish_write(0)));
            assert!(r.is_err());
            assert_eq!(ring.status(0), SlotStatus::Writable);
        }

        // a readable slot cannot be published again either
        push(&ring, 1);
        let r = catch_unwind(AssertUnwindSafe(|| ring.publish_write(0)));
        assert!(r.is_err());
        assert_eq!(ring.status(0), SlotStatus::Readable);
    }

    #[test]
    #[should_panic(expected = "publish_read")]
    fn test_publish_read_requires_reading() {
        let ring: RingBuffer<Option<u32>> = RingBuffer::new(2, DefaultFactory);
        push(&ring, 1);
        ring.publish_read(0);
    }

    #[test]
    #[should_panic(expected = "accessed in state")]
    fn test_get_requires_acquired_slot() {
        let ring: RingBuffer<Option<u32>> = RingBuffer::new(2, DefaultFactory);
        drop(ring.get(1));
    }

    #[test]
    fn test_reset_runs_on_recycle() {
        struct Counting(Arc<AtomicUsize>);
        impl SlotFactory<Vec<u8>> for Counting {
            fn create(&self) -> Vec<u8> {
                Vec::with_capacity(16)
            }
            fn reset(&self, item: &mut Vec<u8>) {
                self.0.fetch_add(1, Ordering::SeqCst);
                item.clear();
            }
        }

        let resets = Arc::new(AtomicUsize::new(0));
        let ring = RingBuffer::new(1, Counting(resets.clone()));
        let w = ring.acquire_write_slot();
        ring.get(w).extend_from_slice(b"abc");
        ring.publish_write(w);

        let r = ring.acquire_read_slot();
        assert_eq!(&ring.get(r)[..], b"abc");
        ring.publish_read(r);
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        let w = ring.acquire_write_slot();
        let slot = ring.get(w);
        assert!(slot.is_empty());
        assert!(slot.capacity() >= 16);
    }

    #[test]
    fn test_fifo_under_contention_with_bounded_in_flight() {
        const N: u32 = 10_000;
        let ring = Arc::new(RingBuffer::new(4, DefaultFactory));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let producer = {
            let ring = ring.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            thread::spawn(move || {
                for v in 0..N {
                    let idx = ring.acquire_write_slot();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    *ring.get(idx) = Some(v);
                    ring.publish_write(idx);
                }
            })
        };

        for expected in 0..N {
            let idx = ring.acquire_read_slot();
            let v = ring.get(idx).take();
            in_flight.fetch_sub(1, Ordering::SeqCst);
            ring.publish_read(idx);
            assert_eq!(v, Some(expected));
        }
        producer.join().unwrap();
        assert!(max_in_flight.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn test_many_producers_many_consumers_lose_nothing() {
        let ring = Arc::new(RingBuffer::new(8, DefaultFactory));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        push(&ring, p * 1000 + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let ring = ring.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match pop(&ring) {
                            u32::MAX => break seen,
                            v => seen.push(v),
                        }
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for _ in 0..3 {
            push(&ring, u32::MAX);
        }

        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let mut expected: Vec<u32> = (0..4u32)
            .flat_map(|p| (0..500).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
    }
}
