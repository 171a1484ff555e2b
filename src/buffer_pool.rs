//! Pooled byte buffers for network I/O
//!
//! The pool keeps fixed-size byte regions around so the hot receive/send paths
//! never hit the allocator. A region is handed out as a [`PooledBuffer`], which
//! owns it until it is released: either explicitly through
//! [`PooledBuffer::release`] or by being dropped. Because release consumes the
//! buffer, a released region can never be touched again.
//!
//! A `PooledBuffer` also carries read/write cursors, in the manner of a
//! classic NIO byte buffer: bytes are appended at the write cursor
//! ([`writable`](PooledBuffer::writable) + [`fill`](PooledBuffer::fill)) and
//! consumed from the read cursor ([`readable`](PooledBuffer::readable) +
//! [`consume`](PooledBuffer::consume)).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A thread-safe pool of equally sized byte regions
///
/// # Examples
///
/// ```rust
/// use horizon_aio::buffer_pool::BufferPool;
///
/// let pool = BufferPool::new(64, 2048); // 64 regions of 2KB each
/// let mut buffer = pool.allocate(1500);
///
/// buffer.writable()[..5].copy_from_slice(b"hello");
/// buffer.fill(5);
/// assert_eq!(buffer.readable(), b"hello");
///
/// buffer.release();
/// assert_eq!(pool.available_count(), 64);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Idle regions, each exactly `region_size` bytes long
    regions: Mutex<VecDeque<Vec<u8>>>,
    region_size: usize,
    /// Maximum number of idle regions kept
    max_regions: usize,
}

impl BufferPool {
    /// Creates a pool with `initial_count` pre-allocated regions of
    /// `region_size` bytes. The pool keeps at most twice that many idle
    /// regions; extra ones are freed on release.
    pub fn new(initial_count: usize, region_size: usize) -> Self {
        let mut regions = VecDeque::with_capacity(initial_count * 2);
        for _ in 0..initial_count {
            regions.push_back(vec![0u8; region_size]);
        }
        Self {
            inner: Arc::new(PoolInner {
                regions: Mutex::new(regions),
                region_size,
                max_regions: (initial_count * 2).max(1),
            }),
        }
    }

    /// Allocates a buffer with room for `size` bytes.
    ///
    /// Requests up to the pool's region size are served from the idle list
    /// (or a fresh region when it is empty). Larger requests get a dedicated
    /// allocation that is simply freed on release.
    pub fn allocate(&self, size: usize) -> PooledBuffer {
        if size > self.inner.region_size {
            return PooledBuffer {
                data: vec![0u8; size],
                limit: size,
                start: 0,
                end: 0,
                pool: None,
            };
        }
        let region = self
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![0u8; self.inner.region_size]);
        PooledBuffer {
            data: region,
            limit: size,
            start: 0,
            end: 0,
            pool: Some(self.inner.clone()),
        }
    }

    /// Number of idle regions currently held.
    pub fn available_count(&self) -> usize {
        self.lock().len()
    }

    /// Size of the regions this pool recycles.
    pub fn region_size(&self) -> usize {
        self.inner.region_size
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inner.lock()
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recycle(&self, region: Vec<u8>) {
        if region.len() != self.region_size {
            return;
        }
        let mut regions = self.lock();
        if regions.len() < self.max_regions {
            regions.push_back(region);
        }
    }
}

impl Default for BufferPool {
    /// 64 regions of 2048 bytes (one MTU-sized datagram each).
    fn default() -> Self {
        Self::new(64, 2048)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("region_size", &self.inner.region_size)
            .field("available", &self.available_count())
            .finish()
    }
}

/// An owned region borrowed from a [`BufferPool`]
pub struct PooledBuffer {
    data: Vec<u8>,
    /// Usable bytes of `data`; the requested size
    limit: usize,
    start: usize,
    end: usize,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// The whole usable region, regardless of cursors.
    pub fn raw(&self) -> &[u8] {
        &self.data[..self.limit]
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.limit]
    }

    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Bytes written but not yet consumed.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Free space after the write cursor.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.end..self.limit]
    }

    pub fn remaining_mut(&self) -> usize {
        self.limit - self.end
    }

    pub fn is_full(&self) -> bool {
        self.end == self.limit
    }

    /// Marks `n` bytes after the write cursor as written.
    pub fn fill(&mut self, n: usize) {
        assert!(n <= self.remaining_mut(), "fill past end of buffer");
        self.end += n;
    }

    /// Marks `n` readable bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past write cursor");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Moves unread bytes to the front of the region.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Appends as much of `src` as fits; returns the number of bytes copied.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining_mut());
        self.data[self.end..self.end + n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }

    /// Replaces the region with one of `new_capacity` bytes, keeping unread
    /// bytes at the front. The old region goes back to its pool.
    ///
    /// # Panics
    ///
    /// Panics if the unread bytes do not fit in `new_capacity`.
    pub fn resize(&mut self, new_capacity: usize) {
        assert!(self.len() <= new_capacity, "resize would drop unread bytes");
        let mut next = match &self.pool {
            Some(inner) => BufferPool { inner: inner.clone() }.allocate(new_capacity),
            None => BufferPool::new(0, 0).allocate(new_capacity),
        };
        next.put(self.readable());
        std::mem::swap(self, &mut next);
    }

    /// Returns the region to its pool.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.limit)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_buffer_pool_basic_operations() {
        let pool = BufferPool::new(4, 1024);
        assert_eq!(pool.available_count(), 4);

        let buffer = pool.allocate(512);
        assert_eq!(buffer.capacity(), 512);
        assert_eq!(pool.available_count(), 3);

        buffer.release();
        assert_eq!(pool.available_count(), 4);
    }

    #[test]
    fn test_drop_releases() {
        let pool = BufferPool::new(2, 256);
        {
            let _a = pool.allocate(256);
            let _b = pool.allocate(256);
            assert_eq!(pool.available_count(), 0);
        }
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_buffer_pool_overflow_allocation() {
        let pool = BufferPool::new(2, 256);

        let buffers: Vec<_> = (0..5).map(|_| pool.allocate(256)).collect();
        assert_eq!(pool.available_count(), 0);
        for buffer in &buffers {
            assert_eq!(buffer.capacity(), 256);
        }
        drop(buffers);
        // idle list is capped at twice the initial count
        assert_eq!(pool.available_count(), 4);
    }

    #[test]
    fn test_oversized_request_bypasses_pool() {
        let pool = BufferPool::new(1, 64);
        let big = pool.allocate(4096);
        assert_eq!(big.capacity(), 4096);
        assert_eq!(pool.available_count(), 1);
        big.release();
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn test_cursors_and_compact() {
        let pool = BufferPool::new(1, 16);
        let mut buf = pool.allocate(8);
        assert_eq!(buf.put(b"abcdefghij"), 8);
        assert!(buf.is_full());

        buf.consume(3);
        assert_eq!(buf.readable(), b"defgh");
        buf.compact();
        assert_eq!(buf.readable(), b"defgh");
        assert_eq!(buf.remaining_mut(), 3);

        buf.consume(5);
        assert!(buf.is_empty());
        assert_eq!(buf.remaining_mut(), 8);
    }

    #[test]
    fn test_resize_preserves_unread_bytes() {
        let pool = BufferPool::new(1, 16);
        let mut buf = pool.allocate(4);
        buf.put(b"wxyz");
        buf.consume(1);
        buf.resize(32);
        assert_eq!(buf.capacity(), 32);
        assert_eq!(buf.readable(), b"xyz");
        // the 4 byte view went back to the pool
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn test_concurrent_allocation() {
        let pool = BufferPool::new(8, 128);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut b = pool.allocate(128);
                        b.put(&[1, 2, 3]);
                        b.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.available_count() <= 16);
        assert!(pool.available_count() >= 4);
    }
}
