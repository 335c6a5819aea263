//! Bucketed payload-buffer pool and a generic object pool.
//!
//! Payload sizes span several orders of magnitude, so a single free list
//! would pin large blocks behind small requests. Four fixed buckets cover
//! the common range; anything above the largest bucket is allocated
//! directly and never retained, which keeps the long-lived working set
//! bounded.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Bucket capacities, smallest first.
pub const BUCKET_SIZES: [usize; 4] = [512, 4096, 16 * 1024, 64 * 1024];

/// Upper bound on retained buffers per bucket.
const MAX_PER_BUCKET: usize = 256;

/// Selects the bucket for an allocation of `n` bytes, `None` for
/// pass-through sizes.
fn bucket_for_len(n: usize) -> Option<usize> {
    BUCKET_SIZES.iter().position(|&size| n <= size)
}

/// Selects the bucket a buffer belongs to on release, keyed by capacity.
fn bucket_for_capacity(cap: usize) -> Option<usize> {
    BUCKET_SIZES.iter().position(|&size| cap <= size)
}

/// A bucketed pool of byte buffers.
///
/// `acquire(n)` hands out a buffer sliced to length `n` whose capacity is
/// the smallest bucket that fits; dropping the returned [`PooledBuf`] puts
/// the storage back into the bucket its capacity selects. Requests larger
/// than the largest bucket bypass the pool entirely.
pub struct BufferPool {
    buckets: [Mutex<Vec<BytesMut>>; 4],
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buckets: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    /// Returns a zeroed buffer of length `n`.
    pub fn acquire(&'static self, n: usize) -> PooledBuf {
        match bucket_for_len(n) {
            Some(idx) => {
                let mut storage = self.buckets[idx]
                    .lock()
                    .pop()
                    .unwrap_or_else(|| BytesMut::with_capacity(BUCKET_SIZES[idx]));
                storage.clear();
                storage.resize(n, 0);
                PooledBuf {
                    buf: storage,
                    pool: Some(self),
                }
            }
            None => {
                let mut storage = BytesMut::with_capacity(n);
                storage.resize(n, 0);
                PooledBuf {
                    buf: storage,
                    pool: None,
                }
            }
        }
    }

    fn release(&self, buf: BytesMut) {
        if let Some(idx) = bucket_for_capacity(buf.capacity()) {
            let mut bucket = self.buckets[idx].lock();
            if bucket.len() < MAX_PER_BUCKET {
                bucket.push(buf);
            }
        }
        // Pass-through buffers are simply dropped.
    }

    /// Number of retained buffers in the bucket serving `n`-byte requests.
    pub fn bucket_len(&self, n: usize) -> usize {
        match bucket_for_len(n) {
            Some(idx) => self.buckets[idx].lock().len(),
            None => 0,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_POOL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// The process-wide buffer pool shared by HTTP body handling and
/// WebSocket payload assembly.
pub fn global_pool() -> &'static BufferPool {
    &GLOBAL_POOL
}

/// RAII handle to a pool-backed buffer.
///
/// The buffer is exclusively owned by the holder; dropping it transfers
/// ownership back to the pool. Contents are not referenced after release.
pub struct PooledBuf {
    buf: BytesMut,
    pool: Option<&'static BufferPool>,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Grows the logical length up to the existing capacity, zero-filling.
    ///
    /// Callers that need more room than the capacity allows must acquire a
    /// larger buffer and copy; growing in place would move the storage out
    /// of its bucket.
    pub fn resize_within_capacity(&mut self, len: usize) {
        debug_assert!(len <= self.buf.capacity());
        self.buf.resize(len, 0);
    }

    /// Appends bytes. The caller is responsible for having checked
    /// `capacity()`; appending past it would migrate the buffer to a
    /// larger bucket on release.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        debug_assert!(self.buf.len() + data.len() <= self.buf.capacity());
        self.buf.extend_from_slice(data);
    }

    pub fn copy_from_slice_at(&mut self, offset: usize, data: &[u8]) {
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Whether this buffer came from a bucket (as opposed to a direct
    /// pass-through allocation).
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// Reset-for-reuse hook for [`Pool`].
pub trait Reuse {
    /// Clears state for the next user. Returning `false` rejects the
    /// object from the pool (e.g. it never allocated anything worth
    /// keeping).
    fn reuse(&mut self) -> bool;
}

impl Reuse for BytesMut {
    fn reuse(&mut self) -> bool {
        self.clear();
        self.capacity() > 0
    }
}

/// A bounded free list of reusable objects.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    max: usize,
}

impl<T: Reuse> Pool<T> {
    pub fn new(max: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max,
        }
    }

    /// Pops a pooled object, or builds a fresh one.
    pub fn get_or(&self, make: impl FnOnce() -> T) -> T {
        self.items.lock().pop().unwrap_or_else(make)
    }

    /// Returns an object to the pool if it resets cleanly and there is
    /// room.
    pub fn put(&self, mut item: T) {
        if !item.reuse() {
            return;
        }
        let mut items = self.items.lock();
        if items.len() < self.max {
            items.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_selects_smallest_fitting_bucket() {
        let pool = global_pool();

        let buf = pool.acquire(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.capacity() <= BUCKET_SIZES[0]);

        let buf = pool.acquire(513);
        assert_eq!(buf.len(), 513);
        assert!(buf.capacity() > BUCKET_SIZES[0]);
        assert!(buf.capacity() <= BUCKET_SIZES[1]);

        let buf = pool.acquire(64 * 1024);
        assert_eq!(buf.len(), 64 * 1024);
        assert!(buf.capacity() <= BUCKET_SIZES[3]);
    }

    #[test]
    fn oversized_acquire_bypasses_pool() {
        let pool = global_pool();
        let buf = pool.acquire(65537);
        assert_eq!(buf.len(), 65537);
        assert!(!buf.is_pooled());
    }

    #[test]
    fn release_returns_to_bucket_on_drop() {
        let pool = global_pool();
        let before = pool.bucket_len(16 * 1024 - 1);
        {
            let _buf = pool.acquire(16 * 1024 - 1);
        }
        assert!(pool.bucket_len(16 * 1024 - 1) > before);
    }

    #[test]
    fn acquired_buffer_is_zeroed() {
        let pool = global_pool();
        {
            let mut buf = pool.acquire(64);
            buf.as_mut_slice().fill(0xAA);
        }
        let buf = pool.acquire(64);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn object_pool_respects_capacity() {
        let pool: Pool<BytesMut> = Pool::new(2);
        for _ in 0..5 {
            pool.put(BytesMut::with_capacity(128));
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn object_pool_rejects_unreusable() {
        let pool: Pool<BytesMut> = Pool::new(4);
        pool.put(BytesMut::new()); // zero capacity, nothing worth keeping
        assert!(pool.is_empty());
    }

    #[test]
    fn object_pool_reuses_storage() {
        let pool: Pool<BytesMut> = Pool::new(4);
        let mut buf = BytesMut::with_capacity(256);
        buf.extend_from_slice(b"stale");
        pool.put(buf);

        let buf = pool.get_or(|| BytesMut::new());
        assert!(buf.is_empty(), "pooled buffer must come back cleared");
        assert!(buf.capacity() >= 256);
    }
}
