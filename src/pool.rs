//! # Pool
//!
//! Reusable byte buffers and the source of non-cryptographic randomness used for mask keys,
//! handshake nonces and backoff jitter.
//!
//! Both are explicit values: a [`Resources`] bundle is created once and handed to every
//! connection that should share it. Tests substitute a [`SequenceRandom`] to make mask keys
//! and jitter reproducible.
//!
//! ```rust
//! use wsengine::pool::{BufferPool, Resources, SequenceRandom};
//! use std::sync::Arc;
//!
//! let resources = Resources::new(
//!     BufferPool::new(),
//!     Arc::new(SequenceRandom::new(vec![1, 2, 3, 4], vec![0.5])),
//! );
//! assert_eq!(resources.mask_key(), [1, 2, 3, 4]);
//! ```
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use bytes::BytesMut;
use rand::{Rng, RngCore};

/// Default number of idle buffers a pool keeps around.
const DEFAULT_MAX_POOLED: usize = 64;

/// A pool of reusable [`BytesMut`] buffers.
///
/// Cloning a `BufferPool` is cheap and yields a handle to the same free list. Buffers are
/// rented through [`BufferPool::rent`] and go back to the free list when the returned
/// [`PooledBuf`] is dropped, whichever way the borrowing code exits.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("max_pooled", &self.inner.max_pooled)
            .finish()
    }
}

impl BufferPool {
    /// Creates an empty pool that keeps at most 64 idle buffers.
    pub fn new() -> Self {
        Self::with_max_pooled(DEFAULT_MAX_POOLED)
    }

    /// Creates an empty pool that keeps at most `max_pooled` idle buffers.
    /// Buffers returned while the free list is full are simply deallocated.
    pub fn with_max_pooled(max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                max_pooled,
            }),
        }
    }

    /// Rents an empty buffer with at least `min_capacity` bytes of capacity.
    pub fn rent(&self, min_capacity: usize) -> PooledBuf {
        self.rent_inner(min_capacity, false)
    }

    /// Rents an empty buffer whose contents are zeroed before it goes back to the pool.
    ///
    /// Use it for anything that holds message content or key material.
    pub fn rent_sensitive(&self, min_capacity: usize) -> PooledBuf {
        self.rent_inner(min_capacity, true)
    }

    /// Number of idle buffers currently held by the pool.
    pub fn available(&self) -> usize {
        self.free_list().len()
    }

    fn rent_inner(&self, min_capacity: usize, sensitive: bool) -> PooledBuf {
        let mut buf = self.free_list().pop().unwrap_or_default();
        if buf.capacity() < min_capacity {
            buf.reserve(min_capacity);
        }

        PooledBuf {
            buf,
            sensitive,
            pool: Arc::clone(&self.inner),
        }
    }

    fn free_list(&self) -> std::sync::MutexGuard<'_, Vec<BytesMut>> {
        self.inner.free.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// A buffer rented from a [`BufferPool`].
///
/// Dereferences to [`BytesMut`]. On drop the buffer is cleared (zeroed first when rented with
/// [`BufferPool::rent_sensitive`]) and returned to its pool.
pub struct PooledBuf {
    buf: BytesMut,
    sensitive: bool,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        if self.sensitive {
            buf.fill(0);
        }
        buf.clear();

        // a buffer that was split down to nothing is not worth keeping
        if buf.capacity() == 0 {
            return;
        }

        let mut free = self.pool.free.lock().unwrap_or_else(|err| err.into_inner());
        if free.len() < self.pool.max_pooled {
            free.push(buf);
        }
    }
}

/// Source of non-cryptographic random values.
///
/// Mask keys only need to be unpredictable to intermediaries, not secret, so the default
/// [`ThreadRandom`] is backed by the thread-local generator of the `rand` crate.
pub trait RandomSource: Send + Sync {
    /// Fills `dst` with random bytes.
    fn fill_bytes(&self, dst: &mut [u8]);

    /// Returns a uniformly distributed value in `[0, 1)`.
    fn next_f64(&self) -> f64;
}

/// [`RandomSource`] backed by `rand::thread_rng`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn fill_bytes(&self, dst: &mut [u8]) {
        rand::thread_rng().fill_bytes(dst);
    }

    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Deterministic [`RandomSource`] replaying fixed sequences.
///
/// Bytes and floats are served from their own sequence, each wrapping around when exhausted.
/// An empty byte sequence yields zeros and an empty float sequence yields `0.5`.
#[derive(Debug)]
pub struct SequenceRandom {
    bytes: Vec<u8>,
    floats: Vec<f64>,
    byte_pos: AtomicUsize,
    float_pos: AtomicUsize,
}

impl SequenceRandom {
    /// Creates a source replaying `bytes` and `floats`.
    ///
    /// Floats are clamped into `[0, 1)`.
    pub fn new(bytes: Vec<u8>, floats: Vec<f64>) -> Self {
        let floats = floats
            .into_iter()
            .map(|f| f.clamp(0.0, 1.0 - f64::EPSILON))
            .collect();
        Self {
            bytes,
            floats,
            byte_pos: AtomicUsize::new(0),
            float_pos: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn fill_bytes(&self, dst: &mut [u8]) {
        if self.bytes.is_empty() {
            dst.fill(0);
            return;
        }

        let start = self.byte_pos.fetch_add(dst.len(), Ordering::Relaxed);
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.bytes[(start + i) % self.bytes.len()];
        }
    }

    fn next_f64(&self) -> f64 {
        if self.floats.is_empty() {
            return 0.5;
        }

        let pos = self.float_pos.fetch_add(1, Ordering::Relaxed);
        self.floats[pos % self.floats.len()]
    }
}

/// The buffer pool and random source shared by the components of one or more connections.
#[derive(Clone)]
pub struct Resources {
    /// Pool for mask keys, nonces and compression scratch buffers.
    pub pool: BufferPool,
    /// Source of mask keys, nonces and jitter.
    pub random: Arc<dyn RandomSource>,
}

impl Default for Resources {
    fn default() -> Self {
        Self::new(BufferPool::new(), Arc::new(ThreadRandom))
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Resources {
    /// Bundles a pool and a random source.
    pub fn new(pool: BufferPool, random: Arc<dyn RandomSource>) -> Self {
        Self { pool, random }
    }

    /// Generates a fresh 4-byte masking key.
    pub fn mask_key(&self) -> [u8; 4] {
        let mut buf = self.pool.rent_sensitive(4);
        buf.resize(4, 0);
        self.random.fill_bytes(&mut buf[..]);

        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[..4]);
        key
    }

    /// Generates the base64 encoded 16-byte nonce a client sends as `Sec-WebSocket-Key`.
    pub fn handshake_key(&self) -> String {
        use base64::prelude::*;

        let mut buf = self.pool.rent_sensitive(16);
        buf.resize(16, 0);
        self.random.fill_bytes(&mut buf[..]);
        BASE64_STANDARD.encode(&buf[..])
    }
}
