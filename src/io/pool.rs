//! Pool of fixed-size byte buffers reused across requests.
//!
//! A buffer is either checked out (owned by exactly one [`PooledBuffer`]) or
//! sitting in the pool's free list, never both. The only way to return a buffer
//! is to drop its `PooledBuffer`, so release happens exactly once on every exit
//! path, including errors and cancelled futures.
//!
//! # Examples
//!
//! ```
//! use cio_http::io::BufferPool;
//!
//! let pool = BufferPool::new(1024, 4);
//! {
//!     let mut buffer = pool.checkout();
//!     buffer[..5].copy_from_slice(b"hello");
//!     assert_eq!(pool.available(), 0);
//! }
//! assert_eq!(pool.available(), 1);
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

struct PoolInner {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

/// Shared pool of fixed-size buffers.
///
/// Cloning the pool is cheap and yields a handle to the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes and retaining at
    /// most `capacity` idle buffers.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                buffer_size: buffer_size.max(1),
                capacity,
                free: Mutex::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    /// Borrow a buffer, allocating a new one when the free list is empty.
    pub fn checkout(&self) -> PooledBuffer {
        let buffer = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Size of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of idle buffers currently held by the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(4096, 128)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuffer {
    buffer: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.capacity {
                free.push(buffer);
            }
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_release() {
        let pool = BufferPool::new(64, 2);
        assert_eq!(pool.available(), 0);

        let a = pool.checkout();
        let b = pool.checkout();
        assert_eq!(a.len(), 64);
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 2);

        let _c = pool.checkout();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_capacity_bounds_free_list() {
        let pool = BufferPool::new(16, 1);
        let buffers: Vec<_> = (0..4).map(|_| pool.checkout()).collect();
        drop(buffers);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_on_panic_unwind() {
        let pool = BufferPool::new(16, 4);
        let cloned = pool.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _buffer = cloned.checkout();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_release_on_cancelled_future() {
        let pool = BufferPool::new(16, 4);
        let task_pool = pool.clone();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            let _buffer = task_pool.checkout();
            let _ = ready_tx.send(());
            std::future::pending::<()>().await;
        });
        ready_rx.await.unwrap();
        handle.abort();
        let _ = handle.await;
        assert_eq!(pool.available(), 1);
    }
}
