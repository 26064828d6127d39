use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::BytesMut;

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_MAX_POOLED: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    /// Capacity of every buffer handed out.
    pub buffer_size: usize,
    /// Idle buffers kept around; extras are freed on release.
    pub max_pooled: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pooled: DEFAULT_MAX_POOLED,
        }
    }
}

/// Shared pool of fixed-size relay buffers.
///
/// `acquire` hands out a [`PooledBuffer`] that goes back to the pool when it
/// is dropped, so every exit path of a copy loop releases exactly once.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    buffers: Mutex<VecDeque<BytesMut>>,
    config: BufferPoolConfig,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        let config = BufferPoolConfig {
            buffer_size: config.buffer_size.max(1),
            max_pooled: config.max_pooled,
        };
        Self {
            inner: Arc::new(Inner {
                buffers: Mutex::new(VecDeque::with_capacity(config.max_pooled.min(64))),
                config,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn acquire(&self) -> PooledBuffer {
        let size = self.inner.config.buffer_size;
        let reused = {
            let mut buffers = self.inner.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers.pop_front()
        };
        let buf = reused.unwrap_or_else(|| BytesMut::with_capacity(size));
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    fn put_back(&self, mut buf: BytesMut) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);

        buf.clear();
        // A buffer that was split or reallocated no longer has the pooled shape.
        if buf.capacity() < self.inner.config.buffer_size
            || buf.capacity() > self.inner.config.buffer_size * 2
        {
            return;
        }

        let mut buffers = self.inner.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < self.inner.config.max_pooled {
            buffers.push_back(buf);
        }
    }

    /// Idle buffers currently held by the pool.
    pub fn available(&self) -> usize {
        self.inner
            .buffers
            .lock()
            .map(|b| b.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    /// Leases not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put_back(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused() {
        let pool = BufferPool::default();

        let mut buf = pool.acquire();
        assert_eq!(buf.capacity(), DEFAULT_BUFFER_SIZE);
        buf.extend_from_slice(b"payload");
        assert_eq!(pool.outstanding(), 1);

        drop(buf);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);

        let again = pool.acquire();
        assert!(again.is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn drop_releases_exactly_once() {
        let pool = BufferPool::new(BufferPoolConfig {
            buffer_size: 1024,
            max_pooled: 8,
        });
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(pool.outstanding(), 2);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn pool_caps_idle_buffers() {
        let pool = BufferPool::new(BufferPoolConfig {
            buffer_size: 64,
            max_pooled: 1,
        });
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn split_buffers_are_not_pooled() {
        let pool = BufferPool::new(BufferPoolConfig {
            buffer_size: 64,
            max_pooled: 4,
        });
        let mut buf = pool.acquire();
        buf.extend_from_slice(&[7u8; 40]);
        let _head = buf.split_to(40);
        drop(buf);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 0);
    }
}
