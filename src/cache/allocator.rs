//! Write Buffer Allocator
//!
//! Bounded pool of fixed-size write buffers. Cache files borrow buffers
//! while they fill them, the writer holds them while they are flushed, and a
//! buffer goes back to the pool when its handle is dropped.
//!
//! # Design
//!
//! - Buffers are created lazily and recycled, never freed while the pool lives
//! - The pool never holds more than `max_buffers` buffers at once
//! - Exhaustion is reported as `None`, which callers treat as backpressure

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

struct PoolState {
    /// Recycled buffers ready for reuse
    free: Vec<BytesMut>,
    /// Buffers currently borrowed
    outstanding: usize,
    /// Buffers created so far
    created: usize,
}

struct PoolInner {
    buffer_size: usize,
    max_buffers: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn release(&self, mut data: BytesMut) {
        data.clear();
        let mut state = self.state.lock();
        state.outstanding -= 1;
        state.free.push(data);
        drop(state);
        self.released.notify_all();
    }
}

/// Bounded pool of write buffers
#[derive(Clone)]
pub struct BufferAllocator {
    inner: Arc<PoolInner>,
}

impl BufferAllocator {
    /// Create a pool of at most `max_buffers` buffers of `buffer_size` bytes
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        debug!(buffer_size, max_buffers, "Initializing write buffer allocator");
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_buffers,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    outstanding: 0,
                    created: 0,
                }),
                released: Condvar::new(),
            }),
        }
    }

    /// Borrow a buffer, or `None` when the pool is exhausted
    pub fn allocate(&self) -> Option<WriteBuffer> {
        let mut state = self.inner.state.lock();
        let data = match state.free.pop() {
            Some(data) => data,
            None if state.created < self.inner.max_buffers => {
                state.created += 1;
                BytesMut::with_capacity(self.inner.buffer_size)
            }
            None => return None,
        };
        state.outstanding += 1;
        drop(state);

        Some(WriteBuffer {
            data,
            capacity: self.inner.buffer_size,
            file_offset: 0,
            pool: self.inner.clone(),
        })
    }

    /// Park until a buffer is available or `timeout` passes.
    ///
    /// Returns true if a buffer can be allocated now.
    pub fn wait_for_release(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if state.outstanding < self.inner.max_buffers {
            return true;
        }
        self.inner.released.wait_for(&mut state, timeout);
        state.outstanding < self.inner.max_buffers
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn max_buffers(&self) -> usize {
        self.inner.max_buffers
    }

    /// Buffers currently borrowed
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }
}

impl fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_buffers", &self.inner.max_buffers)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A borrowed write buffer.
///
/// The buffer maps to the byte range starting at `file_offset` in the file
/// it belongs to. Dropping it returns the memory to its pool.
pub struct WriteBuffer {
    data: BytesMut,
    capacity: usize,
    file_offset: u64,
    pool: Arc<PoolInner>,
}

impl WriteBuffer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes filled so far
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.len()
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Copy as much of `src` as fits and return the number of bytes taken
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data.extend_from_slice(&src[..n]);
        n
    }

    /// Filled bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// File offset of the first byte of this buffer
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn set_file_offset(&mut self, offset: u64) {
        self.file_offset = offset;
    }

    /// File offset one past the last filled byte
    pub fn end_offset(&self) -> u64 {
        self.file_offset + self.len() as u64
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}

impl fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("file_offset", &self.file_offset)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
