//! Pool of reusable fixed-size byte arrays
//!
//! Stream copies happen for every inspected connection, so the arrays backing them are
//! recycled instead of allocated per call. The free list is bounded: once it holds
//! `max_pool_size / array_size` arrays, released arrays are simply dropped.

use bytes::Buf;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use prometheus::{IntCounter, IntGauge, Registry};

/// Default upper bound of bytes kept in the free list (1 MiB)
pub const DEFAULT_MAX_POOL_SIZE: usize = 1024 * 1024;

/// Raised when a buffer operation would cross its valid range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer capacity exceeded: requested {} bytes, {} available",
            self.requested, self.available
        )
    }
}

impl std::error::Error for CapacityError {}

impl From<CapacityError> for io::Error {
    fn from(err: CapacityError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// Metrics for the buffer pool
struct BufferMetrics {
    allocations: IntCounter,
    reuses: IntCounter,
    discards: IntCounter,
    available: IntGauge,
}

impl BufferMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let allocations = IntCounter::new(
            "filterd_buffer_allocations_total",
            "Total buffers allocated because the pool was empty",
        )?;
        let reuses = IntCounter::new(
            "filterd_buffer_reuses_total",
            "Total buffers handed out from the pool",
        )?;
        let discards = IntCounter::new(
            "filterd_buffer_discards_total",
            "Total released buffers dropped because the pool was full",
        )?;
        let available = IntGauge::new(
            "filterd_buffer_pool_available",
            "Current number of buffers waiting in the pool",
        )?;

        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(reuses.clone()))?;
        registry.register(Box::new(discards.clone()))?;
        registry.register(Box::new(available.clone()))?;

        Ok(Self {
            allocations,
            reuses,
            discards,
            available,
        })
    }
}

struct PoolInner {
    array_size: usize,
    max_available: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    metrics: Option<BufferMetrics>,
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, Vec<Box<[u8]>>> {
        // Nothing panics while the lock is held, but a poisoned list is still usable.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, bytes: Box<[u8]>) {
        let mut free = self.free_list();
        if free.len() >= self.max_available {
            drop(free);
            trace!(array_size = self.array_size, "Buffer pool full, discarding array");
            if let Some(ref metrics) = self.metrics {
                metrics.discards.inc();
            }
            return;
        }

        free.push(bytes);
        if let Some(ref metrics) = self.metrics {
            metrics.available.set(free.len() as i64);
        }
    }
}

/// Bounded pool of fixed-size byte arrays
///
/// Cloning is cheap and every clone shares the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool retaining at most [`DEFAULT_MAX_POOL_SIZE`] bytes
    pub fn new(array_size: usize) -> Self {
        Self::with_capacity(array_size, DEFAULT_MAX_POOL_SIZE)
    }

    /// Creates a pool of `array_size` arrays retaining at most `max_pool_size` bytes
    ///
    /// # Panics
    ///
    /// Panics if `array_size` is zero.
    pub fn with_capacity(array_size: usize, max_pool_size: usize) -> Self {
        Self::build(array_size, max_pool_size, None)
    }

    pub fn with_metrics(
        array_size: usize,
        max_pool_size: usize,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        let metrics = BufferMetrics::new(registry)?;
        Ok(Self::build(array_size, max_pool_size, Some(metrics)))
    }

    fn build(array_size: usize, max_pool_size: usize, metrics: Option<BufferMetrics>) -> Self {
        assert!(array_size > 0, "buffer array size must be greater than zero");
        let max_available = max_pool_size / array_size;
        debug!(array_size, max_available, "Created buffer pool");

        Self {
            inner: Arc::new(PoolInner {
                array_size,
                max_available,
                free: Mutex::new(Vec::with_capacity(max_available.min(64))),
                metrics,
            }),
        }
    }

    /// Takes an array from the pool, allocating a new one when the pool is empty
    pub fn acquire(&self) -> PooledBuffer {
        let reused = {
            let mut free = self.inner.free_list();
            let reused = free.pop();
            if reused.is_some()
                && let Some(ref metrics) = self.inner.metrics
            {
                metrics.available.set(free.len() as i64);
            }
            reused
        };

        let bytes = match reused {
            Some(bytes) => {
                if let Some(ref metrics) = self.inner.metrics {
                    metrics.reuses.inc();
                }
                bytes
            }
            None => {
                if let Some(ref metrics) = self.inner.metrics {
                    metrics.allocations.inc();
                }
                vec![0u8; self.inner.array_size].into_boxed_slice()
            }
        };

        PooledBuffer {
            bytes,
            content_length: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Size of arrays handed out by this pool
    pub fn array_size(&self) -> usize {
        self.inner.array_size
    }

    /// Maximum number of arrays the free list retains
    pub fn max_available(&self) -> usize {
        self.inner.max_available
    }

    /// Number of arrays currently waiting in the free list
    pub fn available(&self) -> usize {
        self.inner.free_list().len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("array_size", &self.inner.array_size)
            .field("max_available", &self.inner.max_available)
            .field("available", &self.available())
            .finish()
    }
}

/// A byte array checked out of a [`BufferPool`]
///
/// `content_length` tracks how many leading bytes are valid. The array goes back to the
/// pool when the buffer is released or dropped.
pub struct PooledBuffer {
    bytes: Box<[u8]>,
    content_length: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Fixed size of the underlying array
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn set_content_length(&mut self, content_length: usize) -> Result<(), CapacityError> {
        if content_length > self.capacity() {
            return Err(CapacityError {
                requested: content_length,
                available: self.capacity(),
            });
        }
        self.content_length = content_length;
        Ok(())
    }

    /// Number of bytes that can still be appended
    pub fn bytes_left(&self) -> usize {
        self.capacity() - self.content_length
    }

    pub fn is_empty(&self) -> bool {
        self.content_length == 0
    }

    /// Valid bytes
    pub fn content(&self) -> &[u8] {
        &self.bytes[..self.content_length]
    }

    /// Appends all of `src`
    pub fn put(&mut self, src: &[u8]) -> Result<(), CapacityError> {
        self.put_range(src, 0, src.len())
    }

    /// Appends `count` bytes of `src` starting at `offset`
    pub fn put_range(&mut self, src: &[u8], offset: usize, count: usize) -> Result<(), CapacityError> {
        self.check_room(count)?;
        let end = offset.checked_add(count).filter(|&end| end <= src.len()).ok_or(CapacityError {
            requested: count,
            available: src.len().saturating_sub(offset),
        })?;

        let start = self.content_length;
        self.bytes[start..start + count].copy_from_slice(&src[offset..end]);
        self.content_length += count;
        Ok(())
    }

    /// Moves `count` bytes out of `src` into this buffer
    pub fn put_buf<B: Buf>(&mut self, src: &mut B, count: usize) -> Result<(), CapacityError> {
        self.check_room(count)?;
        if src.remaining() < count {
            return Err(CapacityError {
                requested: count,
                available: src.remaining(),
            });
        }

        let start = self.content_length;
        src.copy_to_slice(&mut self.bytes[start..start + count]);
        self.content_length += count;
        Ok(())
    }

    /// Performs one read into the free space, returning the number of bytes added
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.bytes_left() == 0 {
            return Err(CapacityError {
                requested: 1,
                available: 0,
            }
            .into());
        }

        let start = self.content_length;
        let n = loop {
            match reader.read(&mut self.bytes[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.content_length += n;
        Ok(n)
    }

    /// Copies `count` valid bytes starting at `src_pos` into `dst[offset..]`
    pub fn copy_to(
        &self,
        src_pos: usize,
        dst: &mut [u8],
        offset: usize,
        count: usize,
    ) -> Result<(), CapacityError> {
        let src_end = src_pos
            .checked_add(count)
            .filter(|&end| end <= self.content_length)
            .ok_or(CapacityError {
                requested: count,
                available: self.content_length.saturating_sub(src_pos),
            })?;
        let dst_end = offset
            .checked_add(count)
            .filter(|&end| end <= dst.len())
            .ok_or(CapacityError {
                requested: count,
                available: dst.len().saturating_sub(offset),
            })?;

        dst[offset..dst_end].copy_from_slice(&self.bytes[src_pos..src_end]);
        Ok(())
    }

    /// Fills `dst` from the start of the valid content
    pub fn copy_to_slice(&self, dst: &mut [u8]) -> Result<(), CapacityError> {
        self.copy_to(0, dst, 0, dst.len())
    }

    /// Writes every valid byte to `writer`
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.content())
    }

    /// Drops the content without giving the array back
    pub fn clear(&mut self) {
        self.content_length = 0;
    }

    /// Returns the array to its pool
    pub fn release(self) {
        drop(self);
    }

    fn check_room(&self, count: usize) -> Result<(), CapacityError> {
        if count > self.bytes_left() {
            return Err(CapacityError {
                requested: count,
                available: self.bytes_left(),
            });
        }
        Ok(())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.content_length = 0;
        let bytes = std::mem::take(&mut self.bytes);
        self.pool.release(bytes);
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Copies `reader` to `writer` through a single pooled buffer
///
/// Returns the number of bytes copied once `reader` reports end of stream.
pub fn copy_stream<R, W>(pool: &BufferPool, reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = pool.acquire();
    let mut total = 0u64;

    loop {
        buffer.clear();
        let n = buffer.fill_from(reader)?;
        if n == 0 {
            break;
        }
        buffer.write_to(writer)?;
        total += n as u64;
    }

    writer.flush()?;
    Ok(total)
}
