//! Slab allocator for connection buffers.
//!
//! # Responsibilities
//! - Hand out fixed-size byte blocks from power-of-two size classes
//! - Reclaim blocks for reuse instead of freeing them
//! - Track outstanding bytes for leak diagnosis and back-pressure
//!
//! # Design Decisions
//! - One locked free list per size class; the counters are atomics
//! - Blocks are pre-reserved for the segment class at construction
//! - `Slab` returns its block on drop, so early returns and panics cannot leak

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Buffer pool contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Requested size is larger than the largest size class.
    #[error("requested {requested} bytes, largest size class is {max}")]
    InvalidSize { requested: usize, max: usize },

    /// Returned buffer length is not one of the pool's size classes.
    #[error("buffer of {len} bytes does not match a pool size class")]
    SizeMismatch { len: usize },

    /// Returning the buffer would drive the outstanding counter negative.
    #[error("buffer of {len} bytes was not taken from this pool")]
    NotOutstanding { len: usize },
}

/// Size-class bounds for a pool.
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolSettings {
    /// Smallest size class in bytes (power of two).
    pub min_class: usize,
    /// Largest size class in bytes (power of two).
    pub max_class: usize,
    /// Size class used for buffer segments.
    pub segment_size: usize,
    /// Number of segment-class blocks reserved up front.
    pub preallocate: usize,
}

impl Default for BufferPoolSettings {
    fn default() -> Self {
        Self {
            min_class: 512,
            max_class: 64 * 1024,
            segment_size: 4096,
            preallocate: 256,
        }
    }
}

struct SizeClass {
    size: usize,
    free: Mutex<Vec<BytesMut>>,
}

/// Thread-safe pool of fixed-size byte blocks.
pub struct BufferPool {
    classes: Vec<SizeClass>,
    segment_size: usize,
    outstanding: AtomicUsize,
    taken: AtomicU64,
    returned: AtomicU64,
    allocated: AtomicU64,
}

impl BufferPool {
    /// Create a pool and pre-reserve its segment blocks.
    pub fn new(settings: BufferPoolSettings) -> Arc<Self> {
        let min = settings.min_class.max(1).next_power_of_two();
        let max = settings.max_class.max(min).next_power_of_two();

        let mut classes = Vec::new();
        let mut size = min;
        while size <= max {
            classes.push(SizeClass {
                size,
                free: Mutex::new(Vec::new()),
            });
            size *= 2;
        }

        let segment_size = settings.segment_size.clamp(min, max).next_power_of_two();
        let pool = Self {
            classes,
            segment_size,
            outstanding: AtomicUsize::new(0),
            taken: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        };

        if let Some(class) = pool.class_for(segment_size) {
            let mut free = class.free.lock();
            free.reserve(settings.preallocate);
            for _ in 0..settings.preallocate {
                free.push(BytesMut::zeroed(class.size));
            }
            pool.allocated
                .fetch_add(settings.preallocate as u64, Ordering::Relaxed);
        }

        tracing::debug!(
            target: "program_flow",
            min_class = min,
            max_class = max,
            segment_size,
            preallocated = settings.preallocate,
            "Buffer pool created"
        );

        Arc::new(pool)
    }

    /// Size class used for buffer segments.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Largest size class.
    pub fn max_class(&self) -> usize {
        self.classes.last().map(|c| c.size).unwrap_or(0)
    }

    /// Take a block of at least `size` bytes.
    pub fn take(self: &Arc<Self>, size: usize) -> Result<Slab, BufferError> {
        let buf = self.take_raw(size)?;
        Ok(Slab {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    /// Take a block without a return guard. The caller must hand it back
    /// through [`BufferPool::give_back`].
    pub fn take_raw(&self, size: usize) -> Result<BytesMut, BufferError> {
        let wanted = size.max(1).next_power_of_two();
        let class = self
            .classes
            .iter()
            .find(|c| c.size >= wanted)
            .ok_or(BufferError::InvalidSize {
                requested: size,
                max: self.max_class(),
            })?;

        let buf = match class.free.lock().pop() {
            Some(buf) => buf,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::zeroed(class.size)
            }
        };

        self.outstanding.fetch_add(class.size, Ordering::AcqRel);
        self.taken.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    /// Return a block to its size class.
    pub fn give_back(&self, buf: BytesMut) -> Result<(), BufferError> {
        let len = buf.len();
        let class = self
            .class_for(len)
            .ok_or(BufferError::SizeMismatch { len })?;

        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(len)
            })
            .map_err(|_| BufferError::NotOutstanding { len })?;

        class.free.lock().push(buf);
        self.returned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release every pooled (idle) block. Returns how many were freed.
    pub fn clear(&self) -> usize {
        let mut freed = 0;
        for class in &self.classes {
            let mut free = class.free.lock();
            freed += free.len();
            free.clear();
            free.shrink_to_fit();
        }
        tracing::debug!(target: "program_flow", freed, "Buffer pool cleared");
        freed
    }

    /// Bytes currently on loan.
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pooled_buffers = 0;
        let mut pooled_bytes = 0;
        for class in &self.classes {
            let n = class.free.lock().len();
            pooled_buffers += n;
            pooled_bytes += n * class.size;
        }
        BufferPoolStats {
            outstanding_bytes: self.outstanding_bytes(),
            pooled_buffers,
            pooled_bytes,
            taken: self.taken.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }

    fn class_for(&self, len: usize) -> Option<&SizeClass> {
        self.classes.iter().find(|c| c.size == len)
    }
}

/// Serializable pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct BufferPoolStats {
    pub outstanding_bytes: usize,
    pub pooled_buffers: usize,
    pub pooled_bytes: usize,
    pub taken: u64,
    pub returned: u64,
    pub allocated: u64,
}

/// A block on loan from a [`BufferPool`]. Returned to the pool on drop.
pub struct Slab {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Slab {
    /// Detach the block from its guard. The caller becomes responsible for
    /// returning it with [`BufferPool::give_back`].
    pub fn into_inner(mut self) -> BytesMut {
        self.buf.take().unwrap_or_default()
    }
}

impl Deref for Slab {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for Slab {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.buf.as_mut() {
            Some(buf) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab").field("len", &self.len()).finish()
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Err(e) = self.pool.give_back(buf) {
                tracing::warn!(target: "exceptions", error = %e, "Slab could not be returned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> Arc<BufferPool> {
        BufferPool::new(BufferPoolSettings {
            min_class: 64,
            max_class: 1024,
            segment_size: 256,
            preallocate: 4,
        })
    }

    #[test]
    fn take_rounds_up_to_size_class() {
        let pool = small_pool();
        let slab = pool.take(100).unwrap();
        assert_eq!(slab.len(), 128);

        let tiny = pool.take(1).unwrap();
        assert_eq!(tiny.len(), 64);
        assert_eq!(pool.outstanding_bytes(), 192);
    }

    #[test]
    fn oversize_request_is_rejected() {
        let pool = small_pool();
        let err = pool.take(4096).unwrap_err();
        assert_eq!(err, BufferError::InvalidSize { requested: 4096, max: 1024 });
        assert_eq!(pool.outstanding_bytes(), 0);
    }

    #[test]
    fn foreign_sizes_are_rejected() {
        let pool = small_pool();
        let err = pool.give_back(BytesMut::zeroed(100)).unwrap_err();
        assert_eq!(err, BufferError::SizeMismatch { len: 100 });
    }

    #[test]
    fn returning_untaken_buffer_never_goes_negative() {
        let pool = small_pool();
        let err = pool.give_back(BytesMut::zeroed(64)).unwrap_err();
        assert_eq!(err, BufferError::NotOutstanding { len: 64 });
        assert_eq!(pool.outstanding_bytes(), 0);
    }

    #[test]
    fn slab_drop_returns_block() {
        let pool = small_pool();
        {
            let _a = pool.take(256).unwrap();
            let _b = pool.take(256).unwrap();
            assert_eq!(pool.outstanding_bytes(), 512);
        }
        assert_eq!(pool.outstanding_bytes(), 0);
        assert_eq!(pool.stats().returned, 2);
    }

    #[test]
    fn preallocated_blocks_are_reused() {
        let pool = small_pool();
        let before = pool.stats().allocated;
        let slabs: Vec<_> = (0..4).map(|_| pool.take(256).unwrap()).collect();
        assert_eq!(pool.stats().allocated, before);
        drop(slabs);

        let _extra: Vec<_> = (0..5).map(|_| pool.take(256).unwrap()).collect();
        assert_eq!(pool.stats().allocated, before + 1);
    }

    #[test]
    fn outstanding_matches_unreturned_sizes() {
        let pool = small_pool();
        let sizes = [1usize, 65, 200, 513, 1024, 64, 300, 7, 900, 128];
        let mut held: Vec<BytesMut> = Vec::new();
        let mut seed = 17u32;

        for round in 0..200 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let give = !held.is_empty() && (seed >> 16) % 3 == 0;
            if give {
                let idx = (seed as usize >> 8) % held.len();
                let buf = held.swap_remove(idx);
                pool.give_back(buf).unwrap();
            } else {
                let size = sizes[round % sizes.len()];
                held.push(pool.take_raw(size).unwrap());
            }
            let expected: usize = held.iter().map(|b| b.len()).sum();
            assert_eq!(pool.outstanding_bytes(), expected);
        }

        for buf in held.drain(..) {
            pool.give_back(buf).unwrap();
        }
        assert_eq!(pool.outstanding_bytes(), 0);
    }

    #[test]
    fn clear_drops_idle_blocks_only() {
        let pool = small_pool();
        let held = pool.take(256).unwrap();
        let freed = pool.clear();
        assert_eq!(freed, 3);
        assert_eq!(pool.stats().pooled_buffers, 0);
        drop(held);
        assert_eq!(pool.stats().pooled_buffers, 1);
    }
}
