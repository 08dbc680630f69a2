//! Growable byte queue backed by pool segments.
//!
//! # Responsibilities
//! - Queue bytes in order with separate produce and consume ends
//! - Grow by chaining pool blocks instead of reallocating contiguously
//! - Notify an observer when data arrives and when the queue drains
//!
//! # Design Decisions
//! - Segment sizes double up to the pool's largest class, then stay there
//! - A segment goes back to the pool as soon as its last byte is read
//! - Not synchronized: owned by one handler and used under its lock

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::pool::{BufferError, BufferPool, Slab};

/// Receives buffer notifications.
///
/// Call order: `data_added` runs after the appended bytes are readable;
/// `drained` runs after the count reached zero and every segment went back
/// to the pool. Both run on the thread that mutated the buffer, while the
/// owning handler's lock is held, so implementations must not block.
pub trait BufferObserver: Send + Sync {
    /// `added` bytes were appended; `available` is the new unread total.
    fn data_added(&self, added: usize, available: usize) {
        let _ = (added, available);
    }

    /// The buffer transitioned from non-empty to empty.
    fn drained(&self) {}
}

struct Segment {
    slab: Slab,
    start: usize,
    end: usize,
}

impl Segment {
    fn readable(&self) -> &[u8] {
        &self.slab[self.start..self.end]
    }

    fn spare(&self) -> usize {
        self.slab.len() - self.end
    }
}

/// Ordered byte queue made of pool-sourced segments.
pub struct DynamicBuffer {
    pool: Arc<BufferPool>,
    segments: VecDeque<Segment>,
    count: usize,
    next_segment: usize,
    observer: Option<Arc<dyn BufferObserver>>,
}

impl DynamicBuffer {
    /// Create an empty buffer drawing segments from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let next_segment = pool.segment_size();
        Self {
            pool,
            segments: VecDeque::new(),
            count: 0,
            next_segment,
            observer: None,
        }
    }

    /// Install (or remove) the observer.
    pub fn set_observer(&mut self, observer: Option<Arc<dyn BufferObserver>>) {
        self.observer = observer;
    }

    /// Unread bytes.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of pool segments currently held.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Copy `data` onto the end of the queue.
    pub fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut rest = data;
        while !rest.is_empty() {
            let needs_segment = self.segments.back().map_or(true, |s| s.spare() == 0);
            if needs_segment {
                let slab = self.pool.take(self.next_segment)?;
                self.next_segment = (self.next_segment * 2).min(self.pool.max_class());
                self.segments.push_back(Segment {
                    slab,
                    start: 0,
                    end: 0,
                });
            }

            if let Some(tail) = self.segments.back_mut() {
                let n = tail.spare().min(rest.len());
                let end = tail.end;
                tail.slab[end..end + n].copy_from_slice(&rest[..n]);
                tail.end += n;
                rest = &rest[n..];
            }
        }

        self.count += data.len();
        if let Some(observer) = &self.observer {
            observer.data_added(data.len(), self.count);
        }
        Ok(())
    }

    /// Copy up to `n` unread bytes without advancing the read cursor.
    pub fn peek(&self, n: usize) -> Bytes {
        let want = n.min(self.count);
        let mut out = BytesMut::with_capacity(want);
        for segment in &self.segments {
            if out.len() == want {
                break;
            }
            let chunk = segment.readable();
            let take = chunk.len().min(want - out.len());
            out.extend_from_slice(&chunk[..take]);
        }
        out.freeze()
    }

    /// Copy of the first contiguous run of unread bytes, at most `max` long.
    pub fn front_chunk(&self, max: usize) -> Bytes {
        match self.segments.front() {
            Some(segment) => {
                let chunk = segment.readable();
                Bytes::copy_from_slice(&chunk[..chunk.len().min(max)])
            }
            None => Bytes::new(),
        }
    }

    /// Remove and return up to `n` unread bytes.
    pub fn consume(&mut self, n: usize) -> Bytes {
        let out = self.peek(n);
        self.discard(out.len());
        out
    }

    /// Advance the read cursor by up to `n` bytes. Returns how many bytes
    /// were skipped.
    pub fn discard(&mut self, n: usize) -> usize {
        let want = n.min(self.count);
        let mut left = want;
        while left > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            let available = front.end - front.start;
            let step = available.min(left);
            front.start += step;
            left -= step;
            if front.start == front.end && front.spare() == 0 {
                self.segments.pop_front();
            }
        }

        let was_empty = self.count == 0;
        self.count -= want;
        if self.count == 0 {
            self.release_segments();
            if !was_empty {
                self.notify_drained();
            }
        }
        want
    }

    /// Drop all unread bytes and return every segment to the pool.
    pub fn clear(&mut self) {
        let had_data = self.count > 0;
        self.count = 0;
        self.release_segments();
        if had_data {
            self.notify_drained();
        }
    }

    fn release_segments(&mut self) {
        self.segments.clear();
        self.next_segment = self.pool.segment_size();
    }

    fn notify_drained(&self) {
        if let Some(observer) = &self.observer {
            observer.drained();
        }
    }
}

impl std::fmt::Debug for DynamicBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBuffer")
            .field("count", &self.count)
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::pool::BufferPoolSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        added: AtomicUsize,
        last_total: AtomicUsize,
        drained: AtomicUsize,
    }

    impl BufferObserver for Counting {
        fn data_added(&self, _added: usize, available: usize) {
            self.added.fetch_add(1, Ordering::SeqCst);
            self.last_total.store(available, Ordering::SeqCst);
        }

        fn drained(&self) {
            self.drained.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(BufferPoolSettings {
            min_class: 16,
            max_class: 128,
            segment_size: 16,
            preallocate: 2,
        })
    }

    #[test]
    fn bytes_come_out_in_append_order() {
        let pool = pool();
        let mut buf = DynamicBuffer::new(pool.clone());
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        for chunk in payload.chunks(37) {
            buf.append(chunk).unwrap();
        }
        assert_eq!(buf.count(), 1000);

        let mut out = Vec::new();
        while !buf.is_empty() {
            out.extend_from_slice(&buf.consume(53));
        }
        assert_eq!(out, payload);
        assert_eq!(buf.segment_count(), 0);
        assert_eq!(pool.outstanding_bytes(), 0);
    }

    #[test]
    fn segments_grow_geometrically() {
        let pool = pool();
        let mut buf = DynamicBuffer::new(pool.clone());
        buf.append(&[1u8; 16]).unwrap();
        buf.append(&[2u8; 32]).unwrap();
        buf.append(&[3u8; 64]).unwrap();
        assert_eq!(buf.segment_count(), 3);
        assert_eq!(pool.outstanding_bytes(), 16 + 32 + 64);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut buf = DynamicBuffer::new(pool());
        buf.append(b"hello world").unwrap();
        assert_eq!(&buf.peek(5)[..], b"hello");
        assert_eq!(buf.count(), 11);
        assert_eq!(&buf.consume(100)[..], b"hello world");
    }

    #[test]
    fn drained_fires_once_per_empty_transition() {
        let observer = Arc::new(Counting::default());
        let mut buf = DynamicBuffer::new(pool());
        buf.set_observer(Some(observer.clone()));

        buf.append(b"abcdef").unwrap();
        assert_eq!(observer.last_total.load(Ordering::SeqCst), 6);
        buf.discard(3);
        buf.discard(3);
        buf.discard(3);
        buf.consume(10);
        assert_eq!(observer.drained.load(Ordering::SeqCst), 1);

        buf.append(b"xy").unwrap();
        buf.clear();
        buf.clear();
        assert_eq!(observer.drained.load(Ordering::SeqCst), 2);
        assert_eq!(observer.added.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_append_is_silent() {
        let observer = Arc::new(Counting::default());
        let mut buf = DynamicBuffer::new(pool());
        buf.set_observer(Some(observer.clone()));
        buf.append(&[]).unwrap();
        assert_eq!(observer.added.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn front_chunk_stops_at_segment_boundary() {
        let mut buf = DynamicBuffer::new(pool());
        buf.append(&[7u8; 20]).unwrap();
        assert_eq!(buf.front_chunk(100).len(), 16);
        assert_eq!(buf.front_chunk(4).len(), 4);
    }
}
