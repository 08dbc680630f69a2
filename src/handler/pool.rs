//! Reusable connection handlers.
//!
//! Two flavors share one type:
//! - bounded (`max > 0`): `pop` refuses once `max` handlers are on loan
//! - cache (`max == 0`): never refuses and never discards returned handlers
//!
//! A handler goes back to the pool when its [`HandlerLease`] drops. It is
//! reset first, so buffered data never leaks into the next connection. A
//! proxy partner still paired with it is reset as well.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::handler::connection::ConnectionHandler;
use crate::handler::state::{ConnectionState, HandlerSettings};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;

/// A handler shared between its driver and its owner.
pub type SharedHandler = Arc<Mutex<ConnectionHandler>>;

#[derive(Default)]
struct Slots {
    idle: Vec<SharedHandler>,
    in_use: usize,
}

/// Counters exposed on the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerPoolStats {
    pub name: &'static str,
    pub max: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub disposed: u64,
}

/// Pool of [`ConnectionHandler`]s.
pub struct HandlerPool {
    name: &'static str,
    max: usize,
    buffers: Arc<BufferPool>,
    settings: ArcSwap<HandlerSettings>,
    slots: Mutex<Slots>,
    created: AtomicU64,
    disposed: AtomicU64,
}

impl HandlerPool {
    /// Bounded pool lending at most `max` handlers.
    pub fn new(
        name: &'static str,
        max: usize,
        buffers: Arc<BufferPool>,
        settings: HandlerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            max,
            buffers,
            settings: ArcSwap::from_pointee(settings),
            slots: Mutex::new(Slots::default()),
            created: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        })
    }

    /// Unbounded cache pool.
    pub fn cache(
        name: &'static str,
        buffers: Arc<BufferPool>,
        settings: HandlerSettings,
    ) -> Arc<Self> {
        Self::new(name, 0, buffers, settings)
    }

    pub fn is_cache(&self) -> bool {
        self.max == 0
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Settings handed to handlers on their next `pop`.
    pub fn settings(&self) -> Arc<HandlerSettings> {
        self.settings.load_full()
    }

    /// Swap in new settings. Handlers on loan keep the ones they started with.
    pub fn set_settings(&self, settings: HandlerSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Lend an idle handler, creating one if allowed.
    ///
    /// Returns `None` when the pool is bounded and exhausted.
    pub fn pop(self: &Arc<Self>) -> Option<HandlerLease> {
        let settings = (*self.settings.load_full()).clone();
        let mut slots = self.slots.lock();

        let handler = match slots.idle.pop() {
            Some(handler) => {
                handler.lock().recycle(settings);
                handler
            }
            None if self.max == 0 || slots.in_use < self.max => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Arc::new(Mutex::new(ConnectionHandler::new(
                    Arc::clone(&self.buffers),
                    settings,
                )))
            }
            None => {
                drop(slots);
                tracing::warn!(
                    target: "exceptions",
                    pool = self.name,
                    max = self.max,
                    "Handler pool exhausted"
                );
                metrics::record_pool_exhausted(self.name);
                return None;
            }
        };

        slots.in_use += 1;
        metrics::set_handlers_in_use(self.name, slots.in_use);
        Some(HandlerLease {
            pool: Arc::clone(self),
            handler,
        })
    }

    /// Return a lent handler. Same as dropping the lease.
    pub fn push(&self, lease: HandlerLease) {
        drop(lease);
    }

    fn release(&self, handler: SharedHandler) {
        let (keep, partner, id) = {
            let mut h = handler.lock();
            let id = h.id();
            if h.state() == ConnectionState::Disposed {
                (false, None, id)
            } else {
                (true, h.reset(), id)
            }
        };
        if let Some(partner) = partner {
            partner.reset_from(id);
        }

        let mut slots = self.slots.lock();
        slots.in_use = slots.in_use.saturating_sub(1);
        metrics::set_handlers_in_use(self.name, slots.in_use);

        if keep && (self.max == 0 || slots.idle.len() < self.max) {
            slots.idle.push(handler);
        } else {
            drop(slots);
            handler.lock().dispose();
            self.disposed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Dispose every idle handler. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let idle = std::mem::take(&mut self.slots.lock().idle);
        let count = idle.len();
        for handler in idle {
            handler.lock().dispose();
        }
        self.disposed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> HandlerPoolStats {
        let slots = self.slots.lock();
        HandlerPoolStats {
            name: self.name,
            max: self.max,
            idle: slots.idle.len(),
            in_use: slots.in_use,
            created: self.created.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
        }
    }
}

/// A handler on loan from a [`HandlerPool`].
pub struct HandlerLease {
    pool: Arc<HandlerPool>,
    handler: SharedHandler,
}

impl HandlerLease {
    /// Shared reference for drivers and pairs.
    pub fn shared(&self) -> SharedHandler {
        Arc::clone(&self.handler)
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, ConnectionHandler> {
        self.handler.lock()
    }

    pub fn id(&self) -> ConnectionId {
        self.lock().id()
    }
}

impl Drop for HandlerLease {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.handler));
    }
}

impl std::fmt::Debug for HandlerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerLease")
            .field("pool", &self.pool.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolSettings;
    use crate::handler::connection::Partner;
    use std::time::Instant;

    fn buffers() -> Arc<BufferPool> {
        BufferPool::new(BufferPoolSettings {
            min_class: 64,
            max_class: 1024,
            segment_size: 64,
            preallocate: 0,
        })
    }

    #[test]
    fn bounded_pool_refuses_when_exhausted() {
        let pool = HandlerPool::new("test", 1, buffers(), HandlerSettings::default());
        let first = pool.pop();
        assert!(first.is_some());
        assert!(pool.pop().is_none());

        drop(first);
        assert!(pool.pop().is_some());
    }

    #[test]
    fn cache_pool_never_refuses_or_discards() {
        let pool = HandlerPool::cache("cache", buffers(), HandlerSettings::default());
        let leases: Vec<_> = (0..10).filter_map(|_| pool.pop()).collect();
        assert_eq!(leases.len(), 10);
        drop(leases);

        let stats = pool.stats();
        assert_eq!(stats.idle, 10);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.disposed, 0);
    }

    #[test]
    fn returned_handler_is_reset_and_reused() {
        let buffers = buffers();
        let pool = HandlerPool::new("test", 2, buffers.clone(), HandlerSettings::default());
        let peer = "127.0.0.1:9000".parse().unwrap();

        let lease = pool.pop().unwrap();
        let first_id = lease.id();
        {
            let mut h = lease.lock();
            h.on_accepted(peer, Instant::now()).unwrap();
            h.send(b"left behind").unwrap();
        }
        assert!(buffers.outstanding_bytes() > 0);
        drop(lease);
        assert_eq!(buffers.outstanding_bytes(), 0);

        let again = pool.pop().unwrap();
        assert_ne!(again.id(), first_id);
        assert_eq!(again.lock().state(), ConnectionState::Idle);
        assert!(again.lock().tx().is_empty());
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn disposed_handler_is_not_pooled() {
        let pool = HandlerPool::new("test", 2, buffers(), HandlerSettings::default());
        let lease = pool.pop().unwrap();
        lease.lock().dispose();
        drop(lease);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.disposed, 1);
    }

    #[test]
    fn returning_one_side_of_a_pair_resets_the_other() {
        let pool = HandlerPool::new("test", 4, buffers(), HandlerSettings::default());
        let peer = "127.0.0.1:9001".parse().unwrap();
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        a.lock().on_accepted(peer, Instant::now()).unwrap();
        b.lock().on_accepted(peer, Instant::now()).unwrap();
        b.lock().send(b"queued for a").unwrap();
        a.lock().link_partner(Partner::new(b.id(), &b.shared())).unwrap();
        b.lock().link_partner(Partner::new(a.id(), &a.shared())).unwrap();

        drop(a);

        let h = b.lock();
        assert_eq!(h.paired_with(), None);
        assert_eq!(h.state(), ConnectionState::Idle);
        assert!(h.tx().is_empty());
    }

    #[test]
    fn stale_partner_is_left_alone() {
        let pool = HandlerPool::new("test", 4, buffers(), HandlerSettings::default());
        let peer = "127.0.0.1:9002".parse().unwrap();
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        let c = pool.pop().unwrap();
        b.lock().on_accepted(peer, Instant::now()).unwrap();
        a.lock().link_partner(Partner::new(b.id(), &b.shared())).unwrap();
        // `b` moved on to another partner meanwhile.
        b.lock().link_partner(Partner::new(c.id(), &c.shared())).unwrap();

        drop(a);

        let h = b.lock();
        assert_eq!(h.paired_with(), Some(c.id()));
        assert_eq!(h.state(), ConnectionState::Connected);
    }

    #[test]
    fn settings_apply_to_next_pop() {
        let pool = HandlerPool::new("test", 1, buffers(), HandlerSettings::default());
        drop(pool.pop());

        pool.set_settings(HandlerSettings {
            send_chunk: 7,
            ..HandlerSettings::default()
        });
        let lease = pool.pop().unwrap();
        assert_eq!(lease.lock().settings().send_chunk, 7);
    }
}
