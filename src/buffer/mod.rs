//! Buffer and memory pooling layer.
//!
//! # Data Flow
//! ```text
//! BufferPool (size classes, pre-reserved blocks)
//!     → Slab (one block on loan, returned on drop)
//!     → DynamicBuffer (chain of slabs, one per rx/tx side of a handler)
//!     → socket reads append, protocol / socket writes consume
//! ```
//!
//! # Design Decisions
//! - The slab region is the only resource shared by all connections
//! - Leaks show up in `BufferPool::outstanding_bytes`

pub mod dynamic;
pub mod pool;

pub use dynamic::{BufferObserver, DynamicBuffer};
pub use pool::{BufferError, BufferPool, BufferPoolSettings, BufferPoolStats, Slab};
