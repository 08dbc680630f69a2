//! Connection handler subsystem.
//!
//! # Data Flow
//! ```text
//! HandlerPool::pop → HandlerLease (Idle handler, fresh ID)
//!     → on_accepted / begin_connect + on_connected
//!     → driver::drive (socket I/O ⇄ ConnectionHandler transitions ⇄ Protocol)
//!     → lease dropped → reset (partner reset too) → back to the pool (or disposed)
//! ```
//!
//! # Design Decisions
//! - The state machine is synchronous; only the driver touches sockets
//! - One mutex per handler serializes every transition
//! - Pools are explicit objects shared by `Arc`

pub mod connection;
pub mod driver;
pub mod pool;
pub mod state;

pub use connection::{ConnectionHandler, HandlerSignals, Partner};
pub use driver::{drive, CloseReason, DriveOutcome, Protocol};
pub use pool::{HandlerLease, HandlerPool, HandlerPoolStats, SharedHandler};
pub use state::{ConnectionState, HandlerSettings, NextAction};
