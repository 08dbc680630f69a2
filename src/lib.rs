//! Pooled, buffer-managed socket engine.
//!
//! Two services run on one set of connection handlers:
//! - MPX: a versioned, authenticated multiplexing protocol carrying named
//!   channels over a single TCP connection
//! - Proxy: a transparent TCP tunnel that pairs each accepted connection
//!   with an upstream one, optionally inspecting the HTTP request head

pub mod admin;
pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod lifecycle;
pub mod mpx;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::SocketEngineConfig;
pub use error::{EngineError, Result};
pub use lifecycle::{Engine, EngineState, Shutdown};
