//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → Engine::build → Engine::start (ports, admin, metrics)
//!
//! Run (startup.rs):
//!     config updates → EngineState::apply_config
//!     stats tick     → gauges + performance log
//!
//! Shutdown (shutdown.rs):
//!     trigger → stop accepting → drain connections (grace) → free pools
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!     SIGHUP → ConfigReloader::reload
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then pools, then listeners
//! - Shutdown waits at most `timeouts.shutdown_grace_ms` for live connections

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{Engine, EngineState, StartupError};
