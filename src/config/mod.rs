//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SocketEngineConfig (validated, immutable)
//!
//! On file change or SIGHUP:
//!     watcher.rs → loader.rs → validation.rs
//!     → mpsc → Engine (ArcSwap store, ports and pool settings re-applied)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - An invalid reload is logged and ignored

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BindScope, ListenerConfig, MpxApp, MpxConfig, ObservabilityConfig, PoolConfig,
    ProxyConfig, SocketConfig, SocketEngineConfig, TimeoutConfig, TlsConfig,
};
pub use validation::ValidationError;
pub use watcher::{ConfigReloader, ConfigWatcher};
