//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Map the category bitmask onto tracing targets
//!
//! # Design Decisions
//! - Every log site names its category as the tracing `target`
//! - `RUST_LOG` overrides the configured filter entirely

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

pub const EXCEPTIONS: &str = "exceptions";
pub const PERFORMANCE: &str = "performance";
pub const SOCKET_FLOW: &str = "socket_flow";
pub const HANDLER_FLOW: &str = "handler_flow";
pub const PROGRAM_FLOW: &str = "program_flow";

bitflags::bitflags! {
    /// Log categories that may be switched on and off independently.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogCategories: u8 {
        const EXCEPTIONS = 0b0000_0001;
        const PERFORMANCE = 0b0000_0010;
        const SOCKET_FLOW = 0b0000_0100;
        const HANDLER_FLOW = 0b0000_1000;
        const PROGRAM_FLOW = 0b0001_0000;
    }
}

impl LogCategories {
    const TARGETS: [(LogCategories, &'static str); 5] = [
        (LogCategories::EXCEPTIONS, EXCEPTIONS),
        (LogCategories::PERFORMANCE, PERFORMANCE),
        (LogCategories::SOCKET_FLOW, SOCKET_FLOW),
        (LogCategories::HANDLER_FLOW, HANDLER_FLOW),
        (LogCategories::PROGRAM_FLOW, PROGRAM_FLOW),
    ];

    /// Filter directives enabling each selected category at `level` and
    /// turning the others off.
    pub fn directives(self, level: &str) -> String {
        let mut out = format!("warn,socket_engine={}", level);
        for (flag, target) in Self::TARGETS {
            let setting = if self.contains(flag) { level } else { "off" };
            out.push_str(&format!(",{}={}", target, setting));
        }
        out
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: &ObservabilityConfig) {
    let categories = LogCategories::from_bits_truncate(config.log_mask);
    let level = config.log_level.to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(categories.directives(&level)));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(
            target: "program_flow",
            categories = ?categories,
            level = %level,
            "Logging initialised"
        );
    }
}
