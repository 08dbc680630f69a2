//! Proxy tunnels built from two connection handlers.

pub mod pair;
pub mod tunnel;

pub use pair::{ProxyPair, Side};
pub use tunnel::{run_tunnel, ProxyForward, TunnelContext, TunnelSettings, TunnelSummary};
