//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Value ranges (timeouts > 0, water marks ordered, size classes ordered)
//! - Port conflicts between the MPX listener and proxy ports
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: `&SocketEngineConfig → Result<(), Vec<ValidationError>>`

use std::collections::BTreeSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::SocketEngineConfig;
use crate::http::ContentEncoding;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("port {0} is configured more than once")]
    DuplicatePort(u16),
}

fn non_zero(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero { field });
    }
}

fn address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if let Err(e) = value.parse::<SocketAddr>() {
        errors.push(ValidationError::Invalid {
            field,
            message: format!("'{}' is not host:port ({})", value, e),
        });
    }
}

pub fn validate_config(config: &SocketEngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // listener / proxy ports
    if config.mpx.enabled && config.listener.ports.is_empty() {
        errors.push(ValidationError::Empty { field: "listener.ports" });
    }
    non_zero(&mut errors, "listener.max_backlog", config.listener.max_backlog.into());
    let mut seen = BTreeSet::new();
    let proxy_ports = if config.proxy.enabled {
        config.proxy.ports.as_slice()
    } else {
        &[]
    };
    for &port in config.listener.ports.iter().chain(proxy_ports) {
        if port != 0 && !seen.insert(port) {
            errors.push(ValidationError::DuplicatePort(port));
        }
    }

    // socket
    if config.socket.keep_alive {
        non_zero(&mut errors, "socket.keep_alive_timeout_ms", config.socket.keep_alive_timeout_ms);
        non_zero(&mut errors, "socket.keep_alive_interval_ms", config.socket.keep_alive_interval_ms);
    }

    // pool
    let pool = &config.pool;
    non_zero(&mut errors, "pool.min_class", pool.min_class as u64);
    non_zero(&mut errors, "pool.read_chunk", pool.read_chunk as u64);
    non_zero(&mut errors, "pool.send_chunk", pool.send_chunk as u64);
    if pool.min_class > pool.max_class {
        errors.push(ValidationError::Invalid {
            field: "pool.max_class",
            message: format!("{} is below min_class {}", pool.max_class, pool.min_class),
        });
    }
    if pool.segment_size < pool.min_class || pool.segment_size > pool.max_class {
        errors.push(ValidationError::Invalid {
            field: "pool.segment_size",
            message: format!(
                "{} is outside [{}, {}]",
                pool.segment_size, pool.min_class, pool.max_class
            ),
        });
    }
    if pool.rx_low_water >= pool.rx_high_water {
        errors.push(ValidationError::Invalid {
            field: "pool.rx_low_water",
            message: format!("must be below rx_high_water ({})", pool.rx_high_water),
        });
    }

    // timeouts
    non_zero(&mut errors, "timeouts.connect_ms", config.timeouts.connect_ms);
    non_zero(&mut errors, "timeouts.header_read_ms", config.timeouts.header_read_ms);

    // mpx
    let mpx = &config.mpx;
    if mpx.minimum_version > mpx.version {
        errors.push(ValidationError::Invalid {
            field: "mpx.minimum_version",
            message: format!("{} is above version {}", mpx.minimum_version, mpx.version),
        });
    }
    non_zero(&mut errors, "mpx.max_frame_size", mpx.max_frame_size as u64);
    non_zero(&mut errors, "mpx.quantum", mpx.quantum as u64);
    non_zero(&mut errors, "mpx.tx_high_water", mpx.tx_high_water as u64);
    if mpx.max_frame_size as u64 > u64::from(u32::MAX) {
        errors.push(ValidationError::Invalid {
            field: "mpx.max_frame_size",
            message: "does not fit the 32-bit length field".to_string(),
        });
    }
    if ContentEncoding::from_token(&mpx.preferred_encoding).is_none() {
        errors.push(ValidationError::Invalid {
            field: "mpx.preferred_encoding",
            message: format!("unknown encoding '{}'", mpx.preferred_encoding),
        });
    }
    if mpx.auth_token.as_deref() == Some("") {
        errors.push(ValidationError::Empty { field: "mpx.auth_token" });
    }

    // proxy
    if config.proxy.enabled {
        if config.proxy.ports.is_empty() {
            errors.push(ValidationError::Empty { field: "proxy.ports" });
        }
        address(&mut errors, "proxy.upstream", &config.proxy.upstream);
        non_zero(&mut errors, "proxy.max_header_size", config.proxy.max_header_size as u64);
    }

    // tls
    if config.tls.enabled {
        if config.tls.cert_path.is_empty() {
            errors.push(ValidationError::Empty { field: "tls.cert_path" });
        }
        if config.tls.key_path.is_empty() {
            errors.push(ValidationError::Empty { field: "tls.key_path" });
        }
    }

    // observability
    let level = config.observability.log_level.to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error" | "off") {
        errors.push(ValidationError::Invalid {
            field: "observability.log_level",
            message: format!("unknown level '{}'", config.observability.log_level),
        });
    }
    if config.observability.metrics_enabled {
        address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    // admin
    if config.admin.enabled {
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::Empty { field: "admin.api_key" });
        }
        address(&mut errors, "admin.bind_address", &config.admin.bind_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
