//! Error taxonomy for the connection engine.
//!
//! # Propagation
//! - Per-connection faults end only the owning connection (and its pair)
//! - Configuration and startup faults are fatal to the process
//! - Nothing in the core retries; callers own retry policy

use std::fmt;
use thiserror::Error;

use crate::buffer::BufferError;
use crate::mpx::version::VersionMismatch;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The header (or MPX handshake) was not complete in time.
    HeaderRead,
    /// A keep-alive connection sat idle for too long.
    KeepAliveIdle,
    /// Establishing an outbound connection took too long.
    Connect,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::HeaderRead => write!(f, "header read deadline exceeded"),
            TimeoutKind::KeepAliveIdle => write!(f, "keep-alive idle deadline exceeded"),
            TimeoutKind::Connect => write!(f, "connect deadline exceeded"),
        }
    }
}

/// Errors produced by the connection engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Socket-level error or abrupt peer close.
    #[error("connection fault: {0}")]
    ConnectionFault(#[from] std::io::Error),

    /// MPX version negotiation failed.
    #[error("protocol version mismatch: {0}")]
    ProtocolVersionMismatch(VersionMismatch),

    /// The handshake credential was rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// A header or frame exceeded its configured maximum size.
    #[error("buffer overflow: {len} bytes exceeds limit of {max}")]
    BufferOverflow { len: usize, max: usize },

    /// A deadline expired.
    #[error("timed out: {0}")]
    Timeout(TimeoutKind),

    /// No handler available under the configured capacity.
    #[error("handler pool exhausted ({max} connections in use)")]
    PoolExhausted { max: usize },

    /// A channel with this name is already registered.
    #[error("channel '{0}' already exists")]
    DuplicateChannel(String),

    /// No channel with this name is registered.
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An operation or completion arrived in a state that does not accept it.
    #[error("invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// One side of a proxy pair is already bound to another handler.
    #[error("handler {0} is already paired")]
    AlreadyPaired(String),

    /// Buffer pool contract violation.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// The certificate collaborator could not supply an identity.
    #[error("certificate error: {0}")]
    Certificate(String),
}

impl EngineError {
    /// Short label used for metrics and close reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ConnectionFault(_) => "connection_fault",
            EngineError::ProtocolVersionMismatch(_) => "version_mismatch",
            EngineError::AuthenticationFailure(_) => "auth_failure",
            EngineError::BufferOverflow { .. } => "buffer_overflow",
            EngineError::Timeout(_) => "timeout",
            EngineError::PoolExhausted { .. } => "pool_exhausted",
            EngineError::DuplicateChannel(_) => "duplicate_channel",
            EngineError::UnknownChannel(_) => "unknown_channel",
            EngineError::MalformedFrame(_) => "malformed_frame",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::AlreadyPaired(_) => "already_paired",
            EngineError::Buffer(_) => "buffer",
            EngineError::Certificate(_) => "certificate",
        }
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        let err = EngineError::Timeout(TimeoutKind::HeaderRead);
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "timed out: header read deadline exceeded");

        let err = EngineError::BufferOverflow { len: 10, max: 4 };
        assert_eq!(err.kind(), "buffer_overflow");
    }
}
