//! Configuration schema definitions.
//!
//! Every section carries `#[serde(default)]`, so an empty file is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferPoolSettings;
use crate::handler::HandlerSettings;
use crate::http::ContentEncoding;
use crate::mpx::{CodecRegistry, MuxSettings, ProtocolVersion, SessionSettings, VersionPolicy};
use crate::net::listener::{ListenerSettings, SocketOptions};

/// Root configuration for the engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SocketEngineConfig {
    /// Ports served by the MPX server.
    pub listener: ListenerConfig,
    /// Options applied to every socket.
    pub socket: SocketConfig,
    /// Handler and buffer pools.
    pub pool: PoolConfig,
    pub timeouts: TimeoutConfig,
    pub mpx: MpxConfig,
    /// Plain TCP tunnels.
    pub proxy: ProxyConfig,
    pub tls: TlsConfig,
    pub observability: ObservabilityConfig,
    pub admin: AdminConfig,
}

/// Which interfaces a port is reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindScope {
    /// Bind 127.0.0.1.
    LocalOnly,
    /// Bind 0.0.0.0 and refuse loopback peers.
    ExternalOnly,
    /// Bind 0.0.0.0.
    Both,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port 0 binds an ephemeral port.
    pub ports: Vec<u16>,
    pub max_backlog: u32,
    pub bind_scope: BindScope,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            ports: vec![7400],
            max_backlog: 1024,
            bind_scope: BindScope::LocalOnly,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    pub keep_alive: bool,
    /// Idle time before the first keep-alive probe.
    pub keep_alive_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub nodelay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_timeout_ms: 60_000,
            keep_alive_interval_ms: 10_000,
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Handlers available to accepted connections. 0 = unbounded cache.
    pub max_connections: usize,
    /// Smallest buffer size class.
    pub min_class: usize,
    /// Largest buffer size class.
    pub max_class: usize,
    pub segment_size: usize,
    /// Segment blocks reserved at startup.
    pub preallocate: usize,
    pub read_chunk: usize,
    pub send_chunk: usize,
    /// Receive backlog at which reads pause.
    pub rx_high_water: usize,
    pub rx_low_water: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            min_class: 512,
            max_class: 64 * 1024,
            segment_size: 4096,
            preallocate: 256,
            read_chunk: 16 * 1024,
            send_chunk: 64 * 1024,
            rx_high_water: 1024 * 1024,
            rx_low_water: 256 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn buffer_settings(&self) -> BufferPoolSettings {
        BufferPoolSettings {
            min_class: self.min_class,
            max_class: self.max_class,
            segment_size: self.segment_size,
            preallocate: self.preallocate,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Outbound connect deadline.
    pub connect_ms: u64,
    /// Header (or MPX handshake) deadline after accept/connect.
    pub header_read_ms: u64,
    /// Keep-alive idle deadline. 0 disables it.
    pub keep_alive_idle_ms: u64,
    /// How long shutdown waits for live connections.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            header_read_ms: 10_000,
            keep_alive_idle_ms: 120_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

/// What the daemon does with data received on server sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MpxApp {
    /// Send every message back on the channel it arrived on.
    Echo,
    /// Drop received messages.
    Sink,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MpxConfig {
    pub enabled: bool,
    pub version: ProtocolVersion,
    pub minimum_version: ProtocolVersion,
    /// Shared secret clients must present. `None` accepts everyone.
    pub auth_token: Option<String>,
    pub app: MpxApp,
    pub max_frame_size: usize,
    /// Bytes a channel may write per turn.
    pub quantum: usize,
    pub tx_high_water: usize,
    pub compress_threshold: usize,
    pub max_message_size: usize,
    /// `identity`, `gzip` or `deflate`.
    pub preferred_encoding: String,
}

impl Default for MpxConfig {
    fn default() -> Self {
        let mux = MuxSettings::default();
        Self {
            enabled: true,
            version: ProtocolVersion::new(1, 0),
            minimum_version: ProtocolVersion::new(1, 0),
            auth_token: None,
            app: MpxApp::Echo,
            max_frame_size: mux.max_frame_size,
            quantum: mux.quantum,
            tx_high_water: mux.tx_high_water,
            compress_threshold: mux.compress_threshold,
            max_message_size: mux.max_message_size,
            preferred_encoding: "identity".to_string(),
        }
    }
}

impl MpxConfig {
    pub fn version_policy(&self) -> VersionPolicy {
        VersionPolicy {
            version: self.version,
            minimum: self.minimum_version,
        }
    }

    pub fn session_settings(&self, codecs: Arc<CodecRegistry>) -> SessionSettings {
        SessionSettings {
            version: self.version_policy(),
            mux: MuxSettings {
                max_frame_size: self.max_frame_size,
                quantum: self.quantum,
                tx_high_water: self.tx_high_water,
                compress_threshold: self.compress_threshold,
                preferred_encoding: ContentEncoding::from_token(&self.preferred_encoding)
                    .unwrap_or(ContentEncoding::Identity),
                max_message_size: self.max_message_size,
            },
            codecs,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    /// `host:port` of the upstream.
    pub upstream: String,
    /// Hold client bytes until a full HTTP request head arrived.
    pub inspect_http: bool,
    pub max_header_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ports: Vec::new(),
            upstream: "127.0.0.1:8080".to_string(),
            inspect_http: false,
            max_header_size: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Path to certificate chain (PEM).
    pub cert_path: String,
    /// Path to private key (PEM).
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Enabled log categories, see `observability::logging::LogCategories`.
    pub log_mask: u8,
    pub metrics_enabled: bool,
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_mask: 0x1f,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    /// Bearer token for the admin API.
    pub api_key: String,
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

impl SocketEngineConfig {
    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            header_timeout: Duration::from_millis(self.timeouts.header_read_ms),
            idle_timeout: Duration::from_millis(self.timeouts.keep_alive_idle_ms),
            rx_high_water: self.pool.rx_high_water,
            rx_low_water: self.pool.rx_low_water,
            send_chunk: self.pool.send_chunk,
            read_chunk: self.pool.read_chunk,
        }
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions::from(&self.socket)
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            scope: self.listener.bind_scope,
            backlog: self.listener.max_backlog,
            socket: self.socket_options(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: SocketEngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.ports, vec![7400]);
        assert_eq!(config.listener.bind_scope, BindScope::LocalOnly);
        assert!(config.mpx.enabled);
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn sections_parse() {
        let config: SocketEngineConfig = toml::from_str(
            r#"
            [listener]
            ports = [9000, 9001]
            bind_scope = "external_only"

            [mpx]
            version = "2.1"
            minimum_version = "2.0"
            auth_token = "secret"
            app = "sink"

            [timeouts]
            header_read_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.ports, vec![9000, 9001]);
        assert_eq!(config.listener.bind_scope, BindScope::ExternalOnly);
        assert_eq!(config.mpx.version, ProtocolVersion::new(2, 1));
        assert_eq!(config.mpx.app, MpxApp::Sink);
        assert_eq!(
            config.handler_settings().header_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn bad_version_string_is_a_parse_error() {
        let parsed: Result<SocketEngineConfig, _> = toml::from_str("[mpx]\nversion = \"two\"\n");
        assert!(parsed.is_err());
    }
}
