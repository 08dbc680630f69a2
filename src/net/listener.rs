//! TCP listener with backlog, bind scope and socket tuning.
//!
//! # Responsibilities
//! - Bind one port through socket2 (reuse address, explicit backlog)
//! - Accept connections, refusing peers outside the bind scope
//! - Apply keep-alive and nodelay to every accepted or connected stream

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{BindScope, SocketConfig};

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind a port.
    Bind { port: u16, source: std::io::Error },
    /// Failed to accept a connection.
    Accept(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind { port, source } => write!(f, "Failed to bind port {}: {}", port, source),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Per-socket TCP options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub keep_alive: bool,
    /// Idle time before the first keep-alive probe.
    pub keep_alive_time: Duration,
    /// Time between unanswered probes.
    pub keep_alive_interval: Duration,
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_time: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(10),
            nodelay: true,
        }
    }
}

impl From<&SocketConfig> for SocketOptions {
    fn from(config: &SocketConfig) -> Self {
        Self {
            keep_alive: config.keep_alive,
            keep_alive_time: Duration::from_millis(config.keep_alive_timeout_ms),
            keep_alive_interval: Duration::from_millis(config.keep_alive_interval_ms),
            nodelay: config.nodelay,
        }
    }
}

/// Apply `options` to a connected stream.
pub fn tune_stream(stream: &TcpStream, options: &SocketOptions) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(options.nodelay)?;
    if options.keep_alive {
        let keepalive = TcpKeepalive::new()
            .with_time(options.keep_alive_time)
            .with_interval(options.keep_alive_interval);
        sock.set_tcp_keepalive(&keepalive)?;
    } else {
        sock.set_keepalive(false)?;
    }
    Ok(())
}

/// Address a port binds to under `scope`.
pub fn bind_address(scope: BindScope, port: u16) -> SocketAddr {
    let ip = match scope {
        BindScope::LocalOnly => Ipv4Addr::LOCALHOST,
        BindScope::ExternalOnly | BindScope::Both => Ipv4Addr::UNSPECIFIED,
    };
    SocketAddr::new(IpAddr::V4(ip), port)
}

/// Whether a peer may connect under `scope`.
pub fn scope_allows(scope: BindScope, peer: &SocketAddr) -> bool {
    match scope {
        BindScope::ExternalOnly => !peer.ip().is_loopback(),
        BindScope::LocalOnly | BindScope::Both => true,
    }
}

/// Everything needed to bind one port.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub scope: BindScope,
    pub backlog: u32,
    pub socket: SocketOptions,
}

/// A bound port.
pub struct Listener {
    inner: TcpListener,
    port: u16,
    settings: ListenerSettings,
}

impl Listener {
    /// Bind `port` under the configured scope. Must run inside a tokio runtime.
    pub fn bind(port: u16, settings: ListenerSettings) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind { port, source };
        let addr = bind_address(settings.scope, port);

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        let backlog = i32::try_from(settings.backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(bind_err)?;

        let inner = TcpListener::from_std(socket.into()).map_err(bind_err)?;
        let local = inner.local_addr().map_err(bind_err)?;

        tracing::info!(
            target: "socket_flow",
            address = %local,
            scope = ?settings.scope,
            backlog = settings.backlog,
            "Listener bound"
        );

        Ok(Self {
            inner,
            port: local.port(),
            settings,
        })
    }

    /// Accept the next permitted connection, already tuned.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        loop {
            let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;

            if !scope_allows(self.settings.scope, &peer) {
                tracing::debug!(
                    target: "socket_flow",
                    peer = %peer,
                    port = self.port,
                    "Loopback peer refused"
                );
                continue;
            }
            if let Err(e) = tune_stream(&stream, &self.settings.socket) {
                tracing::warn!(
                    target: "exceptions",
                    peer = %peer,
                    error = %e,
                    "Socket tuning failed"
                );
                continue;
            }

            tracing::debug!(target: "socket_flow", peer = %peer, port = self.port, "Connection accepted");
            return Ok((stream, peer));
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Bound port; differs from the requested one when that was 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(scope: BindScope) -> ListenerSettings {
        ListenerSettings {
            scope,
            backlog: 16,
            socket: SocketOptions::default(),
        }
    }

    #[test]
    fn scope_picks_bind_address() {
        assert_eq!(bind_address(BindScope::LocalOnly, 80).to_string(), "127.0.0.1:80");
        assert_eq!(bind_address(BindScope::Both, 80).to_string(), "0.0.0.0:80");
    }

    #[test]
    fn external_only_refuses_loopback() {
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let remote: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        assert!(!scope_allows(BindScope::ExternalOnly, &local));
        assert!(scope_allows(BindScope::ExternalOnly, &remote));
        assert!(scope_allows(BindScope::LocalOnly, &local));
    }

    #[tokio::test]
    async fn accepts_and_tunes() {
        let listener = Listener::bind(0, settings(BindScope::LocalOnly)).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(listener.port(), 0);

        let client = tokio::spawn(TcpStream::connect(addr));
        let (stream, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        assert!(stream.nodelay().unwrap());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_reports_port() {
        let first = Listener::bind(0, settings(BindScope::LocalOnly)).unwrap();
        let port = first.port();
        let mut second = settings(BindScope::LocalOnly);
        second.backlog = 4;
        // SO_REUSEADDR does not allow two listeners on one port.
        match Listener::bind(port, second) {
            Err(ListenerError::Bind { port: p, .. }) => assert_eq!(p, port),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("second bind succeeded"),
        }
    }
}
