//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use socket_engine::buffer::BufferPool;
use socket_engine::config::SocketEngineConfig;
use socket_engine::handler::HandlerPool;
use socket_engine::mpx::{CodecRegistry, EndpointSettings, MpxEndpoint, ProtocolVersion};
use socket_engine::net::ConnectionRegistry;
use socket_engine::{Engine, Shutdown};

/// Start an upstream that writes back everything it reads.
pub async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// MPX on an ephemeral port, everything else off.
pub fn mpx_config(token: Option<&str>) -> SocketEngineConfig {
    let mut config = SocketEngineConfig::default();
    config.listener.ports = vec![0];
    config.mpx.auth_token = token.map(str::to_string);
    config.timeouts.shutdown_grace_ms = 2_000;
    config
}

/// Proxy on an ephemeral port towards `upstream`, MPX off.
pub fn proxy_config(upstream: SocketAddr) -> SocketEngineConfig {
    let mut config = SocketEngineConfig::default();
    config.mpx.enabled = false;
    config.proxy.enabled = true;
    config.proxy.ports = vec![0];
    config.proxy.upstream = upstream.to_string();
    config.timeouts.shutdown_grace_ms = 2_000;
    config
}

pub struct RunningEngine {
    pub mpx: Vec<SocketAddr>,
    pub proxy: Vec<SocketAddr>,
    pub state: Arc<socket_engine::EngineState>,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

impl RunningEngine {
    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("engine did not stop")
            .unwrap();
    }
}

pub async fn start_engine(config: SocketEngineConfig) -> RunningEngine {
    let mut engine = Engine::build(config).unwrap();
    engine.start().await.unwrap();
    let running_mpx = engine.mpx_addrs();
    let running_proxy = engine.proxy_addrs();
    let state = Arc::clone(engine.state());
    let shutdown = engine.shutdown();
    let task = tokio::spawn(engine.serve(None));
    RunningEngine {
        mpx: running_mpx,
        proxy: running_proxy,
        state,
        shutdown,
        task,
    }
}

/// Client-side endpoint speaking `version` with minimum `minimum`.
pub fn client_endpoint(version: ProtocolVersion, minimum: ProtocolVersion) -> MpxEndpoint {
    let mut config = SocketEngineConfig::default();
    config.mpx.version = version;
    config.mpx.minimum_version = minimum;
    let buffers = BufferPool::new(config.pool.buffer_settings());
    MpxEndpoint::new(
        HandlerPool::cache("client", buffers, config.handler_settings()),
        ConnectionRegistry::new(),
        Shutdown::new(),
        EndpointSettings {
            session: config.mpx.session_settings(Arc::new(CodecRegistry::new())),
            socket: config.socket_options(),
            connect_timeout: config.connect_timeout(),
        },
    )
}
