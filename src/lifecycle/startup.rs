//! Engine construction and the run loop.
//!
//! # Responsibilities
//! - Build every subsystem explicitly from one validated config
//! - Bind MPX and proxy ports, the admin API and the metrics endpoint
//! - Apply configuration updates (ports, handler settings, MPX settings)
//! - Drain on shutdown: stop accepting, wait for connections, free buffers
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)
//! - Pool capacity and buffer size classes are fixed for the process lifetime

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::admin;
use crate::buffer::BufferPool;
use crate::config::{MpxApp, SocketEngineConfig};
use crate::error::EngineError;
use crate::handler::HandlerPool;
use crate::lifecycle::shutdown::Shutdown;
use crate::mpx::{
    serve_connection, AllowAll, Authenticator, CodecRegistry, EndpointSettings, MpxConnection,
    MpxEndpoint, MpxEvent, SharedSecret,
};
use crate::net::{
    CertificateProvider, CertificateRequest, ConnectionRegistry, FileCertificateProvider, PortSet,
};
use crate::observability::metrics;
use crate::proxy::{run_tunnel, TunnelContext, TunnelSettings};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid upstream address '{0}'")]
    Upstream(String),

    #[error("TLS identity unavailable: {0}")]
    Tls(#[source] EngineError),

    #[error("failed to bind ports: {0:?}")]
    Bind(Vec<(u16, String)>),

    #[error("admin API failed to start: {0}")]
    Admin(#[source] std::io::Error),
}

/// Server-side MPX behaviour that survives config reloads.
pub struct MpxService {
    pub endpoint: Arc<MpxEndpoint>,
    authenticator: RwLock<Arc<dyn Authenticator>>,
    app: RwLock<MpxApp>,
}

impl MpxService {
    fn configure(&self, config: &SocketEngineConfig) {
        *self.authenticator.write() = authenticator_for(config);
        *self.app.write() = config.mpx.app;
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let authenticator = Arc::clone(&*self.authenticator.read());
        match serve_connection(&self.endpoint, stream, peer, authenticator) {
            Ok(connection) => {
                tokio::spawn(run_app(*self.app.read(), connection));
            }
            Err(e) => tracing::warn!(
                target: "exceptions",
                peer = %peer,
                error = %e,
                "MPX connection refused"
            ),
        }
    }
}

fn authenticator_for(config: &SocketEngineConfig) -> Arc<dyn Authenticator> {
    match &config.mpx.auth_token {
        Some(token) => Arc::new(SharedSecret::new(token.as_bytes())),
        None => Arc::new(AllowAll),
    }
}

/// Serve the configured application on one server session.
async fn run_app(app: MpxApp, mut connection: MpxConnection) {
    while let Some(event) = connection.next_event().await {
        match event {
            MpxEvent::Received { channel, data } if app == MpxApp::Echo => {
                if let Err(e) = connection.handle.send(&channel, data) {
                    tracing::debug!(target: "handler_flow", channel = %channel, error = %e, "Echo failed");
                }
            }
            MpxEvent::Closed { reason } => {
                tracing::debug!(
                    target: "handler_flow",
                    connection_id = %connection.handle.id(),
                    reason = %reason,
                    "MPX session closed"
                );
                break;
            }
            _ => {}
        }
    }
}

/// Everything the admin API and the run loop share.
pub struct EngineState {
    pub config: ArcSwap<SocketEngineConfig>,
    pub buffers: Arc<BufferPool>,
    /// Accepted connections, bounded by `pool.max_connections`.
    pub accepted: Arc<HandlerPool>,
    /// Outbound connections, cache mode.
    pub outgoing: Arc<HandlerPool>,
    pub registry: Arc<ConnectionRegistry>,
    pub mpx: Arc<MpxService>,
    pub tunnels: Arc<TunnelContext>,
    pub mpx_ports: PortSet,
    pub proxy_ports: PortSet,
    /// Chain length of the TLS identity checked at startup. TLS terminates
    /// in front of the engine, so only the check result is kept, never the key.
    pub tls_chain: Option<usize>,
    pub shutdown: Shutdown,
    pub started: Instant,
}

impl EngineState {
    /// Apply a new configuration to everything that supports live changes.
    pub fn apply_config(&self, config: SocketEngineConfig) {
        let handler_settings = config.handler_settings();
        self.accepted.set_settings(handler_settings.clone());
        self.outgoing.set_settings(handler_settings);

        self.mpx.endpoint.settings.store(Arc::new(endpoint_settings(&config)));
        self.mpx.configure(&config);
        match tunnel_settings(&config) {
            Ok(settings) => self.tunnels.settings.store(Arc::new(settings)),
            Err(e) => tracing::warn!(target: "exceptions", error = %e, "Proxy settings unchanged"),
        }

        let listener = config.listener_settings();
        let mpx_ports = if config.mpx.enabled { config.listener.ports.clone() } else { Vec::new() };
        let changes = self.mpx_ports.apply(&mpx_ports, &listener);
        tracing::info!(target: "program_flow", changes = ?changes, "MPX ports applied");
        let proxy_ports = if config.proxy.enabled { config.proxy.ports.clone() } else { Vec::new() };
        let changes = self.proxy_ports.apply(&proxy_ports, &listener);
        tracing::info!(target: "program_flow", changes = ?changes, "Proxy ports applied");

        if config.pool.max_connections != self.config.load().pool.max_connections {
            tracing::warn!(
                target: "exceptions",
                "pool.max_connections changes take effect after restart"
            );
        }
        self.config.store(Arc::new(config));
    }
}

fn endpoint_settings(config: &SocketEngineConfig) -> EndpointSettings {
    EndpointSettings {
        session: config.mpx.session_settings(Arc::new(CodecRegistry::new())),
        socket: config.socket_options(),
        connect_timeout: config.connect_timeout(),
    }
}

fn tunnel_settings(config: &SocketEngineConfig) -> Result<TunnelSettings, StartupError> {
    let upstream = config
        .proxy
        .upstream
        .parse()
        .map_err(|_| StartupError::Upstream(config.proxy.upstream.clone()))?;
    Ok(TunnelSettings {
        upstream,
        connect_timeout: config.connect_timeout(),
        inspect_http: config.proxy.inspect_http,
        max_header_size: config.proxy.max_header_size,
        socket: config.socket_options(),
    })
}

/// The assembled engine.
pub struct Engine {
    state: Arc<EngineState>,
    admin_addr: Option<SocketAddr>,
}

impl Engine {
    /// Construct every subsystem. No socket is bound yet.
    pub fn build(config: SocketEngineConfig) -> Result<Self, StartupError> {
        let shutdown = Shutdown::new();
        let buffers = BufferPool::new(config.pool.buffer_settings());
        let handler_settings = config.handler_settings();
        let accepted = HandlerPool::new(
            "accepted",
            config.pool.max_connections,
            Arc::clone(&buffers),
            handler_settings.clone(),
        );
        let outgoing = HandlerPool::cache("outgoing", Arc::clone(&buffers), handler_settings);
        let registry = ConnectionRegistry::new();

        let endpoint = Arc::new(MpxEndpoint::new(
            Arc::clone(&accepted),
            Arc::clone(&registry),
            shutdown.clone(),
            endpoint_settings(&config),
        ));
        let mpx = Arc::new(MpxService {
            endpoint,
            authenticator: RwLock::new(authenticator_for(&config)),
            app: RwLock::new(config.mpx.app),
        });

        let tunnels = Arc::new(TunnelContext {
            incoming: Arc::clone(&accepted),
            outgoing: Arc::clone(&outgoing),
            registry: Arc::clone(&registry),
            shutdown: shutdown.clone(),
            settings: ArcSwap::from_pointee(tunnel_settings(&config)?),
        });

        let tls_chain = if config.tls.enabled {
            let provider = FileCertificateProvider::new(&config.tls.cert_path, &config.tls.key_path);
            let identity = provider
                .provide(&CertificateRequest::default())
                .map_err(StartupError::Tls)?;
            Some(identity.certificates.len())
        } else {
            None
        };

        let mpx_acceptor = {
            let mpx = Arc::clone(&mpx);
            move |stream: TcpStream, peer: SocketAddr| mpx.accept(stream, peer)
        };
        let proxy_acceptor = {
            let tunnels = Arc::clone(&tunnels);
            move |stream: TcpStream, peer: SocketAddr| {
                let ctx = Arc::clone(&tunnels);
                tokio::spawn(async move {
                    if let Err(e) = run_tunnel(stream, peer, ctx).await {
                        tracing::warn!(target: "exceptions", peer = %peer, error = %e, "Tunnel failed");
                    }
                });
            }
        };

        let state = Arc::new(EngineState {
            mpx_ports: PortSet::new("mpx", Arc::new(mpx_acceptor), shutdown.clone()),
            proxy_ports: PortSet::new("proxy", Arc::new(proxy_acceptor), shutdown.clone()),
            config: ArcSwap::from_pointee(config),
            buffers,
            accepted,
            outgoing,
            registry,
            mpx,
            tunnels,
            tls_chain,
            shutdown,
            started: Instant::now(),
        });

        Ok(Self {
            state,
            admin_addr: None,
        })
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn shutdown(&self) -> Shutdown {
        self.state.shutdown.clone()
    }

    pub fn mpx_addrs(&self) -> Vec<SocketAddr> {
        self.state.mpx_ports.local_addrs()
    }

    pub fn proxy_addrs(&self) -> Vec<SocketAddr> {
        self.state.proxy_ports.local_addrs()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Bind ports, the admin API and metrics.
    pub async fn start(&mut self) -> Result<(), StartupError> {
        let config = self.state.config.load_full();
        let listener = config.listener_settings();
        let mut failed = Vec::new();

        if config.mpx.enabled {
            failed.extend(self.state.mpx_ports.apply(&config.listener.ports, &listener).failed);
        }
        if config.proxy.enabled {
            failed.extend(self.state.proxy_ports.apply(&config.proxy.ports, &listener).failed);
        }
        if !failed.is_empty() {
            self.state.mpx_ports.stop_all();
            self.state.proxy_ports.stop_all();
            return Err(StartupError::Bind(failed));
        }

        if config.observability.metrics_enabled {
            match config.observability.metrics_address.parse() {
                Ok(addr) => metrics::init_metrics(addr),
                Err(_) => tracing::error!(
                    target: "exceptions",
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                ),
            }
        }

        if config.admin.enabled {
            let listener = TcpListener::bind(&config.admin.bind_address)
                .await
                .map_err(StartupError::Admin)?;
            self.admin_addr = Some(listener.local_addr().map_err(StartupError::Admin)?);
            let router = admin::setup_admin_router(Arc::clone(&self.state));
            let shutdown = self.state.shutdown.clone();
            tokio::spawn(async move {
                let served = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.wait().await })
                    .await;
                if let Err(e) = served {
                    tracing::error!(target: "exceptions", error = %e, "Admin API stopped");
                }
            });
        }

        tracing::info!(
            target: "program_flow",
            mpx = ?self.mpx_addrs(),
            proxy = ?self.proxy_addrs(),
            admin = ?self.admin_addr,
            "Engine started"
        );
        Ok(())
    }

    /// Run until shutdown, applying config updates as they arrive.
    pub async fn serve(self, mut updates: Option<mpsc::UnboundedReceiver<SocketEngineConfig>>) {
        let state = self.state;
        let mut stop = state.shutdown.subscribe();
        let mut stats = tokio::time::interval(STATS_INTERVAL);

        while !state.shutdown.is_triggered() {
            tokio::select! {
                update = async {
                    match updates.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match update {
                    Some(config) => state.apply_config(config),
                    None => updates = None,
                },
                _ = stats.tick() => record_stats(&state),
                _ = stop.recv() => break,
            }
        }

        drain(&state).await;
    }

    /// `start` followed by `serve`.
    pub async fn run(
        mut self,
        updates: Option<mpsc::UnboundedReceiver<SocketEngineConfig>>,
    ) -> Result<(), StartupError> {
        self.start().await?;
        self.serve(updates).await;
        Ok(())
    }
}

fn record_stats(state: &EngineState) {
    let buffers = state.buffers.stats();
    metrics::set_buffer_outstanding(buffers.outstanding_bytes);
    let accepted = state.accepted.stats();
    tracing::debug!(
        target: "performance",
        connections = state.registry.active_count(),
        handlers_in_use = accepted.in_use,
        outstanding_bytes = buffers.outstanding_bytes,
        pooled_bytes = buffers.pooled_bytes,
        "Engine stats"
    );
}

async fn drain(state: &EngineState) {
    tracing::info!(
        target: "program_flow",
        live = state.registry.active_count(),
        "Shutting down, draining connections"
    );
    state.mpx_ports.stop_all();
    state.proxy_ports.stop_all();

    let grace = state.config.load().shutdown_grace();
    if !state.registry.wait_until_empty(grace).await {
        tracing::warn!(
            target: "exceptions",
            remaining = state.registry.active_count(),
            "Shutdown grace period elapsed with live connections"
        );
    }

    let disposed = state.accepted.drain() + state.outgoing.drain();
    let freed = state.buffers.clear();
    metrics::set_buffer_outstanding(state.buffers.outstanding_bytes());
    tracing::info!(target: "program_flow", disposed, freed, "Shutdown complete");
}
