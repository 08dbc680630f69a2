use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::buffer::BufferPoolStats;
use crate::handler::HandlerPoolStats;
use crate::lifecycle::startup::EngineState;
use crate::mpx::SessionEntry;
use crate::net::ConnectionSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub active_connections: usize,
    pub total_connections: u64,
    pub mpx_sessions: usize,
    pub mpx_ports: Vec<u16>,
    pub proxy_ports: Vec<u16>,
    pub tls: bool,
    pub tls_chain: Option<usize>,
}

#[derive(Serialize)]
pub struct PoolReport {
    pub buffers: BufferPoolStats,
    pub handlers: Vec<HandlerPoolStats>,
}

pub async fn get_status(State(state): State<Arc<EngineState>>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        active_connections: state.registry.active_count(),
        total_connections: state.registry.total_registered(),
        mpx_sessions: state.mpx.endpoint.sessions.len(),
        mpx_ports: state.mpx_ports.ports(),
        proxy_ports: state.proxy_ports.ports(),
        tls: state.tls_chain.is_some(),
        tls_chain: state.tls_chain,
    })
}

pub async fn get_pools(State(state): State<Arc<EngineState>>) -> Json<PoolReport> {
    Json(PoolReport {
        buffers: state.buffers.stats(),
        handlers: vec![state.accepted.stats(), state.outgoing.stats()],
    })
}

pub async fn get_sessions(State(state): State<Arc<EngineState>>) -> Json<Vec<SessionEntry>> {
    Json(state.mpx.endpoint.sessions.snapshot())
}

pub async fn get_connections(
    State(state): State<Arc<EngineState>>,
) -> Json<Vec<ConnectionSnapshot>> {
    Json(state.registry.snapshot())
}
