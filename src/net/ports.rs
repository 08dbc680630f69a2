//! Hot-reloadable set of listening ports.
//!
//! `PortSet::apply` diffs the wanted ports against the running ones: new
//! ports are bound and get an accept task, dropped ports have their task
//! stopped. Connections already accepted on a dropped port keep running.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::Shutdown;
use crate::net::listener::{Listener, ListenerError, ListenerSettings};

/// Takes ownership of accepted sockets.
pub trait ConnectionAcceptor: Send + Sync + 'static {
    fn accept(&self, stream: TcpStream, peer: SocketAddr);
}

impl<F> ConnectionAcceptor for F
where
    F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
{
    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        self(stream, peer)
    }
}

struct RunningPort {
    local: SocketAddr,
    task: JoinHandle<()>,
}

/// What one `apply` call changed.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PortChanges {
    pub added: Vec<u16>,
    pub removed: Vec<u16>,
    pub failed: Vec<(u16, String)>,
}

/// Ports served by one acceptor.
pub struct PortSet {
    name: &'static str,
    acceptor: Arc<dyn ConnectionAcceptor>,
    shutdown: Shutdown,
    running: Mutex<BTreeMap<u16, RunningPort>>,
}

impl PortSet {
    pub fn new(name: &'static str, acceptor: Arc<dyn ConnectionAcceptor>, shutdown: Shutdown) -> Self {
        Self {
            name,
            acceptor,
            shutdown,
            running: Mutex::new(BTreeMap::new()),
        }
    }

    /// Converge on `ports`. A port that fails to bind is reported and
    /// skipped; the others are still applied. Must run inside a tokio
    /// runtime.
    pub fn apply(&self, ports: &[u16], settings: &ListenerSettings) -> PortChanges {
        let wanted: BTreeSet<u16> = ports.iter().copied().collect();
        let mut running = self.running.lock();
        let mut changes = PortChanges::default();

        let stale: Vec<u16> = running
            .keys()
            .copied()
            .filter(|p| !wanted.contains(p))
            .collect();
        for port in stale {
            if let Some(entry) = running.remove(&port) {
                entry.task.abort();
                tracing::info!(target: "program_flow", set = self.name, port, "Port stopped");
                changes.removed.push(port);
            }
        }

        for port in wanted {
            if running.contains_key(&port) {
                continue;
            }
            match Listener::bind(port, settings.clone()) {
                Ok(listener) => {
                    let local = match listener.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            changes.failed.push((port, e.to_string()));
                            continue;
                        }
                    };
                    let task = tokio::spawn(accept_loop(
                        self.name,
                        listener,
                        Arc::clone(&self.acceptor),
                        self.shutdown.clone(),
                    ));
                    running.insert(port, RunningPort { local, task });
                    changes.added.push(port);
                }
                Err(e) => {
                    tracing::error!(target: "exceptions", set = self.name, port, error = %e, "Port bind failed");
                    changes.failed.push((port, e.to_string()));
                }
            }
        }
        changes
    }

    /// Bound addresses, keyed by configured port.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running.lock().values().map(|p| p.local).collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.running.lock().keys().copied().collect()
    }

    /// Stop every accept task.
    pub fn stop_all(&self) {
        let mut running = self.running.lock();
        for (_, entry) in std::mem::take(&mut *running) {
            entry.task.abort();
        }
    }
}

impl Drop for PortSet {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn accept_loop(
    name: &'static str,
    listener: Listener,
    acceptor: Arc<dyn ConnectionAcceptor>,
    shutdown: Shutdown,
) {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => acceptor.accept(stream, peer),
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(target: "exceptions", set = name, error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => {
                    tracing::error!(target: "exceptions", set = name, error = %e, "Listener failed");
                    return;
                }
            },
            _ = stop.recv() => {
                tracing::debug!(target: "program_flow", set = name, port = listener.port(), "Accept loop stopped");
                return;
            }
        }
    }
}
