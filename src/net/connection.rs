//! Connection identity and the process-scoped connection registry.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Record live connections (kind, peer, age) for diagnostics
//! - Let shutdown wait until every registered connection is gone
//!
//! # Design Decisions
//! - The registry is an explicit object shared by `Arc`, never a global
//! - Registration is a guard; dropping it removes the entry

use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a registered connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Server side of a multiplexed connection.
    MpxServer,
    /// Client side of a multiplexed connection.
    MpxClient,
    /// Client-facing side of a proxy tunnel.
    ProxyIncoming,
    /// Upstream-facing side of a proxy tunnel.
    ProxyOutgoing,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::MpxServer => "mpx_server",
            ConnectionKind::MpxClient => "mpx_client",
            ConnectionKind::ProxyIncoming => "proxy_incoming",
            ConnectionKind::ProxyOutgoing => "proxy_outgoing",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    kind: ConnectionKind,
    peer: SocketAddr,
    opened: Instant,
    opened_unix: u64,
}

/// Serializable view of one registered connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub kind: ConnectionKind,
    pub peer: String,
    pub opened_at_unix: u64,
    pub age_ms: u128,
}

/// Live connections, keyed by ID.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Entry>,
    total: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a connection. The entry lives as long as the returned guard.
    pub fn register(
        self: &Arc<Self>,
        id: ConnectionId,
        kind: ConnectionKind,
        peer: SocketAddr,
    ) -> RegistrationGuard {
        let opened_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.entries.insert(
            id,
            Entry {
                kind,
                peer,
                opened: Instant::now(),
                opened_unix,
            },
        );
        self.total.fetch_add(1, Ordering::Relaxed);
        crate::observability::metrics::record_connection_opened(kind.as_str());

        RegistrationGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Current count of live connections.
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Connections registered since start.
    pub fn total_registered(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Snapshot of every live connection, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut list: Vec<ConnectionSnapshot> = self
            .entries
            .iter()
            .map(|r| ConnectionSnapshot {
                id: r.key().as_u64(),
                kind: r.value().kind,
                peer: r.value().peer.to_string(),
                opened_at_unix: r.value().opened_unix,
                age_ms: r.value().opened.elapsed().as_millis(),
            })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    /// Wait until no connection is registered, or `grace` elapses.
    /// Returns true when the registry drained in time.
    pub async fn wait_until_empty(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while !self.entries.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

/// Keeps a registry entry alive. Removes it on drop.
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl RegistrationGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.entries.remove(&self.id);
        tracing::trace!(target: "socket_flow", connection_id = %self.id, "Connection unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn registry_counts_guards() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.active_count(), 0);

        let g1 = registry.register(ConnectionId::new(), ConnectionKind::MpxServer, peer());
        let g2 = registry.register(ConnectionId::new(), ConnectionKind::ProxyIncoming, peer());
        assert_eq!(registry.active_count(), 2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].id, g1.id().as_u64());
        assert_eq!(snapshot[1].kind, ConnectionKind::ProxyIncoming);

        drop(g1);
        assert_eq!(registry.active_count(), 1);
        drop(g2);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.total_registered(), 2);
    }

    #[tokio::test]
    async fn wait_until_empty_times_out_with_live_entries() {
        let registry = ConnectionRegistry::new();
        let _guard = registry.register(ConnectionId::new(), ConnectionKind::MpxClient, peer());
        assert!(!registry.wait_until_empty(Duration::from_millis(60)).await);
    }
}
