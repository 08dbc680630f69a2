//! Runtime glue between an [`MpxSession`] and a driven socket.
//!
//! # Data Flow
//! ```text
//! driver ──locked──→ MpxProtocol → session.receive / poll_transmit
//! app    → MpxHandle → session op → command notify → driver → on_resume
//! session events → after_completion → mpsc → app
//! ```
//!
//! # Design Decisions
//! - Lock order is handler first, then session. `MpxHandle` operations that
//!   only touch the session never take the handler lock
//! - Events are forwarded outside the handler lock

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result, TimeoutKind};
use crate::handler::{
    drive, CloseReason, ConnectionHandler, DriveOutcome, HandlerPool, HandlerSignals, Protocol,
    SharedHandler,
};
use crate::lifecycle::shutdown::Shutdown;
use crate::mpx::server::Authenticator;
use crate::mpx::session::{IdleDecision, MpxEvent, MpxSession, SessionSettings, SessionSnapshot, SessionState};
use crate::mpx::version::ProtocolVersion;
use crate::net::connection::{ConnectionId, ConnectionKind, ConnectionRegistry};
use crate::net::listener::{tune_stream, SocketOptions};

struct MpxShared {
    id: ConnectionId,
    peer: SocketAddr,
    handler: SharedHandler,
    signals: Arc<HandlerSignals>,
    session: Mutex<MpxSession>,
    events: mpsc::UnboundedSender<MpxEvent>,
}

impl MpxShared {
    fn forward_events(&self) {
        let events = self.session.lock().drain_events();
        for event in events {
            // A dropped receiver only means nobody is listening.
            let _ = self.events.send(event);
        }
    }
}

/// Application handle to one multiplexed connection.
#[derive(Clone)]
pub struct MpxHandle {
    shared: Arc<MpxShared>,
}

impl MpxHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn state(&self) -> SessionState {
        self.shared.session.lock().state()
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.shared.session.lock().negotiated_version()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.session.lock().snapshot()
    }

    fn with_session<T>(&self, op: impl FnOnce(&mut MpxSession) -> Result<T>) -> Result<T> {
        let out = op(&mut self.shared.session.lock())?;
        self.shared.signals.command.notify_one();
        Ok(out)
    }

    pub fn request_channel(&self, name: &str) -> Result<()> {
        self.with_session(|s| s.request_channel(name))
    }

    pub fn remove_channel(&self, name: &str) -> Result<()> {
        self.with_session(|s| s.remove_channel(name))
    }

    pub fn send(&self, channel: &str, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.with_session(|s| s.send(channel, data))
    }

    /// Cancel the channel's current outgoing transfer.
    pub fn cancel(&self, channel: &str) -> Result<bool> {
        self.with_session(|s| s.cancel(channel))
    }

    pub fn idle_decision(&self) -> IdleDecision {
        let h = self.shared.handler.lock();
        if h.id() != self.shared.id {
            return IdleDecision::Continue;
        }
        let session = self.shared.session.lock();
        session.idle_decision(h.rx().is_empty(), h.tx().is_empty())
    }

    /// Ask the driver to hand the socket back. Granted only when the
    /// connection is idle; the task then ends with
    /// [`DriveOutcome::Captured`].
    pub fn try_capture(&self) -> bool {
        let mut h = self.shared.handler.lock();
        if h.id() != self.shared.id {
            return false;
        }
        let decision = {
            let session = self.shared.session.lock();
            session.idle_decision(h.rx().is_empty(), h.tx().is_empty())
        };
        if decision == IdleDecision::AllowCapture {
            h.request_capture();
            true
        } else {
            false
        }
    }

    /// Close gracefully once queued bytes are written.
    pub fn close(&self) {
        let mut h = self.shared.handler.lock();
        // The handler may already serve another connection.
        if h.id() == self.shared.id {
            h.close();
        }
    }
}

impl std::fmt::Debug for MpxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpxHandle")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .finish()
    }
}

/// Live sessions by connection, for diagnostics.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    sessions: DashMap<ConnectionId, MpxHandle>,
}

/// One row of [`SessionDirectory::snapshot`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionEntry {
    pub id: u64,
    pub peer: String,
    #[serde(flatten)]
    pub session: SessionSnapshot,
}

impl SessionDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, handle: MpxHandle) {
        self.sessions.insert(handle.id(), handle);
    }

    fn remove(&self, id: ConnectionId) {
        self.sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: ConnectionId) -> Option<MpxHandle> {
        self.sessions.get(&id).map(|r| r.value().clone())
    }

    pub fn snapshot(&self) -> Vec<SessionEntry> {
        let handles: Vec<MpxHandle> = self.sessions.iter().map(|r| r.value().clone()).collect();
        let mut list: Vec<SessionEntry> = handles
            .into_iter()
            .map(|h| SessionEntry {
                id: h.id().as_u64(),
                peer: h.peer().to_string(),
                session: h.snapshot(),
            })
            .collect();
        list.sort_by_key(|e| e.id);
        list
    }
}

/// [`Protocol`] implementation running an MPX session over a handler.
pub struct MpxProtocol {
    shared: Arc<MpxShared>,
    directory: Arc<SessionDirectory>,
}

impl MpxProtocol {
    fn pump(&self, handler: &mut ConnectionHandler) -> Result<()> {
        let mut session = self.shared.session.lock();
        session.poll_transmit(handler.tx_mut())?;
        if session.state() == SessionState::Disconnecting {
            handler.close();
        }
        Ok(())
    }
}

impl Protocol for MpxProtocol {
    fn on_connected(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        handler.arm_header_deadline(Instant::now());
        self.pump(handler)
    }

    fn on_received(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        let received = {
            let mut session = self.shared.session.lock();
            let received = session.receive(handler.rx_mut());
            if session.state() == SessionState::Multiplexed && handler.header_pending() {
                handler.header_complete(Instant::now());
            }
            received
        };
        match received {
            // Drain our greeting so the peer records the mismatch too.
            Err(EngineError::ProtocolVersionMismatch(_)) => self.pump(handler),
            Err(e) => Err(e),
            Ok(()) => self.pump(handler),
        }
    }

    fn on_drained(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        self.pump(handler)
    }

    fn on_resume(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        self.pump(handler)
    }

    fn after_completion(&mut self) {
        self.shared.forward_events();
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        self.shared.session.lock().close(&reason.to_string());
        self.shared.forward_events();
        self.directory.remove(self.shared.id);
    }
}

/// Shared parameters for client and server sessions, swappable on reload.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub session: SessionSettings,
    pub socket: SocketOptions,
    pub connect_timeout: Duration,
}

/// Everything needed to start MPX connections.
pub struct MpxEndpoint {
    pub pool: Arc<HandlerPool>,
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionDirectory>,
    pub shutdown: Shutdown,
    pub settings: ArcSwap<EndpointSettings>,
}

impl MpxEndpoint {
    pub fn new(
        pool: Arc<HandlerPool>,
        registry: Arc<ConnectionRegistry>,
        shutdown: Shutdown,
        settings: EndpointSettings,
    ) -> Self {
        Self {
            pool,
            registry,
            sessions: SessionDirectory::new(),
            shutdown,
            settings: ArcSwap::from_pointee(settings),
        }
    }
}

/// A running MPX connection: the app handle, its event stream and the
/// driver task.
pub struct MpxConnection {
    pub handle: MpxHandle,
    pub events: mpsc::UnboundedReceiver<MpxEvent>,
    pub task: JoinHandle<DriveOutcome>,
}

impl MpxConnection {
    /// Wait for the handshake to finish.
    pub async fn wait_multiplexed(&mut self) -> Result<ProtocolVersion> {
        while let Some(event) = self.events.recv().await {
            match event {
                MpxEvent::Multiplexed { version } => return Ok(version),
                MpxEvent::Closed { reason } => return Err(self.handshake_error(reason)),
                _ => {}
            }
        }
        Err(self.handshake_error("event stream ended".to_string()))
    }

    fn handshake_error(&self, reason: String) -> EngineError {
        let session = self.handle.shared.session.lock();
        if let Some(mismatch) = session.mismatch() {
            return EngineError::ProtocolVersionMismatch(mismatch.clone());
        }
        if let Some(rejected) = session.rejection() {
            return EngineError::AuthenticationFailure(rejected.to_string());
        }
        if reason == CloseReason::Timeout(TimeoutKind::HeaderRead).to_string() {
            return EngineError::Timeout(TimeoutKind::HeaderRead);
        }
        EngineError::ConnectionFault(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            session.failure().map(str::to_string).unwrap_or(reason),
        ))
    }

    /// Next event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<MpxEvent> {
        self.events.recv().await
    }

    /// Wait for the driver task.
    pub async fn finished(self) -> Option<DriveOutcome> {
        self.task.await.ok()
    }
}

fn start(
    endpoint: &MpxEndpoint,
    stream: TcpStream,
    peer: SocketAddr,
    kind: ConnectionKind,
    session: MpxSession,
    lease: crate::handler::HandlerLease,
) -> MpxConnection {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(MpxShared {
        id: lease.id(),
        peer,
        handler: lease.shared(),
        signals: lease.lock().signals(),
        session: Mutex::new(session),
        events: tx,
    });
    let handle = MpxHandle {
        shared: Arc::clone(&shared),
    };
    endpoint.sessions.insert(handle.clone());

    let registration = endpoint.registry.register(lease.id(), kind, peer);
    let protocol = MpxProtocol {
        shared,
        directory: Arc::clone(&endpoint.sessions),
    };
    let shutdown = endpoint.shutdown.subscribe();
    let directory = Arc::clone(&endpoint.sessions);
    let task = tokio::spawn(async move {
        let id = lease.id();
        let outcome = drive(stream, lease.shared(), protocol, shutdown).await;
        directory.remove(id);
        drop(registration);
        drop(lease);
        outcome
    });

    MpxConnection {
        handle,
        events: rx,
        task,
    }
}

/// Open a client session to `addr`, presenting `token`.
pub async fn connect(
    endpoint: &MpxEndpoint,
    addr: SocketAddr,
    token: impl Into<Vec<u8>>,
) -> Result<MpxConnection> {
    let settings = endpoint.settings.load_full();
    let lease = endpoint.pool.pop().ok_or(EngineError::PoolExhausted {
        max: endpoint.pool.stats().max,
    })?;
    lease.lock().begin_connect(addr)?;

    let stream = match tokio::time::timeout(settings.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            lease.lock().on_error(&e);
            return Err(e.into());
        }
        Err(_) => {
            let err = EngineError::Timeout(TimeoutKind::Connect);
            lease.lock().fail(&err);
            return Err(err);
        }
    };
    tune_stream(&stream, &settings.socket)?;
    lease.lock().on_connected(addr, Instant::now())?;

    let session = MpxSession::client(settings.session.clone(), token);
    tracing::debug!(
        target: "socket_flow",
        connection_id = %lease.id(),
        peer = %addr,
        "MPX client connected"
    );
    Ok(start(endpoint, stream, addr, ConnectionKind::MpxClient, session, lease))
}

/// Serve an accepted socket as the server side of a session.
pub fn serve_connection(
    endpoint: &MpxEndpoint,
    stream: TcpStream,
    peer: SocketAddr,
    authenticator: Arc<dyn Authenticator>,
) -> Result<MpxConnection> {
    let settings = endpoint.settings.load_full();
    let lease = endpoint.pool.pop().ok_or(EngineError::PoolExhausted {
        max: endpoint.pool.stats().max,
    })?;
    lease.lock().on_accepted(peer, Instant::now())?;
    let session = MpxSession::server(settings.session.clone(), authenticator);
    Ok(start(endpoint, stream, peer, ConnectionKind::MpxServer, session, lease))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, BufferPoolSettings};
    use crate::buffer::DynamicBuffer;
    use crate::handler::{ConnectionState, HandlerSettings, NextAction};
    use crate::mpx::server::SharedSecret;
    use crate::mpx::version::VersionPolicy;
    use tokio::net::TcpListener;

    fn session_settings(version: &str, minimum: &str) -> SessionSettings {
        SessionSettings {
            version: VersionPolicy {
                version: version.parse().unwrap(),
                minimum: minimum.parse().unwrap(),
            },
            ..SessionSettings::default()
        }
    }

    #[test]
    fn version_mismatch_keeps_greeting_queued() {
        let buffers = BufferPool::new(BufferPoolSettings::default());
        let pool = HandlerPool::new("mpx", 2, Arc::clone(&buffers), HandlerSettings::default());
        let lease = pool.pop().unwrap();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        lease.lock().on_accepted(peer, Instant::now()).unwrap();

        let (events, _rx) = mpsc::unbounded_channel();
        let server = MpxSession::server(
            session_settings("2.0", "2.1"),
            Arc::new(SharedSecret::new("tok")),
        );
        let shared = Arc::new(MpxShared {
            id: lease.id(),
            peer,
            handler: lease.shared(),
            signals: lease.lock().signals(),
            session: Mutex::new(server),
            events,
        });
        let mut protocol = MpxProtocol {
            shared: Arc::clone(&shared),
            directory: SessionDirectory::new(),
        };

        let mut h = lease.lock();
        protocol.on_connected(&mut h).unwrap();
        let greeting = h.tx().count();
        assert!(greeting > 0);

        // The client's greeting arrives before ours was written.
        let mut client = MpxSession::client(session_settings("2.1", "2.0"), "tok");
        let mut wire = DynamicBuffer::new(Arc::clone(&buffers));
        client.poll_transmit(&mut wire).unwrap();
        let bytes = wire.consume(wire.count());
        assert!(h.begin_receive());
        h.on_received(&bytes, Instant::now()).unwrap();
        protocol.on_received(&mut h).unwrap();

        assert_eq!(h.state(), ConnectionState::Disconnecting);
        assert_eq!(h.next_action(), NextAction::Continue);
        assert!(h.tx().count() >= greeting);
        let session = shared.session.lock();
        assert_eq!(session.state(), SessionState::Disconnecting);
        let mismatch = session.mismatch().unwrap();
        assert_eq!(mismatch.local_minimum, ProtocolVersion::new(2, 1));
        assert_eq!(mismatch.remote_minimum, ProtocolVersion::new(2, 0));
    }

    fn endpoint(version: &str, minimum: &str) -> MpxEndpoint {
        let buffers = BufferPool::new(BufferPoolSettings::default());
        let pool = HandlerPool::new("mpx", 8, buffers, HandlerSettings::default());
        MpxEndpoint::new(
            pool,
            ConnectionRegistry::new(),
            Shutdown::new(),
            EndpointSettings {
                session: SessionSettings {
                    version: VersionPolicy {
                        version: version.parse().unwrap(),
                        minimum: minimum.parse().unwrap(),
                    },
                    ..SessionSettings::default()
                },
                socket: SocketOptions::default(),
                connect_timeout: Duration::from_secs(2),
            },
        )
    }

    async fn accept_one(listener: TcpListener, server: Arc<MpxEndpoint>) -> MpxConnection {
        let (stream, peer) = listener.accept().await.unwrap();
        serve_connection(&server, stream, peer, Arc::new(SharedSecret::new("tok"))).unwrap()
    }

    #[tokio::test]
    async fn client_and_server_exchange_a_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(endpoint("1.2", "1.0"));
        let accepting = tokio::spawn(accept_one(listener, Arc::clone(&server)));

        let client_end = endpoint("1.1", "1.0");
        let mut client = connect(&client_end, addr, "tok").await.unwrap();
        let mut served = accepting.await.unwrap();

        assert_eq!(client.wait_multiplexed().await.unwrap(), ProtocolVersion::new(1, 1));
        assert_eq!(served.wait_multiplexed().await.unwrap(), ProtocolVersion::new(1, 1));

        client.handle.request_channel("chat").unwrap();
        loop {
            if let Some(MpxEvent::ChannelAdded { channel, .. }) = client.next_event().await {
                assert_eq!(channel, "chat");
                break;
            }
        }
        client.handle.send("chat", Bytes::from_static(b"hello")).unwrap();

        loop {
            match served.next_event().await {
                Some(MpxEvent::Received { channel, data }) => {
                    assert_eq!(channel, "chat");
                    assert_eq!(&data[..], b"hello");
                    break;
                }
                Some(_) => continue,
                None => panic!("server stream ended"),
            }
        }
        assert_eq!(server.sessions.len(), 1);

        client.handle.close();
        let outcome = client.finished().await.unwrap();
        assert!(outcome.close_reason().is_some());
    }

    #[tokio::test]
    async fn mismatch_surfaces_to_the_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(endpoint("2.0", "2.1"));
        let accepting = tokio::spawn(accept_one(listener, Arc::clone(&server)));

        let client_end = endpoint("2.1", "2.0");
        let mut client = connect(&client_end, addr, "tok").await.unwrap();
        let _served = accepting.await.unwrap();

        let err = client.wait_multiplexed().await.unwrap_err();
        match err {
            EngineError::ProtocolVersionMismatch(m) => {
                assert_eq!(m.local_minimum, ProtocolVersion::new(2, 0));
                assert_eq!(m.remote_minimum, ProtocolVersion::new(2, 1));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn idle_session_can_be_captured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(endpoint("1.0", "1.0"));
        let accepting = tokio::spawn(accept_one(listener, Arc::clone(&server)));

        let client_end = endpoint("1.0", "1.0");
        let mut client = connect(&client_end, addr, "tok").await.unwrap();
        let _served = accepting.await.unwrap();
        client.wait_multiplexed().await.unwrap();

        assert_eq!(client.handle.idle_decision(), IdleDecision::AllowCapture);
        assert!(client.handle.try_capture());
        let outcome = client.finished().await.unwrap();
        assert!(matches!(outcome, DriveOutcome::Captured(_)));
        assert_eq!(client_end.pool.stats().in_use, 0);
    }
}
