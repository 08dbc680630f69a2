//! Per-connection state machine.
//!
//! # Responsibilities
//! - Own the receive and transmit buffers of one connection
//! - Apply exactly one transition per I/O completion or command
//! - Decide the next action (continue, reset, dispose)
//! - Enforce header-read and keep-alive idle deadlines
//!
//! # Design Decisions
//! - No socket here: the async driver performs I/O and reports completions
//! - Deadlines compare `Instant`s; nothing in this type blocks or sleeps
//! - Completions without a matching operation in flight are rejected

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Notify;

use crate::buffer::{BufferObserver, BufferPool, DynamicBuffer};
use crate::error::{EngineError, Result, TimeoutKind};
use crate::handler::state::{ConnectionState, HandlerSettings, NextAction};
use crate::net::connection::ConnectionId;

/// Wake-ups the driver waits on.
#[derive(Debug, Default)]
pub struct HandlerSignals {
    /// Data was queued on the transmit buffer (or a close needs draining).
    pub tx_ready: Notify,
    /// The receive buffer fell below its low-water mark.
    pub rx_drained: Notify,
    /// A command (close, reset, capture) was issued from outside the driver.
    pub command: Notify,
}

/// The other handler of a proxy pair.
#[derive(Clone)]
pub struct Partner {
    id: ConnectionId,
    handler: Weak<Mutex<ConnectionHandler>>,
}

impl Partner {
    pub(crate) fn new(id: ConnectionId, handler: &Arc<Mutex<ConnectionHandler>>) -> Self {
        Self {
            id,
            handler: Arc::downgrade(handler),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Reset the partner if it is still paired with `former`.
    ///
    /// Call without holding `former`'s lock. Returns whether a reset happened.
    pub fn reset_from(self, former: ConnectionId) -> bool {
        let Some(handler) = self.handler.upgrade() else {
            return false;
        };
        let mut h = handler.lock();
        if h.paired_with() != Some(former) {
            return false;
        }
        tracing::debug!(
            target: "handler_flow",
            connection_id = %self.id,
            partner = %former,
            "Partner reset"
        );
        h.reset();
        true
    }
}

impl std::fmt::Debug for Partner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Partner").field(&self.id).finish()
    }
}

struct TxObserver(Arc<HandlerSignals>);

impl BufferObserver for TxObserver {
    fn data_added(&self, _added: usize, _available: usize) {
        self.0.tx_ready.notify_one();
    }
}

struct RxObserver(Arc<HandlerSignals>);

impl BufferObserver for RxObserver {
    fn drained(&self) {
        self.0.rx_drained.notify_one();
    }
}

/// State machine for one connection.
pub struct ConnectionHandler {
    id: ConnectionId,
    state: ConnectionState,
    next_action: NextAction,
    rx: DynamicBuffer,
    tx: DynamicBuffer,
    settings: HandlerSettings,
    signals: Arc<HandlerSignals>,
    peer: Option<SocketAddr>,
    paired_with: Option<Partner>,
    receive_pending: bool,
    send_pending: bool,
    header_deadline: Option<Instant>,
    last_activity: Instant,
    capture_requested: bool,
    last_error: Option<String>,
    bytes_received: u64,
    bytes_sent: u64,
}

impl ConnectionHandler {
    /// Create an idle handler drawing buffer segments from `buffers`.
    pub fn new(buffers: Arc<BufferPool>, settings: HandlerSettings) -> Self {
        let signals = Arc::new(HandlerSignals::default());
        let mut handler = Self {
            id: ConnectionId::new(),
            state: ConnectionState::Idle,
            next_action: NextAction::Continue,
            rx: DynamicBuffer::new(Arc::clone(&buffers)),
            tx: DynamicBuffer::new(buffers),
            settings,
            signals: Arc::clone(&signals),
            peer: None,
            paired_with: None,
            receive_pending: false,
            send_pending: false,
            header_deadline: None,
            last_activity: Instant::now(),
            capture_requested: false,
            last_error: None,
            bytes_received: 0,
            bytes_sent: 0,
        };
        handler.install_observers();
        handler
    }

    /// Prepare a pooled handler for a new connection.
    pub(crate) fn recycle(&mut self, settings: HandlerSettings) {
        self.reset();
        self.id = ConnectionId::new();
        self.settings = settings;
        self.signals = Arc::new(HandlerSignals::default());
        self.install_observers();
        self.peer = None;
        self.last_error = None;
        self.bytes_received = 0;
        self.bytes_sent = 0;
        self.last_activity = Instant::now();
    }

    fn install_observers(&mut self) {
        self.tx
            .set_observer(Some(Arc::new(TxObserver(Arc::clone(&self.signals)))));
        self.rx
            .set_observer(Some(Arc::new(RxObserver(Arc::clone(&self.signals)))));
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn next_action(&self) -> NextAction {
        self.next_action
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The handler on the other side of a proxy tunnel, if any.
    pub fn paired_with(&self) -> Option<ConnectionId> {
        self.paired_with.as_ref().map(Partner::id)
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    pub fn signals(&self) -> Arc<HandlerSignals> {
        Arc::clone(&self.signals)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn rx(&self) -> &DynamicBuffer {
        &self.rx
    }

    pub fn rx_mut(&mut self) -> &mut DynamicBuffer {
        &mut self.rx
    }

    pub fn tx(&self) -> &DynamicBuffer {
        &self.tx
    }

    /// Transmit buffer. Appending wakes the driver's write loop.
    pub fn tx_mut(&mut self) -> &mut DynamicBuffer {
        &mut self.tx
    }

    /// Queue bytes for transmission.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if !(self.state.is_active() || self.state == ConnectionState::Connecting) {
            return Err(self.invalid("queue data"));
        }
        self.tx.append(data)?;
        Ok(())
    }

    // --- Connection establishment ---

    /// Start an outbound connect.
    pub fn begin_connect(&mut self, addr: SocketAddr) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(self.invalid("connect"));
        }
        self.peer = Some(addr);
        self.state = ConnectionState::Connecting;
        self.next_action = NextAction::Continue;
        Ok(())
    }

    /// Outbound connect completed.
    pub fn on_connected(&mut self, peer: SocketAddr, now: Instant) -> Result<NextAction> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid("complete connect"));
        }
        self.establish(peer, now);
        Ok(self.next_action)
    }

    /// Inbound accept completed.
    pub fn on_accepted(&mut self, peer: SocketAddr, now: Instant) -> Result<NextAction> {
        if self.state != ConnectionState::Idle {
            return Err(self.invalid("accept"));
        }
        self.establish(peer, now);
        Ok(self.next_action)
    }

    fn establish(&mut self, peer: SocketAddr, now: Instant) {
        self.peer = Some(peer);
        self.state = ConnectionState::Connected;
        self.next_action = NextAction::Continue;
        self.last_activity = now;
        tracing::trace!(
            target: "handler_flow",
            connection_id = %self.id,
            peer = %peer,
            "Handler connected"
        );
    }

    // --- Receive side ---

    /// Issue a receive. Returns false when reads must not be issued now
    /// (one already in flight, back-pressure, or the connection is closing).
    pub fn begin_receive(&mut self) -> bool {
        if !self.state.is_active() || self.receive_pending {
            return false;
        }
        if self.state == ConnectionState::ReceivingBlocking {
            if self.rx.count() > self.settings.rx_low_water {
                return false;
            }
        } else if self.rx.count() >= self.settings.rx_high_water {
            self.state = ConnectionState::ReceivingBlocking;
            return false;
        }
        self.receive_pending = true;
        self.state = ConnectionState::Receiving;
        true
    }

    /// A receive completed with `data` (empty means the peer closed).
    pub fn on_received(&mut self, data: &[u8], now: Instant) -> Result<NextAction> {
        if !self.receive_pending {
            return Err(self.invalid("complete receive"));
        }
        self.receive_pending = false;

        if data.is_empty() {
            tracing::debug!(
                target: "socket_flow",
                connection_id = %self.id,
                "Peer closed the connection"
            );
            self.enter_disconnecting(NextAction::Reset);
            return Ok(self.next_action);
        }

        self.rx.append(data)?;
        self.bytes_received += data.len() as u64;
        self.last_activity = now;
        self.state = if self.rx.count() >= self.settings.rx_high_water {
            ConnectionState::ReceivingBlocking
        } else {
            ConnectionState::ReceivingIdle
        };
        Ok(self.next_action)
    }

    /// Leave `ReceivingBlocking` once the protocol consumed enough of rx.
    /// Returns true when reads may resume.
    pub fn update_backpressure(&mut self) -> bool {
        if self.state == ConnectionState::ReceivingBlocking
            && self.rx.count() <= self.settings.rx_low_water
        {
            self.state = ConnectionState::ReceivingIdle;
            self.signals.rx_drained.notify_one();
            return true;
        }
        false
    }

    // --- Send side ---

    /// Issue a send. Returns the chunk to write, or `None` when nothing is
    /// queued (or a send is already in flight).
    pub fn begin_send(&mut self) -> Option<Bytes> {
        let draining = self.state == ConnectionState::Disconnecting;
        if !(self.state.is_active() || draining) || self.send_pending {
            return None;
        }
        if self.tx.is_empty() {
            if !draining {
                self.state = ConnectionState::SendingIdle;
            }
            return None;
        }
        self.send_pending = true;
        if !draining {
            self.state = ConnectionState::Sending;
        }
        Some(self.tx.front_chunk(self.settings.send_chunk))
    }

    /// A send completed after writing `written` bytes.
    pub fn on_sent(&mut self, written: usize, now: Instant) -> Result<NextAction> {
        if !self.send_pending {
            return Err(self.invalid("complete send"));
        }
        self.send_pending = false;

        if written == 0 {
            self.enter_disconnecting(NextAction::Reset);
            return Ok(self.next_action);
        }

        self.tx.discard(written);
        self.bytes_sent += written as u64;
        self.last_activity = now;

        if self.state == ConnectionState::Disconnecting {
            if self.tx.is_empty() {
                self.next_action = NextAction::Reset;
            }
        } else if self.tx.is_empty() {
            self.state = ConnectionState::SendingIdle;
        } else {
            self.state = ConnectionState::Sending;
        }
        Ok(self.next_action)
    }

    // --- Failures and commands ---

    /// A socket operation failed.
    pub fn on_error(&mut self, error: &std::io::Error) -> NextAction {
        tracing::debug!(
            target: "socket_flow",
            connection_id = %self.id,
            error = %error,
            "Socket error"
        );
        self.last_error = Some(error.to_string());
        self.enter_disconnecting(NextAction::Reset);
        self.next_action
    }

    /// A protocol layer rejected the connection.
    pub fn fail(&mut self, error: &EngineError) -> NextAction {
        tracing::debug!(
            target: "handler_flow",
            connection_id = %self.id,
            error = %error,
            "Connection failed"
        );
        self.last_error = Some(error.to_string());
        self.enter_disconnecting(NextAction::Reset);
        self.next_action
    }

    /// Graceful close: stop reading, let queued data drain, then reset.
    pub fn close(&mut self) {
        if !self.state.is_live() {
            return;
        }
        let action = if self.tx.is_empty() || self.state == ConnectionState::Connecting {
            NextAction::Reset
        } else {
            NextAction::Continue
        };
        self.enter_disconnecting(action);
        self.signals.command.notify_one();
        self.signals.tx_ready.notify_one();
    }

    /// Ask the driver to hand the socket to the caller instead of closing it.
    pub fn request_capture(&mut self) {
        self.capture_requested = true;
        self.signals.command.notify_one();
    }

    /// Consume a pending capture request.
    pub fn take_capture_request(&mut self) -> bool {
        std::mem::take(&mut self.capture_requested)
    }

    fn enter_disconnecting(&mut self, action: NextAction) {
        if self.state != ConnectionState::Disconnecting {
            tracing::trace!(
                target: "handler_flow",
                connection_id = %self.id,
                from = %self.state,
                "Handler disconnecting"
            );
        }
        self.state = ConnectionState::Disconnecting;
        self.receive_pending = false;
        self.header_deadline = None;
        self.next_action = action;
    }

    /// Drop buffered data, clear the pairing and return to `Idle`.
    /// Returns the former partner so the caller can cascade with
    /// [`Partner::reset_from`] once this handler's lock is released.
    pub fn reset(&mut self) -> Option<Partner> {
        if self.state == ConnectionState::Disposed {
            return None;
        }
        self.rx.clear();
        self.tx.clear();
        self.receive_pending = false;
        self.send_pending = false;
        self.header_deadline = None;
        self.capture_requested = false;
        self.next_action = NextAction::Continue;
        let was_live = self.state.is_live();
        self.state = ConnectionState::Idle;
        if was_live {
            self.signals.command.notify_one();
        }
        self.paired_with.take()
    }

    /// Terminal teardown.
    pub fn dispose(&mut self) {
        self.reset();
        self.state = ConnectionState::Disposed;
        self.next_action = NextAction::Dispose;
    }

    pub(crate) fn link_partner(&mut self, partner: Partner) -> Result<()> {
        if let Some(existing) = self.paired_with() {
            if existing != partner.id() {
                return Err(EngineError::AlreadyPaired(self.id.to_string()));
            }
        }
        self.paired_with = Some(partner);
        Ok(())
    }

    pub(crate) fn unlink_partner(&mut self) -> Option<ConnectionId> {
        self.paired_with.take().map(|p| p.id())
    }

    // --- Deadlines ---

    /// Start the header-read deadline.
    pub fn arm_header_deadline(&mut self, now: Instant) {
        self.header_deadline = Some(now + self.settings.header_timeout);
    }

    /// The header (or handshake) finished; switch to keep-alive idle checks.
    pub fn header_complete(&mut self, now: Instant) {
        self.header_deadline = None;
        self.last_activity = now;
    }

    pub fn header_pending(&self) -> bool {
        self.header_deadline.is_some()
    }

    /// Force the connection down when a deadline expired.
    pub fn check_deadlines(&mut self, now: Instant) -> Result<()> {
        if !self.state.is_live() || self.state == ConnectionState::Disconnecting {
            return Ok(());
        }

        let expired = match self.header_deadline {
            Some(deadline) if now >= deadline => Some(TimeoutKind::HeaderRead),
            Some(_) => None,
            None => {
                let idle = self.settings.idle_timeout;
                if !idle.is_zero() && now.saturating_duration_since(self.last_activity) >= idle {
                    Some(TimeoutKind::KeepAliveIdle)
                } else {
                    None
                }
            }
        };

        match expired {
            Some(kind) => {
                let err = EngineError::Timeout(kind);
                self.fail(&err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("rx", &self.rx.count())
            .field("tx", &self.tx.count())
            .field("paired_with", &self.paired_with())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolSettings;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(BufferPoolSettings {
            min_class: 64,
            max_class: 1024,
            segment_size: 64,
            preallocate: 0,
        })
    }

    fn connected(settings: HandlerSettings) -> (ConnectionHandler, Arc<BufferPool>) {
        let buffers = pool();
        let mut h = ConnectionHandler::new(buffers.clone(), settings);
        h.on_accepted(peer(), Instant::now()).unwrap();
        (h, buffers)
    }

    #[test]
    fn zero_byte_receive_disconnects() {
        let (mut h, _) = connected(HandlerSettings::default());
        assert!(h.begin_receive());
        assert_eq!(h.state(), ConnectionState::Receiving);

        let action = h.on_received(&[], Instant::now()).unwrap();
        assert_eq!(action, NextAction::Reset);
        assert_eq!(h.state(), ConnectionState::Disconnecting);
        assert!(!h.begin_receive());
        assert_ne!(h.state(), ConnectionState::Receiving);
    }

    #[test]
    fn receive_without_operation_is_rejected() {
        let (mut h, _) = connected(HandlerSettings::default());
        let err = h.on_received(b"x", Instant::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert_eq!(h.state(), ConnectionState::Connected);
    }

    #[test]
    fn send_cycle_tracks_buffer_pressure() {
        let settings = HandlerSettings {
            send_chunk: 4,
            ..HandlerSettings::default()
        };
        let (mut h, _) = connected(settings);
        assert!(h.begin_send().is_none());
        assert_eq!(h.state(), ConnectionState::SendingIdle);

        h.send(b"abcdef").unwrap();
        let chunk = h.begin_send().unwrap();
        assert_eq!(&chunk[..], b"abcd");
        assert_eq!(h.state(), ConnectionState::Sending);

        h.on_sent(4, Instant::now()).unwrap();
        assert_eq!(h.state(), ConnectionState::Sending);

        let chunk = h.begin_send().unwrap();
        assert_eq!(&chunk[..], b"ef");
        h.on_sent(2, Instant::now()).unwrap();
        assert_eq!(h.state(), ConnectionState::SendingIdle);
        assert_eq!(h.bytes_sent(), 6);
    }

    #[test]
    fn high_water_blocks_reads_until_drained() {
        let settings = HandlerSettings {
            rx_high_water: 8,
            rx_low_water: 2,
            ..HandlerSettings::default()
        };
        let (mut h, _) = connected(settings);
        assert!(h.begin_receive());
        h.on_received(b"0123456789", Instant::now()).unwrap();
        assert_eq!(h.state(), ConnectionState::ReceivingBlocking);
        assert!(!h.begin_receive());

        h.rx_mut().discard(5);
        assert!(!h.update_backpressure());
        h.rx_mut().discard(4);
        assert!(h.update_backpressure());
        assert!(h.begin_receive());
    }

    #[test]
    fn reset_returns_buffers_and_recycles() {
        let (mut h, buffers) = connected(HandlerSettings::default());
        h.send(b"queued").unwrap();
        assert!(h.begin_receive());
        h.on_received(b"incoming", Instant::now()).unwrap();
        assert!(buffers.outstanding_bytes() > 0);

        h.reset();
        assert_eq!(h.state(), ConnectionState::Idle);
        assert_eq!(buffers.outstanding_bytes(), 0);

        let old = h.id();
        h.recycle(HandlerSettings::default());
        assert_ne!(h.id(), old);
        assert!(h.on_accepted(peer(), Instant::now()).is_ok());
    }

    #[test]
    fn socket_error_moves_to_disconnecting() {
        let (mut h, _) = connected(HandlerSettings::default());
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(h.on_error(&err), NextAction::Reset);
        assert_eq!(h.state(), ConnectionState::Disconnecting);
        assert!(h.last_error().is_some());
    }

    #[test]
    fn close_drains_before_reset() {
        let (mut h, _) = connected(HandlerSettings::default());
        h.send(b"bye").unwrap();
        h.close();
        assert_eq!(h.state(), ConnectionState::Disconnecting);
        assert_eq!(h.next_action(), NextAction::Continue);
        assert!(h.send(b"more").is_err());

        let chunk = h.begin_send().unwrap();
        assert_eq!(h.on_sent(chunk.len(), Instant::now()).unwrap(), NextAction::Reset);
    }

    #[test]
    fn header_deadline_expires() {
        let settings = HandlerSettings {
            header_timeout: Duration::from_millis(100),
            ..HandlerSettings::default()
        };
        let (mut h, _) = connected(settings);
        let start = Instant::now();
        h.arm_header_deadline(start);
        assert!(h.check_deadlines(start + Duration::from_millis(50)).is_ok());

        let err = h.check_deadlines(start + Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, EngineError::Timeout(TimeoutKind::HeaderRead)));
        assert_eq!(h.state(), ConnectionState::Disconnecting);
        assert_eq!(h.next_action(), NextAction::Reset);
    }

    #[test]
    fn idle_deadline_expires_after_header() {
        let settings = HandlerSettings {
            idle_timeout: Duration::from_secs(1),
            ..HandlerSettings::default()
        };
        let (mut h, _) = connected(settings);
        let start = Instant::now();
        h.header_complete(start);
        assert!(h.check_deadlines(start + Duration::from_millis(500)).is_ok());
        let err = h.check_deadlines(start + Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, EngineError::Timeout(TimeoutKind::KeepAliveIdle)));
    }

    #[test]
    fn dispose_is_terminal() {
        let (mut h, _) = connected(HandlerSettings::default());
        h.dispose();
        assert_eq!(h.state(), ConnectionState::Disposed);
        assert!(h.reset().is_none());
        assert_eq!(h.state(), ConnectionState::Disposed);
    }
}
