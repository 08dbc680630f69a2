//! Async driver: pumps socket I/O through a [`ConnectionHandler`].
//!
//! # Data Flow
//! ```text
//! TcpStream read  → handler.on_received → protocol.on_received (consumes rx)
//! handler.tx      → handler.begin_send  → TcpStream write → handler.on_sent
//! interval tick   → handler.check_deadlines
//! ```
//!
//! # Design Decisions
//! - One task per connection; read, write and timers race in a `select!`
//! - `read` and `write` on a TCP stream are cancel-safe, so a losing branch
//!   is simply re-issued on the next turn
//! - The handler lock is never held across an await point

use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::error::{EngineError, Result, TimeoutKind};
use crate::handler::connection::ConnectionHandler;
use crate::handler::pool::SharedHandler;
use crate::handler::state::{ConnectionState, NextAction};
use crate::observability::metrics;

const DEADLINE_TICK: Duration = Duration::from_millis(100);

/// Protocol logic layered over a handler.
///
/// Hooks marked "locked" run while the driver holds the handler mutex and
/// must not block or lock another handler.
pub trait Protocol: Send + 'static {
    /// The socket is established (locked).
    fn on_connected(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        let _ = handler;
        Ok(())
    }

    /// New bytes sit in `handler.rx_mut()` (locked).
    fn on_received(&mut self, handler: &mut ConnectionHandler) -> Result<()>;

    /// A send completed and freed room in tx (locked).
    fn on_drained(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        let _ = handler;
        Ok(())
    }

    /// Another task poked this connection through `signals.command` (locked).
    fn on_resume(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        let _ = handler;
        Ok(())
    }

    /// Runs after every completion with the handler unlocked. Use this to
    /// touch other handlers.
    fn after_completion(&mut self) {}

    /// The driver is about to return.
    fn on_closed(&mut self, reason: &CloseReason) {
        let _ = reason;
    }
}

/// Why a driven connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer shut its side down.
    PeerClosed,
    /// Closed locally after draining.
    LocalClose,
    /// Reset from outside the driver (proxy partner, pool).
    Reset,
    /// Socket error.
    SocketError(String),
    /// A deadline expired.
    Timeout(TimeoutKind),
    /// The protocol rejected the stream.
    Protocol(&'static str),
    /// Engine shutdown.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::LocalClose => "local_close",
            CloseReason::Reset => "reset",
            CloseReason::SocketError(_) => "socket_error",
            CloseReason::Timeout(TimeoutKind::HeaderRead) => "header_timeout",
            CloseReason::Timeout(TimeoutKind::KeepAliveIdle) => "idle_timeout",
            CloseReason::Timeout(TimeoutKind::Connect) => "connect_timeout",
            CloseReason::Protocol(_) => "protocol",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::SocketError(e) => write!(f, "socket_error: {}", e),
            CloseReason::Protocol(kind) => write!(f, "protocol: {}", kind),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of [`drive`].
#[derive(Debug)]
pub enum DriveOutcome {
    /// The connection finished and the socket was closed.
    Closed(CloseReason),
    /// The protocol asked to take the socket back.
    Captured(TcpStream),
}

impl DriveOutcome {
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            DriveOutcome::Closed(reason) => Some(reason),
            DriveOutcome::Captured(_) => None,
        }
    }
}

fn protocol_failure(handler: &mut ConnectionHandler, error: &EngineError) -> CloseReason {
    handler.fail(error);
    CloseReason::Protocol(error.kind())
}

/// Pump `stream` through `handler` until the connection ends.
///
/// The handler must already be `Connected` (accepted or connected by the
/// caller). `protocol.on_connected` runs before the first read.
pub async fn drive<P: Protocol>(
    stream: TcpStream,
    handler: SharedHandler,
    mut protocol: P,
    mut shutdown: broadcast::Receiver<()>,
) -> DriveOutcome {
    let (mut reader, mut writer) = stream.into_split();
    let (signals, connection_id, read_chunk) = {
        let h = handler.lock();
        (h.signals(), h.id(), h.settings().read_chunk.max(1))
    };

    let mut reason: Option<CloseReason> = None;
    {
        let mut h = handler.lock();
        if let Err(e) = protocol.on_connected(&mut h) {
            reason = Some(protocol_failure(&mut h, &e));
        }
    }
    protocol.after_completion();

    let mut read_buf = vec![0u8; read_chunk];
    let mut pending_write: Option<Bytes> = None;
    let mut reading = false;
    let mut shutdown_open = true;
    let mut ticker = tokio::time::interval(DEADLINE_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let captured = loop {
        {
            let mut h = handler.lock();
            if h.take_capture_request() {
                break true;
            }
            match h.state() {
                ConnectionState::Idle | ConnectionState::Disposed => {
                    reason.get_or_insert(CloseReason::Reset);
                    break false;
                }
                ConnectionState::Disconnecting if h.next_action() != NextAction::Continue => {
                    reason.get_or_insert(CloseReason::LocalClose);
                    break false;
                }
                ConnectionState::Disconnecting => reading = false,
                _ => {}
            }
            if !reading {
                reading = h.begin_receive();
            }
            if pending_write.is_none() {
                pending_write = h.begin_send();
            }
            if pending_write.is_none() && h.state() == ConnectionState::Disconnecting {
                // Nothing left to drain.
                reason.get_or_insert(CloseReason::LocalClose);
                break false;
            }
        }

        let chunk = pending_write.clone().unwrap_or_default();
        let writing = pending_write.is_some();

        tokio::select! {
            res = reader.read(&mut read_buf), if reading => {
                reading = false;
                let now = Instant::now();
                let mut h = handler.lock();
                match res {
                    Ok(n) => match h.on_received(&read_buf[..n], now) {
                        Ok(_) if n == 0 => {
                            reason.get_or_insert(CloseReason::PeerClosed);
                        }
                        Ok(_) => {
                            if let Err(e) = protocol.on_received(&mut h) {
                                reason = Some(protocol_failure(&mut h, &e));
                            } else {
                                h.update_backpressure();
                            }
                        }
                        Err(e) => {
                            reason = Some(protocol_failure(&mut h, &e));
                        }
                    },
                    Err(e) => {
                        h.on_error(&e);
                        reason = Some(CloseReason::SocketError(e.to_string()));
                    }
                }
                drop(h);
                protocol.after_completion();
            }
            res = writer.write(&chunk), if writing => {
                pending_write = None;
                let now = Instant::now();
                let mut h = handler.lock();
                match res {
                    Ok(n) => match h.on_sent(n, now) {
                        Ok(_) => {
                            if let Err(e) = protocol.on_drained(&mut h) {
                                reason = Some(protocol_failure(&mut h, &e));
                            }
                        }
                        Err(e) => {
                            reason = Some(protocol_failure(&mut h, &e));
                        }
                    },
                    Err(e) => {
                        h.on_error(&e);
                        reason = Some(CloseReason::SocketError(e.to_string()));
                    }
                }
                drop(h);
                protocol.after_completion();
            }
            _ = signals.tx_ready.notified(), if !writing => {}
            _ = signals.rx_drained.notified(), if !reading => {
                handler.lock().update_backpressure();
            }
            _ = signals.command.notified() => {
                let mut h = handler.lock();
                if h.state().is_active() {
                    match protocol.on_resume(&mut h) {
                        Ok(()) => {
                            h.update_backpressure();
                        }
                        Err(e) => {
                            reason = Some(protocol_failure(&mut h, &e));
                        }
                    }
                }
                drop(h);
                protocol.after_completion();
            }
            _ = ticker.tick() => {
                let mut h = handler.lock();
                if let Err(EngineError::Timeout(kind)) = h.check_deadlines(Instant::now()) {
                    tracing::debug!(
                        target: "handler_flow",
                        connection_id = %connection_id,
                        timeout = %kind,
                        "Deadline expired"
                    );
                    reason = Some(CloseReason::Timeout(kind));
                }
            }
            res = shutdown.recv(), if shutdown_open => {
                shutdown_open = false;
                if !matches!(res, Err(broadcast::error::RecvError::Closed)) {
                    reason.get_or_insert(CloseReason::Shutdown);
                    handler.lock().close();
                }
            }
        }
    };

    if captured {
        let partner = handler.lock().reset();
        if let Some(partner) = partner {
            partner.reset_from(connection_id);
        }
        return match reader.reunite(writer) {
            Ok(stream) => {
                tracing::debug!(
                    target: "socket_flow",
                    connection_id = %connection_id,
                    "Socket captured"
                );
                DriveOutcome::Captured(stream)
            }
            Err(e) => {
                let reason = CloseReason::SocketError(e.to_string());
                protocol.on_closed(&reason);
                DriveOutcome::Closed(reason)
            }
        };
    }

    let reason = reason.unwrap_or(CloseReason::LocalClose);
    if reason != CloseReason::Reset {
        let _ = writer.shutdown().await;
    }
    tracing::debug!(
        target: "socket_flow",
        connection_id = %connection_id,
        reason = %reason,
        "Connection closed"
    );
    metrics::record_connection_closed(reason.as_str());
    protocol.on_closed(&reason);
    DriveOutcome::Closed(reason)
}
