//! Connection states, post-event directives and handler settings.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a [`ConnectionHandler`](super::ConnectionHandler).
///
/// ```text
/// Idle → Connecting → Connected → {Sending, SendingIdle, Receiving,
///        ReceivingIdle, ReceivingBlocking} → Disconnecting → Idle (recycled)
///                                                          → Disposed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Pooled resting state.
    Idle,
    /// Outbound connect in flight.
    Connecting,
    /// Socket established, no I/O issued yet.
    Connected,
    /// A send is in flight and more data is queued.
    Sending,
    /// The transmit buffer is empty.
    SendingIdle,
    /// A receive is in flight.
    Receiving,
    /// The last receive completed; the next one may be issued.
    ReceivingIdle,
    /// Receive buffer is above its high-water mark; reads are paused.
    ReceivingBlocking,
    /// Closing: no more reads, queued data may still drain.
    Disconnecting,
    /// Discarded by the pool. Terminal.
    Disposed,
}

impl ConnectionState {
    /// True while the connection carries traffic.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Sending
                | ConnectionState::SendingIdle
                | ConnectionState::Receiving
                | ConnectionState::ReceivingIdle
                | ConnectionState::ReceivingBlocking
        )
    }

    /// True for states a socket completion can still arrive in.
    pub fn is_live(&self) -> bool {
        self.is_active() || matches!(self, ConnectionState::Connecting | ConnectionState::Disconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Sending => "sending",
            ConnectionState::SendingIdle => "sending_idle",
            ConnectionState::Receiving => "receiving",
            ConnectionState::ReceivingIdle => "receiving_idle",
            ConnectionState::ReceivingBlocking => "receiving_blocking",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// What the driver should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Keep pumping.
    Continue,
    /// Tear down and discard the handler.
    Dispose,
    /// Tear down and recycle the handler.
    Reset,
}

/// Per-handler limits and deadlines.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Maximum time from accept/connect until the header (or handshake) completes.
    pub header_timeout: Duration,
    /// Maximum idle time once the header completed. Zero disables the check.
    pub idle_timeout: Duration,
    /// Receive buffer size at which reads pause.
    pub rx_high_water: usize,
    /// Receive buffer size at which paused reads resume.
    pub rx_low_water: usize,
    /// Largest chunk handed to a single socket write.
    pub send_chunk: usize,
    /// Size of the socket read buffer.
    pub read_chunk: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            rx_high_water: 1024 * 1024,
            rx_low_water: 256 * 1024,
            send_chunk: 64 * 1024,
            read_chunk: 16 * 1024,
        }
    }
}
