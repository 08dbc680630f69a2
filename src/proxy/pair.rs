//! Two handlers joined into one proxy tunnel.
//!
//! The pairing is recorded on both handlers (`paired_with`) and only set
//! here. Teardown from either side clears both references.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::handler::{HandlerSignals, Partner, SharedHandler};
use crate::net::connection::ConnectionId;

/// Which end of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Client-facing.
    Incoming,
    /// Upstream-facing.
    Outgoing,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Incoming => Side::Outgoing,
            Side::Outgoing => Side::Incoming,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Incoming => "incoming",
            Side::Outgoing => "outgoing",
        }
    }
}

/// Incoming and outgoing handlers of one tunnel.
pub struct ProxyPair {
    incoming: SharedHandler,
    outgoing: SharedHandler,
    incoming_id: ConnectionId,
    outgoing_id: ConnectionId,
    incoming_signals: Arc<HandlerSignals>,
    outgoing_signals: Arc<HandlerSignals>,
    linked: AtomicBool,
}

impl ProxyPair {
    /// Pair two handlers. Fails when either one already has a partner.
    pub fn bind(incoming: SharedHandler, outgoing: SharedHandler) -> Result<Arc<Self>> {
        let (incoming_id, incoming_signals) = {
            let h = incoming.lock();
            (h.id(), h.signals())
        };
        let (outgoing_id, outgoing_signals) = {
            let h = outgoing.lock();
            (h.id(), h.signals())
        };

        incoming
            .lock()
            .link_partner(Partner::new(outgoing_id, &outgoing))?;
        if let Err(e) = outgoing
            .lock()
            .link_partner(Partner::new(incoming_id, &incoming))
        {
            incoming.lock().unlink_partner();
            return Err(e);
        }

        tracing::debug!(
            target: "handler_flow",
            incoming = %incoming_id,
            outgoing = %outgoing_id,
            "Proxy pair bound"
        );

        Ok(Arc::new(Self {
            incoming,
            outgoing,
            incoming_id,
            outgoing_id,
            incoming_signals,
            outgoing_signals,
            linked: AtomicBool::new(true),
        }))
    }

    pub fn handler(&self, side: Side) -> &SharedHandler {
        match side {
            Side::Incoming => &self.incoming,
            Side::Outgoing => &self.outgoing,
        }
    }

    pub fn id(&self, side: Side) -> ConnectionId {
        match side {
            Side::Incoming => self.incoming_id,
            Side::Outgoing => self.outgoing_id,
        }
    }

    fn signals(&self, side: Side) -> &HandlerSignals {
        match side {
            Side::Incoming => &self.incoming_signals,
            Side::Outgoing => &self.outgoing_signals,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// Queue bytes read on `from` for transmission on the other side.
    /// Returns the other side's transmit backlog afterwards.
    pub fn forward(&self, from: Side, data: &[u8]) -> Result<usize> {
        if !self.is_linked() {
            return Err(EngineError::InvalidState {
                operation: "forward",
                state: "unlinked".to_string(),
            });
        }
        let mut target = self.handler(from.other()).lock();
        target.send(data)?;
        Ok(target.tx().count())
    }

    /// Wake the driver on `side` so it re-reads its receive buffer.
    pub fn wake(&self, side: Side) {
        self.signals(side).command.notify_one();
    }

    /// Hard teardown: both handlers drop buffered data and return to `Idle`.
    pub fn reset_from(&self, side: Side) {
        if !self.linked.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            target: "handler_flow",
            side = side.as_str(),
            incoming = %self.incoming_id,
            outgoing = %self.outgoing_id,
            "Proxy pair reset"
        );
        self.handler(side.other()).lock().reset();
        self.handler(side).lock().reset();
    }

    /// Graceful teardown: the other side drains what it already queued.
    pub fn close_from(&self, side: Side) {
        if !self.linked.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            target: "handler_flow",
            side = side.as_str(),
            incoming = %self.incoming_id,
            outgoing = %self.outgoing_id,
            "Proxy pair closing"
        );
        self.handler(side).lock().unlink_partner();
        let mut other = self.handler(side.other()).lock();
        other.unlink_partner();
        other.close();
    }
}

impl std::fmt::Debug for ProxyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPair")
            .field("incoming", &self.incoming_id)
            .field("outgoing", &self.outgoing_id)
            .field("linked", &self.is_linked())
            .finish()
    }
}
