//! Tunnel runtime: one accepted client, one upstream connection.
//!
//! # Data Flow
//! ```text
//! client socket → incoming handler rx → ProxyForward → outgoing handler tx → upstream
//! upstream      → outgoing handler rx → ProxyForward → incoming handler tx → client
//! ```
//!
//! # Design Decisions
//! - The incoming handler comes from the bounded pool, the outgoing one from
//!   the cache pool, so only accepted clients count against the limit
//! - Bytes are moved to the partner in `after_completion`, outside this
//!   side's lock; the two handler locks are never held together
//! - A side stops consuming its rx while the partner's tx is over the limit;
//!   the partner wakes it once its tx drained

use arc_swap::ArcSwap;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::error::{EngineError, Result, TimeoutKind};
use crate::handler::{drive, CloseReason, ConnectionHandler, DriveOutcome, HandlerPool, Protocol};
use crate::http::{BasicHeadParser, HeadParser, RequestHead};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::{ConnectionKind, ConnectionRegistry};
use crate::net::listener::{tune_stream, SocketOptions};
use crate::proxy::pair::{ProxyPair, Side};

/// Per-tunnel knobs, swappable on config reload.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub upstream: SocketAddr,
    pub connect_timeout: Duration,
    /// Wait for a complete HTTP request head before forwarding.
    pub inspect_http: bool,
    pub max_header_size: usize,
    pub socket: SocketOptions,
}

/// Everything a tunnel needs from the engine.
pub struct TunnelContext {
    pub incoming: Arc<HandlerPool>,
    pub outgoing: Arc<HandlerPool>,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: Shutdown,
    pub settings: ArcSwap<TunnelSettings>,
}

/// How each side of a finished tunnel ended.
#[derive(Debug, Clone)]
pub struct TunnelSummary {
    pub incoming: CloseReason,
    pub outgoing: CloseReason,
    pub bytes_from_client: u64,
    pub bytes_from_upstream: u64,
}

struct HeadInspector {
    parser: BasicHeadParser,
    max_header_size: usize,
}

impl HeadInspector {
    /// True once a full head is buffered.
    fn check(&self, handler: &mut ConnectionHandler) -> Result<bool> {
        let buffered = handler.rx().count();
        let window = handler.rx().peek(buffered.min(self.max_header_size + 4));
        match self.parser.parse(&window)? {
            Some(head) => {
                tracing::debug!(
                    target: "handler_flow",
                    connection_id = %handler.id(),
                    method = %head.method(),
                    target = head.target(),
                    head_len = head.head_len(),
                    "Request head complete"
                );
                handler.header_complete(Instant::now());
                Ok(true)
            }
            None if buffered > self.max_header_size => Err(EngineError::BufferOverflow {
                len: buffered,
                max: self.max_header_size,
            }),
            None => Ok(false),
        }
    }
}

/// Moves received bytes to the other side of a [`ProxyPair`].
pub struct ProxyForward {
    pair: Arc<ProxyPair>,
    side: Side,
    inspector: Option<HeadInspector>,
    outbound: BytesMut,
    partner_backlog: usize,
    backlog_limit: usize,
    wake_partner: bool,
}

impl ProxyForward {
    pub fn new(pair: Arc<ProxyPair>, side: Side, backlog_limit: usize) -> Self {
        Self {
            pair,
            side,
            inspector: None,
            outbound: BytesMut::new(),
            partner_backlog: 0,
            backlog_limit,
            wake_partner: false,
        }
    }

    /// Hold data back until an HTTP request head of at most
    /// `max_header_size` bytes has arrived.
    pub fn with_head_inspection(mut self, max_header_size: usize) -> Self {
        self.inspector = Some(HeadInspector {
            parser: BasicHeadParser::default(),
            max_header_size,
        });
        self
    }

    fn pump(&mut self, handler: &mut ConnectionHandler) {
        if self.partner_backlog >= self.backlog_limit {
            return;
        }
        let n = handler.rx().count();
        if n > 0 {
            self.outbound.extend_from_slice(&handler.rx_mut().consume(n));
        }
    }
}

impl Protocol for ProxyForward {
    fn on_received(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        if let Some(inspector) = &self.inspector {
            if !inspector.check(handler)? {
                return Ok(());
            }
            self.inspector = None;
        }
        self.pump(handler);
        Ok(())
    }

    fn on_drained(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        if handler.tx().is_empty() {
            self.wake_partner = true;
        }
        Ok(())
    }

    fn on_resume(&mut self, handler: &mut ConnectionHandler) -> Result<()> {
        if self.inspector.is_none() {
            self.partner_backlog = 0;
            self.pump(handler);
        }
        Ok(())
    }

    fn after_completion(&mut self) {
        if !self.outbound.is_empty() {
            let data = self.outbound.split().freeze();
            match self.pair.forward(self.side, &data) {
                Ok(backlog) => self.partner_backlog = backlog,
                Err(e) => {
                    tracing::debug!(
                        target: "handler_flow",
                        side = self.side.as_str(),
                        dropped = data.len(),
                        error = %e,
                        "Forward after unlink"
                    );
                }
            }
        }
        if std::mem::take(&mut self.wake_partner) {
            self.pair.wake(self.side.other());
        }
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        match reason {
            CloseReason::PeerClosed | CloseReason::LocalClose | CloseReason::Shutdown => {
                self.pair.close_from(self.side)
            }
            _ => self.pair.reset_from(self.side),
        }
    }
}

fn reason_of(outcome: DriveOutcome) -> CloseReason {
    match outcome {
        DriveOutcome::Closed(reason) => reason,
        DriveOutcome::Captured(_) => CloseReason::LocalClose,
    }
}

/// Serve one accepted client until both sides of the tunnel closed.
pub async fn run_tunnel(
    client: TcpStream,
    peer: SocketAddr,
    ctx: Arc<TunnelContext>,
) -> Result<TunnelSummary> {
    let settings = ctx.settings.load_full();

    let incoming = ctx.incoming.pop().ok_or(EngineError::PoolExhausted {
        max: ctx.incoming.stats().max,
    })?;
    let now = Instant::now();
    {
        let mut h = incoming.lock();
        h.on_accepted(peer, now)?;
        if settings.inspect_http {
            h.arm_header_deadline(now);
        }
    }
    let _incoming_entry = ctx
        .registry
        .register(incoming.id(), ConnectionKind::ProxyIncoming, peer);

    let outgoing = ctx.outgoing.pop().ok_or(EngineError::PoolExhausted {
        max: ctx.outgoing.stats().max,
    })?;
    outgoing.lock().begin_connect(settings.upstream)?;

    let connect = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(settings.upstream));
    let upstream = match connect.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            outgoing.lock().on_error(&e);
            tracing::warn!(
                target: "exceptions",
                upstream = %settings.upstream,
                error = %e,
                "Upstream connect failed"
            );
            return Err(e.into());
        }
        Err(_) => {
            let err = EngineError::Timeout(TimeoutKind::Connect);
            outgoing.lock().fail(&err);
            tracing::warn!(
                target: "exceptions",
                upstream = %settings.upstream,
                "Upstream connect timed out"
            );
            return Err(err);
        }
    };
    tune_stream(&upstream, &settings.socket)?;
    outgoing.lock().on_connected(settings.upstream, Instant::now())?;
    let _outgoing_entry = ctx.registry.register(
        outgoing.id(),
        ConnectionKind::ProxyOutgoing,
        settings.upstream,
    );

    let pair = ProxyPair::bind(incoming.shared(), outgoing.shared())?;
    let limit = ctx.incoming.settings().rx_high_water;

    let mut inbound = ProxyForward::new(Arc::clone(&pair), Side::Incoming, limit);
    if settings.inspect_http {
        inbound = inbound.with_head_inspection(settings.max_header_size);
    }
    let outbound = ProxyForward::new(Arc::clone(&pair), Side::Outgoing, limit);

    let (client_end, upstream_end) = tokio::join!(
        drive(client, incoming.shared(), inbound, ctx.shutdown.subscribe()),
        drive(upstream, outgoing.shared(), outbound, ctx.shutdown.subscribe()),
    );

    let summary = TunnelSummary {
        incoming: reason_of(client_end),
        outgoing: reason_of(upstream_end),
        bytes_from_client: incoming.lock().bytes_received(),
        bytes_from_upstream: outgoing.lock().bytes_received(),
    };
    tracing::debug!(
        target: "socket_flow",
        peer = %peer,
        incoming = %summary.incoming,
        outgoing = %summary.outgoing,
        "Tunnel finished"
    );
    tracing::debug!(
        target: "performance",
        peer = %peer,
        elapsed_ms = now.elapsed().as_millis() as u64,
        bytes_from_client = summary.bytes_from_client,
        bytes_from_upstream = summary.bytes_from_upstream,
        "Tunnel throughput"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, BufferPoolSettings};
    use crate::handler::{HandlerLease, HandlerSettings};

    fn paired() -> (HandlerLease, HandlerLease, Arc<ProxyPair>) {
        let buffers = BufferPool::new(BufferPoolSettings::default());
        let pool = HandlerPool::new("t", 4, buffers, HandlerSettings::default());
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        let peer = "127.0.0.1:8000".parse().unwrap();
        a.lock().on_accepted(peer, Instant::now()).unwrap();
        b.lock().on_accepted(peer, Instant::now()).unwrap();
        let pair = ProxyPair::bind(a.shared(), b.shared()).unwrap();
        (a, b, pair)
    }

    fn receive(lease: &HandlerLease, data: &[u8]) {
        let mut h = lease.lock();
        assert!(h.begin_receive());
        h.on_received(data, Instant::now()).unwrap();
    }

    #[test]
    fn head_is_held_until_complete() {
        let (a, b, pair) = paired();
        let mut forward = ProxyForward::new(pair, Side::Incoming, 1 << 20).with_head_inspection(1024);

        receive(&a, b"GET / HTTP/1.1\r\nHost: x\r\n");
        forward.on_received(&mut a.lock()).unwrap();
        forward.after_completion();
        assert!(b.lock().tx().is_empty());

        receive(&a, b"\r\n");
        forward.on_received(&mut a.lock()).unwrap();
        forward.after_completion();
        assert_eq!(b.lock().tx().count(), 27);
    }

    #[test]
    fn oversized_head_overflows() {
        let (a, _b, pair) = paired();
        let mut forward = ProxyForward::new(pair, Side::Incoming, 1 << 20).with_head_inspection(16);

        receive(&a, b"GET /a-very-long-target-without-end HTTP/1.1\r\n");
        let err = forward.on_received(&mut a.lock()).unwrap_err();
        assert!(matches!(err, EngineError::BufferOverflow { max: 16, .. }));
    }

    #[test]
    fn backlog_limit_pauses_consumption() {
        let (a, b, pair) = paired();
        let mut forward = ProxyForward::new(pair, Side::Incoming, 4);

        receive(&a, b"12345");
        forward.on_received(&mut a.lock()).unwrap();
        forward.after_completion();
        assert_eq!(b.lock().tx().count(), 5);

        receive(&a, b"678");
        forward.on_received(&mut a.lock()).unwrap();
        forward.after_completion();
        assert_eq!(a.lock().rx().count(), 3);

        b.lock().tx_mut().clear();
        forward.on_resume(&mut a.lock()).unwrap();
        forward.after_completion();
        assert_eq!(b.lock().tx().count(), 3);
    }
}
