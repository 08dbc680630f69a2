//! One multiplexed connection: handshake, then steady state.
//!
//! # Data Flow
//! ```text
//! rx buffer → frame::decode → handshake (client|server) ─┐
//!                                                       ├→ events → app
//!                          → Multiplexer (Multiplexed) ─┘
//! app ops / handshake replies → outbox → tx buffer
//! ```
//!
//! # Design Decisions
//! - Sans-IO: the session only reads from and writes to the handler's
//!   buffers; the driver owns the socket
//! - Any handshake failure moves to `Disconnecting`; there is no degraded mode

use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::buffer::DynamicBuffer;
use crate::error::{EngineError, Result};
use crate::mpx::channel::{ChannelDictionary, ChannelSnapshot, Direction, Origin};
use crate::mpx::client::ClientHandshake;
use crate::mpx::codec::CodecRegistry;
use crate::mpx::frame::{self, Frame, PeerRole};
use crate::mpx::handshake::HandshakeStep;
use crate::mpx::multiplexer::{Multiplexer, MuxSettings};
use crate::mpx::server::{Authenticator, ServerHandshake};
use crate::mpx::version::{ProtocolVersion, VersionMismatch, VersionPolicy};
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    IdentifyingPeerType,
    ReceivingProtocolVersion,
    ReceivingMinimumRequiredVersion,
    /// Client only.
    ReceivingAuthenticationResult,
    /// Server only.
    ReceivingAuthenticationCheck,
    Multiplexed,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::IdentifyingPeerType => "identifying_peer_type",
            SessionState::ReceivingProtocolVersion => "receiving_protocol_version",
            SessionState::ReceivingMinimumRequiredVersion => "receiving_minimum_required_version",
            SessionState::ReceivingAuthenticationResult => "receiving_authentication_result",
            SessionState::ReceivingAuthenticationCheck => "receiving_authentication_check",
            SessionState::Multiplexed => "multiplexed",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Last channel-control frame processed while multiplexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Ready,
    RetrievingChannelRequested,
    RetrievingChannelAdded,
    RetrievingChannelRemoved,
    RetrievingChannelYield,
}

/// May the owner take the socket back?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    Continue,
    AllowCapture,
}

/// Notifications delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpxEvent {
    Multiplexed { version: ProtocolVersion },
    ChannelAdded { channel: String, origin: Origin },
    ChannelRemoved { channel: String },
    ChannelRefused { channel: String, reason: String },
    Received { channel: String, data: Bytes },
    TransferCompleted { channel: String, bytes: u64 },
    TransferSkipped { channel: String, direction: Direction },
    FrameRejected { channel: String, error: String },
    Closed { reason: String },
}

impl MpxEvent {
    pub fn label(&self) -> &'static str {
        match self {
            MpxEvent::Multiplexed { .. } => "multiplexed",
            MpxEvent::ChannelAdded { .. } => "channel_added",
            MpxEvent::ChannelRemoved { .. } => "channel_removed",
            MpxEvent::ChannelRefused { .. } => "channel_refused",
            MpxEvent::Received { .. } => "received",
            MpxEvent::TransferCompleted { .. } => "transfer_completed",
            MpxEvent::TransferSkipped { .. } => "transfer_skipped",
            MpxEvent::FrameRejected { .. } => "frame_rejected",
            MpxEvent::Closed { .. } => "closed",
        }
    }
}

/// Session construction parameters shared by both roles.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub version: VersionPolicy,
    pub mux: MuxSettings,
    pub codecs: Arc<CodecRegistry>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            version: VersionPolicy {
                version: ProtocolVersion::new(1, 0),
                minimum: ProtocolVersion::new(1, 0),
            },
            mux: MuxSettings::default(),
            codecs: Arc::new(CodecRegistry::new()),
        }
    }
}

enum Handshake {
    Client(ClientHandshake),
    Server(ServerHandshake),
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub role: PeerRole,
    pub state: SessionState,
    pub control: ControlState,
    pub version: Option<String>,
    pub mismatch: Option<VersionMismatch>,
    pub failure: Option<String>,
    pub channels: Vec<ChannelSnapshot>,
}

pub struct MpxSession {
    role: PeerRole,
    handshake: Handshake,
    state: SessionState,
    negotiated: Option<ProtocolVersion>,
    mismatch: Option<VersionMismatch>,
    rejection: Option<String>,
    failure: Option<String>,
    mux: Multiplexer,
    outbox: VecDeque<Frame>,
    events: VecDeque<MpxEvent>,
    max_frame_size: usize,
    closed: bool,
}

impl MpxSession {
    /// Client session presenting `token`. The greeting is queued at once.
    pub fn client(settings: SessionSettings, token: impl Into<Vec<u8>>) -> Self {
        let handshake = ClientHandshake::new(settings.version, token);
        let mut outbox = VecDeque::new();
        handshake.start(&mut outbox);
        Self::assemble(PeerRole::Client, Handshake::Client(handshake), outbox, settings)
    }

    /// Server session checking credentials with `authenticator`.
    pub fn server(settings: SessionSettings, authenticator: Arc<dyn Authenticator>) -> Self {
        let handshake = ServerHandshake::new(settings.version, authenticator);
        let mut outbox = VecDeque::new();
        handshake.start(&mut outbox);
        Self::assemble(PeerRole::Server, Handshake::Server(handshake), outbox, settings)
    }

    fn assemble(
        role: PeerRole,
        handshake: Handshake,
        outbox: VecDeque<Frame>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            role,
            handshake,
            state: SessionState::IdentifyingPeerType,
            negotiated: None,
            mismatch: None,
            rejection: None,
            failure: None,
            max_frame_size: settings.mux.max_frame_size,
            mux: Multiplexer::new(role, settings.mux, settings.codecs),
            outbox,
            events: VecDeque::new(),
            closed: false,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn control(&self) -> ControlState {
        self.mux.control()
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.negotiated
    }

    pub fn mismatch(&self) -> Option<&VersionMismatch> {
        self.mismatch.as_ref()
    }

    /// Reason the credential was refused, on either side.
    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn channels(&self) -> &ChannelDictionary {
        self.mux.channels()
    }

    /// Decode and apply every complete frame in `rx`.
    pub fn receive(&mut self, rx: &mut DynamicBuffer) -> Result<()> {
        while self.state != SessionState::Disconnecting {
            let next = frame::decode(rx, self.max_frame_size);
            let result = match next {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.fail(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Apply one frame.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match self.state {
            SessionState::Multiplexed => self.mux.on_frame(frame, &mut self.events),
            SessionState::Disconnecting => Ok(()),
            _ => {
                let step = match &mut self.handshake {
                    Handshake::Client(h) => h.on_frame(&frame, &mut self.outbox)?,
                    Handshake::Server(h) => h.on_frame(&frame, &mut self.outbox)?,
                };
                match step {
                    HandshakeStep::Continue => {
                        self.state = match &self.handshake {
                            Handshake::Client(h) => h.state(),
                            Handshake::Server(h) => h.state(),
                        };
                    }
                    HandshakeStep::Established(version) => {
                        self.state = SessionState::Multiplexed;
                        self.negotiated = Some(version);
                        metrics::record_handshake("ok");
                        tracing::info!(
                            target: "program_flow",
                            role = ?self.role,
                            version = %version,
                            "MPX session multiplexed"
                        );
                        self.events.push_back(MpxEvent::Multiplexed { version });
                    }
                    HandshakeStep::Rejected(reason) => {
                        metrics::record_handshake("auth_failure");
                        tracing::warn!(
                            target: "exceptions",
                            reason = %reason,
                            "MPX client rejected"
                        );
                        self.failure = Some(EngineError::AuthenticationFailure(reason.clone()).to_string());
                        self.rejection = Some(reason);
                        self.state = SessionState::Disconnecting;
                    }
                }
                Ok(())
            }
        }
    }

    /// Move queued frames and scheduled data into `tx`.
    pub fn poll_transmit(&mut self, tx: &mut DynamicBuffer) -> Result<()> {
        while let Some(frame) = self.outbox.pop_front() {
            frame.write_to(tx)?;
        }
        if self.state == SessionState::Multiplexed {
            self.mux.write_to(tx)?;
        }
        Ok(())
    }

    fn require_multiplexed(&self, operation: &'static str) -> Result<()> {
        if self.state != SessionState::Multiplexed {
            return Err(EngineError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    pub fn request_channel(&mut self, name: &str) -> Result<()> {
        self.require_multiplexed("request channel")?;
        self.mux.request_channel(name)
    }

    pub fn remove_channel(&mut self, name: &str) -> Result<()> {
        self.require_multiplexed("remove channel")?;
        self.mux.remove_channel(name, &mut self.events)
    }

    pub fn send(&mut self, channel: &str, data: Bytes) -> Result<()> {
        self.require_multiplexed("send")?;
        self.mux.send(channel, data)
    }

    pub fn cancel(&mut self, channel: &str) -> Result<bool> {
        self.require_multiplexed("cancel transfer")?;
        self.mux.cancel(channel, &mut self.events)
    }

    /// Capture is allowed only on a quiet multiplexed connection.
    pub fn idle_decision(&self, rx_empty: bool, tx_empty: bool) -> IdleDecision {
        if self.state == SessionState::Multiplexed
            && self.outbox.is_empty()
            && self.mux.is_quiet()
            && rx_empty
            && tx_empty
        {
            IdleDecision::AllowCapture
        } else {
            IdleDecision::Continue
        }
    }

    /// Record a fatal error.
    pub fn fail(&mut self, error: &EngineError) {
        let outcome = match error {
            EngineError::ProtocolVersionMismatch(m) => {
                self.mismatch = Some(m.clone());
                Some("version_mismatch")
            }
            EngineError::AuthenticationFailure(reason) => {
                self.rejection = Some(reason.clone());
                Some("auth_failure")
            }
            _ if self.state != SessionState::Multiplexed => Some("failed"),
            _ => None,
        };
        if let Some(outcome) = outcome {
            metrics::record_handshake(outcome);
        }
        tracing::warn!(
            target: "exceptions",
            role = ?self.role,
            state = %self.state,
            error = %error,
            "MPX session failed"
        );
        self.failure = Some(error.to_string());
        self.state = SessionState::Disconnecting;
    }

    /// The connection is gone. Emits `Closed` once.
    pub fn close(&mut self, reason: &str) {
        self.state = SessionState::Disconnecting;
        if !std::mem::replace(&mut self.closed, true) {
            self.events.push_back(MpxEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Take pending events.
    pub fn drain_events(&mut self) -> Vec<MpxEvent> {
        let events: Vec<MpxEvent> = self.events.drain(..).collect();
        for event in &events {
            metrics::record_channel_event(event.label());
        }
        events
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            role: self.role,
            state: self.state,
            control: self.mux.control(),
            version: self.negotiated.map(|v| v.to_string()),
            mismatch: self.mismatch.clone(),
            failure: self.failure.clone(),
            channels: self.mux.channels().snapshot(),
        }
    }
}

impl fmt::Debug for MpxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpxSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("channels", &self.mux.channels().len())
            .finish()
    }
}
