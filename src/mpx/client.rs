//! Client side of the MPX handshake.

use std::collections::VecDeque;

use crate::error::{EngineError, Result};
use crate::mpx::frame::{Frame, Op, PeerRole};
use crate::mpx::handshake::{unexpected, GreetingProgress, HandshakeStep, PeerGreeting};
use crate::mpx::session::SessionState;
use crate::mpx::version::{ProtocolVersion, VersionPolicy};

/// Client handshake: greet, present the credential, wait for the verdict.
#[derive(Debug)]
pub struct ClientHandshake {
    greeting: PeerGreeting,
    token: Vec<u8>,
    state: SessionState,
    negotiated: Option<ProtocolVersion>,
}

impl ClientHandshake {
    pub fn new(policy: VersionPolicy, token: impl Into<Vec<u8>>) -> Self {
        Self {
            greeting: PeerGreeting::new(PeerRole::Client, policy),
            token: token.into(),
            state: SessionState::IdentifyingPeerType,
            negotiated: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn policy(&self) -> VersionPolicy {
        self.greeting.policy()
    }

    /// Frames sent before anything is received.
    pub fn start(&self, out: &mut VecDeque<Frame>) {
        self.greeting.queue(out);
        out.push_back(Frame::authenticate(&self.token));
    }

    pub fn on_frame(&mut self, frame: &Frame, _out: &mut VecDeque<Frame>) -> Result<HandshakeStep> {
        if self.state == SessionState::ReceivingAuthenticationResult {
            if frame.op != Op::AuthResult {
                return Err(unexpected(frame, self.state));
            }
            let (accepted, reason) = frame.auth_outcome()?;
            if !accepted {
                return Err(EngineError::AuthenticationFailure(reason));
            }
            let version = self.negotiated.ok_or_else(|| unexpected(frame, self.state))?;
            self.state = SessionState::Multiplexed;
            return Ok(HandshakeStep::Established(version));
        }

        match self.greeting.on_frame(self.state, frame)? {
            GreetingProgress::Next(state) => self.state = state,
            GreetingProgress::Negotiated(version) => {
                self.negotiated = Some(version);
                self.state = SessionState::ReceivingAuthenticationResult;
            }
        }
        Ok(HandshakeStep::Continue)
    }
}
