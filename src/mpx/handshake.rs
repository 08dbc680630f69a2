//! Greeting steps shared by both roles.
//!
//! Each side sends `PeerType`, `Version` and `MinimumVersion`, then expects
//! the same three frames from the other side, in that order.

use std::collections::VecDeque;

use crate::error::{EngineError, Result};
use crate::mpx::frame::{Frame, Op, PeerRole};
use crate::mpx::session::SessionState;
use crate::mpx::version::{negotiate, ProtocolVersion, VersionPolicy};

/// Outcome of feeding one frame to a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Waiting for more frames.
    Continue,
    /// Both sides agreed; the session is multiplexed.
    Established(ProtocolVersion),
    /// The credential was refused; queued replies should still be flushed.
    Rejected(String),
}

pub(crate) enum GreetingProgress {
    Next(SessionState),
    Negotiated(ProtocolVersion),
}

#[derive(Debug)]
pub(crate) struct PeerGreeting {
    role: PeerRole,
    policy: VersionPolicy,
    remote_version: Option<ProtocolVersion>,
}

pub(crate) fn unexpected(frame: &Frame, state: SessionState) -> EngineError {
    EngineError::MalformedFrame(format!("unexpected {:?} while {}", frame.op, state))
}

impl PeerGreeting {
    pub fn new(role: PeerRole, policy: VersionPolicy) -> Self {
        Self {
            role,
            policy,
            remote_version: None,
        }
    }

    pub fn policy(&self) -> VersionPolicy {
        self.policy
    }

    pub fn queue(&self, out: &mut VecDeque<Frame>) {
        out.push_back(Frame::peer_type(self.role));
        out.push_back(Frame::version(self.policy.version));
        out.push_back(Frame::minimum_version(self.policy.minimum));
    }

    pub fn on_frame(&mut self, state: SessionState, frame: &Frame) -> Result<GreetingProgress> {
        match (state, frame.op) {
            (SessionState::IdentifyingPeerType, Op::PeerType) => {
                let remote = frame.role()?;
                if remote != self.role.opposite() {
                    return Err(EngineError::MalformedFrame(format!(
                        "peer identified as {:?}, expected {:?}",
                        remote,
                        self.role.opposite()
                    )));
                }
                Ok(GreetingProgress::Next(SessionState::ReceivingProtocolVersion))
            }
            (SessionState::ReceivingProtocolVersion, Op::Version) => {
                self.remote_version = Some(frame.protocol_version()?);
                Ok(GreetingProgress::Next(
                    SessionState::ReceivingMinimumRequiredVersion,
                ))
            }
            (SessionState::ReceivingMinimumRequiredVersion, Op::MinimumVersion) => {
                let remote = VersionPolicy {
                    version: self.remote_version.ok_or_else(|| unexpected(frame, state))?,
                    minimum: frame.protocol_version()?,
                };
                negotiate(self.policy, remote)
                    .map(GreetingProgress::Negotiated)
                    .map_err(EngineError::ProtocolVersionMismatch)
            }
            _ => Err(unexpected(frame, state)),
        }
    }
}
