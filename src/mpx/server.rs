//! Server side of the MPX handshake and credential checks.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::Result;
use crate::mpx::frame::{Frame, Op, PeerRole};
use crate::mpx::handshake::{unexpected, GreetingProgress, HandshakeStep, PeerGreeting};
use crate::mpx::session::SessionState;
use crate::mpx::version::{ProtocolVersion, VersionPolicy};

/// Checks the credential a client presents.
pub trait Authenticator: Send + Sync {
    /// `Err(reason)` rejects the client.
    fn verify(&self, credential: &[u8]) -> std::result::Result<(), String>;
}

/// Accepts every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn verify(&self, _credential: &[u8]) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Accepts clients presenting one shared token.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Vec<u8>,
}

impl SharedSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl Authenticator for SharedSecret {
    fn verify(&self, credential: &[u8]) -> std::result::Result<(), String> {
        // Constant time in the length of the shorter input.
        let diff = self
            .secret
            .iter()
            .zip(credential)
            .fold(self.secret.len() ^ credential.len(), |acc, (a, b)| {
                acc | usize::from(a ^ b)
            });
        if diff == 0 {
            Ok(())
        } else {
            Err("invalid credential".to_string())
        }
    }
}

/// Server handshake: greet, check the credential, answer with the verdict.
pub struct ServerHandshake {
    greeting: PeerGreeting,
    authenticator: Arc<dyn Authenticator>,
    state: SessionState,
    negotiated: Option<ProtocolVersion>,
}

impl ServerHandshake {
    pub fn new(policy: VersionPolicy, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            greeting: PeerGreeting::new(PeerRole::Server, policy),
            authenticator,
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

    pub fn start(&self, out: &mut VecDeque<Frame>) {
        self.greeting.queue(out);
    }

    pub fn on_frame(&mut self, frame: &Frame, out: &mut VecDeque<Frame>) -> Result<HandshakeStep> {
        if self.state == SessionState::ReceivingAuthenticationCheck {
            if frame.op != Op::Authenticate {
                return Err(unexpected(frame, self.state));
            }
            let version = self.negotiated.ok_or_else(|| unexpected(frame, self.state))?;
            return match self.authenticator.verify(&frame.payload) {
                Ok(()) => {
                    out.push_back(Frame::auth_result(true, ""));
                    self.state = SessionState::Multiplexed;
                    Ok(HandshakeStep::Established(version))
                }
                Err(reason) => {
                    out.push_back(Frame::auth_result(false, &reason));
                    self.state = SessionState::Disconnecting;
                    Ok(HandshakeStep::Rejected(reason))
                }
            };
        }

        match self.greeting.on_frame(self.state, frame)? {
            GreetingProgress::Next(state) => self.state = state,
            GreetingProgress::Negotiated(version) => {
                self.negotiated = Some(version);
                self.state = SessionState::ReceivingAuthenticationCheck;
            }
        }
        Ok(HandshakeStep::Continue)
    }
}

impl std::fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("state", &self.state)
            .field("negotiated", &self.negotiated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_compares_whole_token() {
        let auth = SharedSecret::new("s3cret");
        assert!(auth.verify(b"s3cret").is_ok());
        assert!(auth.verify(b"s3cre").is_err());
        assert!(auth.verify(b"s3cretX").is_err());
        assert!(auth.verify(b"S3cret").is_err());
        assert!(auth.verify(b"").is_err());
    }
}
