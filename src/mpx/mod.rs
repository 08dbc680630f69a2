//! MPX: many named channels over one physical connection.
//!
//! # Data Flow
//! ```text
//! socket ↔ handler buffers ↔ MpxProtocol ↔ MpxSession
//!                                            ├─ ClientHandshake | ServerHandshake
//!                                            └─ Multiplexer → ChannelDictionary
//! ```
//!
//! # Design Decisions
//! - Wire format: one length-prefixed frame per unit, see [`frame`]
//! - Session logic is synchronous and socket-free; [`handle`] wires it to a
//!   driven connection
//! - Version negotiation picks the lower version, bounded by both minimums

pub mod channel;
pub mod client;
pub mod codec;
pub mod frame;
pub mod handle;
pub mod handshake;
pub mod multiplexer;
pub mod server;
pub mod session;
pub mod version;

pub use channel::{ChannelData, ChannelDictionary, ChannelSnapshot, Direction, Origin, TransferState};
pub use codec::{CodecRegistry, IdentityCodec, TransferCodec};
pub use frame::{Frame, Op, PeerRole, SkipKind};
pub use handle::{
    connect, serve_connection, EndpointSettings, MpxConnection, MpxEndpoint, MpxHandle,
    MpxProtocol, SessionDirectory, SessionEntry,
};
pub use handshake::HandshakeStep;
pub use multiplexer::{Multiplexer, MuxSettings};
pub use server::{AllowAll, Authenticator, SharedSecret};
pub use session::{
    ControlState, IdleDecision, MpxEvent, MpxSession, SessionSettings, SessionSnapshot,
    SessionState,
};
pub use version::{negotiate, ProtocolVersion, VersionMismatch, VersionPolicy};
