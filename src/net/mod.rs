//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! PortSet::apply(ports)
//!     → listener.rs (socket2 bind, backlog, bind scope, keep-alive)
//!     → ConnectionAcceptor (MPX server or proxy tunnel)
//!     → connection.rs (ConnectionId, registry entry while live)
//! ```
//!
//! # Design Decisions
//! - Ports are hot-reloadable; removing a port stops accepting but leaves
//!   live connections alone
//! - TLS is a collaborator: only certificate lookup lives here

pub mod connection;
pub mod listener;
pub mod ports;
pub mod tls;

pub use connection::{ConnectionId, ConnectionKind, ConnectionRegistry, ConnectionSnapshot, RegistrationGuard};
pub use listener::{tune_stream, Listener, ListenerError, ListenerSettings, SocketOptions};
pub use ports::{ConnectionAcceptor, PortChanges, PortSet};
pub use tls::{CertificateProvider, CertificateRequest, FileCertificateProvider, TlsIdentity};
