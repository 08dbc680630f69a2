//! HTTP collaborator contract.
//!
//! # Data Flow
//! ```text
//! incoming rx bytes
//!     → HeadParser::parse (None until "\r\n\r\n")
//!     → RequestHead (method, target, headers)
//!     → negotiate_encoding (Accept-Encoding vs. supported codecs)
//! ```

pub mod head;
pub mod parser;

pub use head::{negotiate_encoding, ContentEncoding, RequestHead};
pub use parser::{BasicHeadParser, HeadParser, ParsedHead};
