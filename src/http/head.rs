//! HTTP request-head contract consumed by the engine.
//!
//! The engine never implements HTTP; it only needs to know when a head is
//! complete, a few header values, and which content encoding both sides
//! support.

use hyper::header::HeaderMap;
use hyper::{Method, Version};

/// Content encodings known to the transfer codec registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
        }
    }

    /// Parse an `Accept-Encoding` / `Content-Encoding` token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "identity" => Some(ContentEncoding::Identity),
            "gzip" | "x-gzip" => Some(ContentEncoding::Gzip),
            "deflate" => Some(ContentEncoding::Deflate),
            _ => None,
        }
    }

    /// Identifier used in MPX `TransferInit` frames.
    pub fn wire_id(&self) -> u8 {
        match self {
            ContentEncoding::Identity => 0,
            ContentEncoding::Gzip => 1,
            ContentEncoding::Deflate => 2,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ContentEncoding::Identity),
            1 => Some(ContentEncoding::Gzip),
            2 => Some(ContentEncoding::Deflate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request head.
pub trait RequestHead: Send {
    fn method(&self) -> &Method;
    fn target(&self) -> &str;
    fn version(&self) -> Version;
    fn headers(&self) -> &HeaderMap;

    /// First value of `name`, if present and valid UTF-8.
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Bytes the head occupied on the wire, terminator included.
    fn head_len(&self) -> usize;

    /// The encoding to answer with, given what the engine supports.
    fn content_encoding(&self, supported: &[ContentEncoding]) -> ContentEncoding {
        negotiate_encoding(self.header("accept-encoding"), supported)
    }
}

/// Pick the best encoding from an `Accept-Encoding` value.
///
/// Highest q-value wins; ties go to the order of `supported`. Falls back to
/// identity when nothing acceptable is supported.
pub fn negotiate_encoding(accept: Option<&str>, supported: &[ContentEncoding]) -> ContentEncoding {
    let Some(accept) = accept else {
        return ContentEncoding::Identity;
    };

    let mut wildcard: Option<f32> = None;
    let mut ranked: Vec<(ContentEncoding, f32)> = Vec::new();
    for item in accept.split(',') {
        let mut parts = item.split(';');
        let token = parts.next().unwrap_or("").trim();
        let q = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|v| v.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        if token == "*" {
            wildcard = Some(q);
        } else if let Some(encoding) = ContentEncoding::from_token(token) {
            ranked.push((encoding, q));
        }
    }

    let mut best = ContentEncoding::Identity;
    let mut best_q = 0.0f32;
    for encoding in supported {
        let q = ranked
            .iter()
            .find(|(e, _)| e == encoding)
            .map(|(_, q)| *q)
            .or(wildcard)
            .unwrap_or(0.0);
        if q > best_q {
            best = *encoding;
            best_q = q;
        }
    }
    best
}
