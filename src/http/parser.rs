//! Minimal request-head parser.
//!
//! Reads the request line and header fields up to the blank line. Bodies,
//! chunking and continuation lines are not handled.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Version};

use crate::error::{EngineError, Result};
use crate::http::head::RequestHead;

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Turns buffered bytes into a request head.
pub trait HeadParser: Send + Sync {
    type Head: RequestHead;

    /// `Ok(None)` while the head is still incomplete.
    fn parse(&self, buf: &[u8]) -> Result<Option<Self::Head>>;
}

/// Head produced by [`BasicHeadParser`].
#[derive(Debug, Clone)]
pub struct ParsedHead {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    len: usize,
}

impl RequestHead for ParsedHead {
    fn method(&self) -> &Method {
        &self.method
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn head_len(&self) -> usize {
        self.len
    }
}

#[derive(Debug, Clone)]
pub struct BasicHeadParser {
    pub max_headers: usize,
}

impl Default for BasicHeadParser {
    fn default() -> Self {
        Self { max_headers: 100 }
    }
}

fn malformed(what: &str) -> EngineError {
    EngineError::MalformedFrame(format!("request head: {}", what))
}

impl HeadParser for BasicHeadParser {
    type Head = ParsedHead;

    fn parse(&self, buf: &[u8]) -> Result<Option<ParsedHead>> {
        let Some(end) = buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR) else {
            return Ok(None);
        };
        let len = end + TERMINATOR.len();
        let text = std::str::from_utf8(&buf[..end]).map_err(|_| malformed("not utf-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or_else(|| malformed("empty"))?;
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("bad request line"));
        };
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| malformed("bad method"))?;
        let version = match version {
            "HTTP/1.0" => Version::HTTP_10,
            "HTTP/1.1" => Version::HTTP_11,
            _ => return Err(malformed("unsupported version")),
        };

        let mut headers = HeaderMap::new();
        for line in lines {
            if headers.len() >= self.max_headers {
                return Err(malformed("too many headers"));
            }
            let (name, value) = line.split_once(':').ok_or_else(|| malformed("bad header"))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| malformed("bad header name"))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| malformed("bad header value"))?;
            headers.append(name, value);
        }

        Ok(Some(ParsedHead {
            method,
            target: target.to_string(),
            version,
            headers,
            len,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::head::ContentEncoding;

    #[test]
    fn incomplete_head_waits() {
        let parser = BasicHeadParser::default();
        assert!(parser.parse(b"GET / HTTP/1.1\r\nHost: a\r\n").unwrap().is_none());
    }

    #[test]
    fn parses_request_line_and_headers() {
        let parser = BasicHeadParser::default();
        let raw = b"POST /upload HTTP/1.1\r\nHost: example\r\nAccept-Encoding: gzip\r\n\r\nbody";
        let head = parser.parse(raw).unwrap().unwrap();
        assert_eq!(head.method(), &Method::POST);
        assert_eq!(head.target(), "/upload");
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(head.header("host"), Some("example"));
        assert_eq!(head.head_len(), raw.len() - 4);
        assert_eq!(
            head.content_encoding(&[ContentEncoding::Gzip, ContentEncoding::Identity]),
            ContentEncoding::Gzip
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let parser = BasicHeadParser::default();
        let err = parser.parse(b"HELLO\r\n\r\n").unwrap_err();
        assert!(matches!(err, EngineError::MalformedFrame(_)));
    }
}
