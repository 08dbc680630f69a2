//! Transfer codecs keyed by content encoding.
//!
//! Only the identity codec ships. Real compression codecs plug in through
//! [`CodecRegistry::register`].

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::http::ContentEncoding;

/// Encodes outgoing payloads and decodes incoming ones.
pub trait TransferCodec: Send + Sync {
    fn encoding(&self) -> ContentEncoding;
    fn encode(&self, data: &[u8]) -> Result<Bytes>;
    fn decode(&self, data: &[u8]) -> Result<Bytes>;
}

/// Pass-through codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl TransferCodec for IdentityCodec {
    fn encoding(&self) -> ContentEncoding {
        ContentEncoding::Identity
    }

    fn encode(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Registered codecs. Always contains identity.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<ContentEncoding, Arc<dyn TransferCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let mut codecs: HashMap<ContentEncoding, Arc<dyn TransferCodec>> = HashMap::new();
        codecs.insert(ContentEncoding::Identity, Arc::new(IdentityCodec));
        Self { codecs }
    }

    /// Add or replace the codec for its encoding.
    pub fn register(&mut self, codec: Arc<dyn TransferCodec>) {
        self.codecs.insert(codec.encoding(), codec);
    }

    pub fn get(&self, encoding: ContentEncoding) -> Option<Arc<dyn TransferCodec>> {
        self.codecs.get(&encoding).cloned()
    }

    pub fn supports(&self, encoding: ContentEncoding) -> bool {
        self.codecs.contains_key(&encoding)
    }

    pub fn supported(&self) -> Vec<ContentEncoding> {
        let mut list: Vec<_> = self.codecs.keys().copied().collect();
        list.sort_by_key(|e| e.wire_id());
        list
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("supported", &self.supported())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reversing;

    impl TransferCodec for Reversing {
        fn encoding(&self) -> ContentEncoding {
            ContentEncoding::Deflate
        }

        fn encode(&self, data: &[u8]) -> Result<Bytes> {
            Ok(data.iter().rev().copied().collect::<Vec<_>>().into())
        }

        fn decode(&self, data: &[u8]) -> Result<Bytes> {
            self.encode(data)
        }
    }

    #[test]
    fn identity_is_always_present() {
        let registry = CodecRegistry::new();
        assert!(registry.supports(ContentEncoding::Identity));
        assert!(!registry.supports(ContentEncoding::Gzip));
        let codec = registry.get(ContentEncoding::Identity).unwrap();
        assert_eq!(&codec.decode(b"abc").unwrap()[..], b"abc");
    }

    #[test]
    fn registered_codecs_are_listed() {
        let mut registry = CodecRegistry::new();
        registry.register(Arc::new(Reversing));
        assert_eq!(
            registry.supported(),
            vec![ContentEncoding::Identity, ContentEncoding::Deflate]
        );
        let codec = registry.get(ContentEncoding::Deflate).unwrap();
        assert_eq!(&codec.encode(b"abc").unwrap()[..], b"cba");
    }
}
