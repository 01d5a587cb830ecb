//! Wire identifiers
//!
//! Two 128-bit identifier kinds travel in every envelope header:
//!
//! - [`ObjectId`]: names a remote object for the lifetime of a session.
//!   Minted by the server the first time an object is serialized; clients
//!   never generate one.
//! - [`MessageId`]: names a single request so its response can be correlated.

use crate::error::{Result, WireError};
use bytes::{Buf, BufMut};
use std::fmt;
use uuid::Uuid;

/// Stable identifier naming a remote object across the wire.
///
/// Equality is bitwise. The nil value is the wire sentinel for "no object"
/// (root queries, responses, unbound notifications).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Size of an object id in bytes
    pub const SIZE: usize = 16;

    /// Nil identifier (all zeros)
    pub const NIL: Self = Self(Uuid::nil());

    /// Mint a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the canonical textual form "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| WireError::InvalidEnvelope(format!("bad object id {s:?}: {e}")))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Encode as 16 raw bytes
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.0.as_bytes());
    }

    /// Decode from 16 raw bytes
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(WireError::InvalidEnvelope(
                "not enough data for object id".to_string(),
            ));
        }
        let mut raw = [0u8; Self::SIZE];
        buf.copy_to_slice(&mut raw);
        Ok(Self(Uuid::from_bytes(raw)))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-request identifier, echoed in the matching response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Size of a message id in bytes
    pub const SIZE: usize = 16;

    /// Nil identifier (all zeros)
    pub const NIL: Self = Self(Uuid::nil());

    /// Mint a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Encode as 16 raw bytes
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.0.as_bytes());
    }

    /// Decode from 16 raw bytes
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(WireError::InvalidEnvelope(
                "not enough data for message id".to_string(),
            ));
        }
        let mut raw = [0u8; Self::SIZE];
        buf.copy_to_slice(&mut raw);
        Ok(Self(Uuid::from_bytes(raw)))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::generate();
        let mut buf = BytesMut::new();
        id.encode(&mut buf);
        assert_eq!(buf.len(), ObjectId::SIZE);

        let decoded = ObjectId::decode(&mut buf.freeze()).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn test_object_id_parse_display() {
        let id = ObjectId::generate();
        let text = id.to_string();
        assert_eq!(ObjectId::parse(&text).unwrap(), id);

        assert!(ObjectId::parse("not-an-id").is_err());
    }

    #[test]
    fn test_nil_sentinel() {
        assert!(ObjectId::NIL.is_nil());
        assert!(!ObjectId::generate().is_nil());
    }

    #[test]
    fn test_message_id_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_short_buffer() {
        let mut buf = &[0u8; 4][..];
        assert!(ObjectId::decode(&mut buf).is_err());
    }
}
