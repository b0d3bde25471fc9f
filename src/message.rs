//! The opaque payload seam between the runtime and whatever codec the
//! embedder uses.
//!
//! The runtime never interprets request or response bodies. A [Message] only
//! needs to move itself in and out of a byte buffer; the codec that produced
//! those bytes lives outside this crate.

use std::fmt;
use std::sync::Arc;

/// A request or response body the runtime can carry without understanding it.
pub trait Message: Send + fmt::Debug + 'static {
    /// Serialized size, used to pre-size encode buffers and to reject
    /// bodies that can never fit one packet.
    fn size(&self) -> usize;

    /// Append the serialized form to `buf`.
    ///
    /// NOTE: runs on the stream writer, after outgoing interceptors.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Replace the value with the one decoded from `buf`.
    fn decode(&mut self, buf: &[u8]) -> Result<(), ()>;

    /// Concrete-type access for callers and handlers; the runtime itself
    /// never looks inside.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Constructs a fresh instance for an incoming body to decode into.
///
/// Replaces run-time type reflection: the call site or the method registry
/// supplies the factory instead of a type token.
pub type MessageFactory = Arc<dyn Fn() -> Box<dyn Message> + Send + Sync>;

/// A body carried as raw bytes.
#[derive(Default, Clone, PartialEq)]
pub struct RawMessage(pub Vec<u8>);

impl RawMessage {
    #[inline]
    pub fn from_str(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.0).unwrap_or("<binary>")
    }
}

impl Message for RawMessage {
    #[inline(always)]
    fn size(&self) -> usize {
        self.0.len()
    }

    #[inline(always)]
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    #[inline(always)]
    fn decode(&mut self, buf: &[u8]) -> Result<(), ()> {
        self.0.clear();
        self.0.extend_from_slice(buf);
        Ok(())
    }

    #[inline(always)]
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match str::from_utf8(&self.0) {
            Ok(s) => write!(f, "raw {:?}", s),
            Err(_) => write!(f, "raw blob {}B", self.0.len()),
        }
    }
}

/// The empty body.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct NullMessage;

impl Message for NullMessage {
    #[inline(always)]
    fn size(&self) -> usize {
        0
    }

    #[inline(always)]
    fn encode(&self, _buf: &mut Vec<u8>) {}

    #[inline(always)]
    fn decode(&mut self, buf: &[u8]) -> Result<(), ()> {
        if buf.is_empty() { Ok(()) } else { Err(()) }
    }

    #[inline(always)]
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Factory for [RawMessage] bodies.
pub fn new_raw_message() -> MessageFactory {
    Arc::new(|| Box::new(RawMessage::default()))
}

/// Factory for [NullMessage] bodies.
pub fn new_null_message() -> MessageFactory {
    Arc::new(|| Box::new(NullMessage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_message_round_trip() {
        let m = RawMessage::from_str("req1:42");
        let mut buf = Vec::with_capacity(m.size());
        m.encode(&mut buf);
        let mut out = RawMessage::default();
        out.decode(&buf).expect("decode");
        assert_eq!(m, out);
        assert_eq!(out.as_str(), "req1:42");
    }

    #[test]
    fn test_null_message_rejects_body() {
        let mut m = NullMessage;
        assert!(m.decode(&[]).is_ok());
        assert!(m.decode(b"x").is_err());
    }
}
