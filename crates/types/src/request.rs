//! Client requests.

use crate::Digest;
use sbor::prelude::BasicSbor;

/// An opaque client request payload.
///
/// The protocol never inspects the payload; requests are content-addressed by
/// the digest of the payload bytes and resolved through the request store at
/// delivery time.
#[derive(Clone, PartialEq, Eq, BasicSbor)]
pub struct Request {
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Request {
    /// Wrap a payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Canonical digest of this request.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.payload)
    }

    /// Payload size in bytes, used for batch size accounting.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("len", &self.payload.len())
            .field("digest", &self.digest())
            .finish()
    }
}
