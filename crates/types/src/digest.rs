//! Content digests.

use sbor::prelude::BasicSbor;
use sha2::{Digest as _, Sha256};

/// A SHA-256 digest over a canonical byte serialization.
///
/// Requests are content-addressed by the digest of their payload; batches are
/// addressed by the digest of their ordered request-digest list. Digests are
/// compared byte-exact.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// The all-zero digest.
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Hash an ordered list of digests.
    ///
    /// This is the batch digest: deterministic over the order and content of
    /// the request digests it covers.
    pub fn of_digests<'a>(digests: impl IntoIterator<Item = &'a Digest>) -> Self {
        let mut hasher = Sha256::new();
        for d in digests {
            hasher.update(d.0);
        }
        Digest(hasher.finalize().into())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, used for persistence keys and logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix keeps log lines readable.
        write!(f, "Digest({}..)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}
