//! Deterministic Ed25519 keys for simulated replicas.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use lockstep_core::Signer;
use lockstep_types::{Digest, ReplicaId};
use std::sync::Arc;

/// Keyring holding every simulated replica's keypair.
///
/// Keys are derived from `(seed, replica id)`, so the same seed always
/// produces the same cluster. The verifying half doubles as the public-key
/// registry each replica checks signatures against.
pub struct SimKeyring {
    keys: Vec<SigningKey>,
    verifying: Vec<VerifyingKey>,
}

impl SimKeyring {
    /// Derive a keyring for `n` replicas from a seed.
    pub fn new(n: u64, seed: u64) -> Self {
        let keys: Vec<SigningKey> = (0..n)
            .map(|i| {
                let mut material = Vec::with_capacity(16);
                material.extend_from_slice(&seed.to_le_bytes());
                material.extend_from_slice(&i.to_le_bytes());
                SigningKey::from_bytes(Digest::of(&material).as_bytes())
            })
            .collect();
        let verifying = keys.iter().map(|k| k.verifying_key()).collect();
        Self { keys, verifying }
    }

    /// Sign bytes as `id`. Tests use this to forge byzantine traffic too.
    pub fn sign(&self, id: ReplicaId, bytes: &[u8]) -> Vec<u8> {
        self.keys[id.0 as usize].sign(bytes).to_bytes().to_vec()
    }

    /// Verify a signature against `id`'s registered key.
    pub fn verify(&self, id: ReplicaId, bytes: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.verifying.get(id.0 as usize) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        key.verify(bytes, &signature).is_ok()
    }

    /// Number of replicas in the ring.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Per-replica signer capability backed by the shared keyring.
pub struct SimSigner {
    id: ReplicaId,
    keyring: Arc<SimKeyring>,
}

impl SimSigner {
    /// Signer for one replica.
    pub fn new(id: ReplicaId, keyring: Arc<SimKeyring>) -> Self {
        Self { id, keyring }
    }
}

impl Signer for SimSigner {
    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.keyring.sign(self.id, bytes)
    }

    fn check_sig(&self, bytes: &[u8], signer: ReplicaId, signature: &[u8]) -> bool {
        self.keyring.verify(signer, bytes, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_keys() {
        let a = SimKeyring::new(4, 42);
        let b = SimKeyring::new(4, 42);
        let sig_a = a.sign(ReplicaId(2), b"msg");
        let sig_b = b.sign(ReplicaId(2), b"msg");
        assert_eq!(sig_a, sig_b);
        assert!(a.verify(ReplicaId(2), b"msg", &sig_b));
    }

    #[test]
    fn verification_is_signer_specific() {
        let ring = SimKeyring::new(4, 42);
        let sig = ring.sign(ReplicaId(0), b"msg");
        assert!(ring.verify(ReplicaId(0), b"msg", &sig));
        assert!(!ring.verify(ReplicaId(1), b"msg", &sig));
        assert!(!ring.verify(ReplicaId(0), b"other", &sig));
        assert!(!ring.verify(ReplicaId(9), b"msg", &sig));
    }

    #[test]
    fn garbage_signatures_fail_cleanly() {
        let ring = SimKeyring::new(1, 7);
        assert!(!ring.verify(ReplicaId(0), b"msg", &[1, 2, 3]));
    }
}
