//! Ed25519 signer over a static public-key registry.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use lockstep_core::Signer;
use lockstep_types::ReplicaId;
use tracing::warn;

/// Signer capability for a production replica: one signing key for
/// ourselves, one verifying key per replica id.
///
/// The registry is fixed at startup, like the rest of the membership
/// configuration.
pub struct KeyRegistrySigner {
    signing_key: SigningKey,
    registry: Vec<VerifyingKey>,
}

impl KeyRegistrySigner {
    /// Build a signer from our key and the full registry, indexed by
    /// replica id.
    pub fn new(signing_key: SigningKey, registry: Vec<VerifyingKey>) -> Self {
        Self {
            signing_key,
            registry,
        }
    }

    /// Number of registered replicas.
    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }
}

impl Signer for KeyRegistrySigner {
    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing_key.sign(bytes).to_bytes().to_vec()
    }

    fn check_sig(&self, bytes: &[u8], signer: ReplicaId, signature: &[u8]) -> bool {
        let Some(key) = self.registry.get(signer.0 as usize) else {
            warn!(%signer, "signature from unregistered replica");
            return false;
        };
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        key.verify(bytes, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn signatures_verify_against_the_registry() {
        let keys: Vec<SigningKey> = (0..4).map(keypair).collect();
        let registry: Vec<VerifyingKey> = keys.iter().map(|k| k.verifying_key()).collect();
        let signer = KeyRegistrySigner::new(keys[1].clone(), registry);

        let sig = signer.sign(b"payload");
        assert!(signer.check_sig(b"payload", ReplicaId(1), &sig));
        assert!(!signer.check_sig(b"payload", ReplicaId(2), &sig));
        assert!(!signer.check_sig(b"other", ReplicaId(1), &sig));
        assert!(!signer.check_sig(b"payload", ReplicaId(9), &sig));
    }
}
