//! Traits implemented by the engine and provided by hosts.

use crate::{Action, Event};
use lockstep_types::ReplicaId;

/// The engine's entry point.
///
/// Hosts funnel all three event sources (inbound messages, client requests,
/// timer fires) into this single method; no engine field is read or mutated
/// concurrently.
pub trait StateMachine {
    /// Process one event to completion and return the resulting actions.
    fn handle(&mut self, event: Event) -> Vec<Action>;
}

/// Cryptographic capability bundle handed to the engine at construction.
///
/// The engine does not choose a signature scheme; hosts bring one. The
/// bundled hosts use Ed25519 over a replica-id keyed public-key registry.
pub trait Signer: Send + Sync {
    /// Sign bytes with this replica's key.
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;

    /// Verify `signature` over `bytes` against `signer`'s registered key.
    fn check_sig(&self, bytes: &[u8], signer: ReplicaId, signature: &[u8]) -> bool;
}

/// Key-value state store used for crash recovery.
///
/// The engine writes through [`Action::Persist`]/[`Action::PersistDelete`];
/// reads happen only at boot, when the host loads a recovered state snapshot
/// to construct the engine with.
pub trait StateStore {
    /// Store a value under a key, overwriting any previous value.
    fn store_state(&mut self, key: &str, value: &[u8]);

    /// Read a value, if present.
    fn read_state(&self, key: &str) -> Option<Vec<u8>>;

    /// Read all key/value pairs whose key starts with `prefix`.
    fn read_state_set(&self, prefix: &str) -> Vec<(String, Vec<u8>)>;

    /// Delete a key. No-op if absent.
    fn del_state(&mut self, key: &str);

    /// The highest delivered sequence number the host has recorded, if any.
    fn last_seq_no(&self) -> Option<u64>;
}
