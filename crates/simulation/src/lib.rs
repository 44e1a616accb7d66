//! Deterministic simulation host for the Lockstep engine.
//!
//! The simulation runs N replicas in a single thread against a simulated
//! network with seeded latency jitter, optional packet loss, partitions,
//! and a message filter hook for adversarial tests (dropping or rewriting
//! frames on the wire). Given the same seed, a run produces identical
//! results every time.
//!
//! Each replica gets its own in-memory state store and a deterministic
//! Ed25519 keypair; persisted state survives a simulated restart, which is
//! how crash-recovery scenarios are driven.

mod keys;
mod network;
mod runner;
mod storage;

pub use keys::{SimKeyring, SimSigner};
pub use network::{FilterAction, NetworkConfig, SimNetwork};
pub use runner::{SimRunner, SimStats};
pub use storage::MemoryStore;
