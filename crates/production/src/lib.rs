//! Production host for the Lockstep engine.
//!
//! The engine itself performs no I/O; this crate supplies the host side:
//!
//! - [`transport`]: mutually-authenticated TLS links between replicas, with
//!   per-peer certificate pinning
//! - [`storage`]: RocksDB-backed state store
//! - [`timers`]: tokio-backed one-shot timers
//! - [`runner`]: the event loop funnelling messages, client requests, and
//!   timer fires into the engine and executing its actions
//! - [`keys`]: Ed25519 signer over a static public-key registry
//! - [`telemetry`]: tracing subscriber initialization

pub mod keys;
pub mod runner;
pub mod storage;
pub mod telemetry;
pub mod timers;
pub mod tls;
pub mod transport;

pub use keys::KeyRegistrySigner;
pub use runner::{ClientHandle, DeliverFn, ProductionRunner, RunnerError, ShutdownHandle};
pub use storage::{RocksDbStore, StorageError};
pub use timers::TimerManager;
pub use tls::{certificate_fingerprint, TlsError, TlsIdentity};
pub use transport::{PeerConfig, Transport, TransportError};
