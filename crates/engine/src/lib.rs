//! The Lockstep replica engine.
//!
//! A Byzantine fault tolerant replication engine: N replicas, up to F of
//! them faulty (N ≥ 3F+1), agree on an ordered sequence of client request
//! batches. The engine is a synchronous state machine driven by three event
//! sources (inbound messages, client requests, and timer fires), and all
//! I/O happens through the actions it returns.
//!
//! # Protocol
//!
//! Normal case, per slot `(view, seq)`:
//!
//! ```text
//! Request ──► batching (primary) ──► Preprepare (broadcast)
//!   each replica, on valid Preprepare:        broadcast Prepare
//!   on 2F matching non-primary Prepares:      broadcast Commit
//!   on 2F+1 matching Commits, in seq order:   Deliver(batch)
//! ```
//!
//! Liveness: every accepted request arms a timer; if it expires before the
//! request is delivered, the replica broadcasts a ViewChange for `view + 1`.
//! The new primary collects `2F+1` of them, computes which batches the
//! evidence forces into the new view, and broadcasts a NewView that every
//! replica re-validates independently.
//!
//! # Safety
//!
//! - A replica accepts at most one Preprepare per `(view, seq)`; a signer's
//!   first Prepare/Commit for a slot binds it to one digest.
//! - `prepared` requires a valid Preprepare plus `2F` matching prepares
//!   from distinct non-primary signers; `committed` requires `prepared`
//!   plus `2F+1` matching commits. Any two quorums intersect in an honest
//!   replica, so a slot commits at most one batch.
//! - Delivery is strictly in-order and gapless; `view` never decreases.

mod config;
mod recovery;
mod slot;
mod state;
mod view_change;

pub use config::{Config, ConfigError};
pub use recovery::{request_key, RecoveredState, PSET_KEY, QSET_KEY, REQ_PREFIX};
pub use state::Replica;
