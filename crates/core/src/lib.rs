//! Core boundary types for the Lockstep engine.
//!
//! This crate defines the contract between the replica engine and its hosts:
//!
//! - [`Event`]: all possible inputs to the engine
//! - [`Action`]: all possible outputs from the engine
//! - [`StateMachine`]: the trait the engine implements
//! - [`Signer`], [`StateStore`]: host capabilities
//!
//! # Architecture
//!
//! The engine is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The engine is:
//! - **Synchronous**: no async, no .await
//! - **Deterministic**: same state + event = same actions
//! - **Pure-ish**: mutates self, but performs no I/O
//!
//! All I/O is handled by the host (simulation or production) which:
//! 1. Delivers events to the engine
//! 2. Executes the returned actions
//! 3. Converts timer fires and inbound frames back into events

mod action;
mod event;
mod traits;

pub use action::Action;
pub use event::Event;
pub use traits::{Signer, StateMachine, StateStore};

use lockstep_types::Digest;

/// Identifies a one-shot timer owned by the engine.
///
/// Setting a timer that is already armed replaces it; cancelling one that has
/// fired is a no-op. A cancel raced against a fire may still deliver the
/// fire, so timer handlers act only on current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Primary-side batch cut-off timer.
    Batch,
    /// Per-request delivery timeout; firing initiates a view change.
    Request(Digest),
}
