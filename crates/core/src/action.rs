//! Action types for the replica engine.

use crate::TimerId;
use lockstep_types::{ReplicaId, SignedMessage};
use std::time::Duration;

/// Actions the engine wants its host to perform.
///
/// Actions are **commands** - they describe something to do. The host
/// executes them and may convert results back into events (timer fires,
/// inbound messages).
#[derive(Debug, Clone)]
pub enum Action {
    /// Send an envelope to every replica, **including this one** (loopback).
    ///
    /// Loopback keeps quorum counting uniform: a replica counts its own
    /// prepares and commits when they arrive like anyone else's.
    Broadcast {
        /// The signed envelope to send.
        envelope: SignedMessage,
    },

    /// Send an envelope to a single replica. Best-effort: no delivery or
    /// ordering guarantee, duplication permitted.
    Send {
        /// Destination replica.
        to: ReplicaId,
        /// The signed envelope to send.
        envelope: SignedMessage,
    },

    /// Arm a one-shot timer. Replaces an already-armed timer with the same
    /// id.
    SetTimer {
        /// Timer identity.
        id: TimerId,
        /// Delay until the fire.
        duration: Duration,
    },

    /// Disarm a timer. No-op if the timer is not armed.
    CancelTimer {
        /// Timer identity.
        id: TimerId,
    },

    /// Deliver an agreed batch to the host's executor.
    ///
    /// Invoked in strictly increasing `seq` order with no gaps. The host
    /// must treat this as total and deterministic; recording `seq` is what
    /// backs `StateStore::last_seq_no` across restarts.
    Deliver {
        /// Sequence number of the delivered slot.
        seq: u64,
        /// Request payloads in batch order.
        batch: Vec<Vec<u8>>,
    },

    /// Write a value to the host's state store.
    Persist {
        /// Store key.
        key: String,
        /// Encoded value.
        value: Vec<u8>,
    },

    /// Delete a key from the host's state store.
    PersistDelete {
        /// Store key.
        key: String,
    },
}

impl Action {
    /// Get the action type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Send { .. } => "Send",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::Deliver { .. } => "Deliver",
            Action::Persist { .. } => "Persist",
            Action::PersistDelete { .. } => "PersistDelete",
        }
    }

    /// Check if this action touches the network.
    pub fn is_network(&self) -> bool {
        matches!(self, Action::Broadcast { .. } | Action::Send { .. })
    }

    /// Check if this action touches the state store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Action::Persist { .. } | Action::PersistDelete { .. })
    }
}
