//! Event types for the replica engine.

use crate::TimerId;
use lockstep_types::{ReplicaId, SignedMessage};

/// All possible inputs to the engine.
///
/// Events are **passive data** - they describe something that happened. The
/// engine processes one event to completion before the next; there is no
/// concurrency inside it.
#[derive(Debug, Clone)]
pub enum Event {
    /// A wire envelope arrived from another replica (or from ourselves, via
    /// broadcast loopback).
    ///
    /// `from` is the transport-level peer and is used for logging only; the
    /// authoritative author is the envelope's verified signer.
    MessageReceived {
        /// The signed envelope, already de-framed by the host.
        envelope: SignedMessage,
        /// Transport-level source.
        from: ReplicaId,
    },

    /// A client submitted a request at this replica.
    ClientRequest {
        /// Opaque request payload.
        payload: Vec<u8>,
    },

    /// A previously set timer fired.
    TimerFired {
        /// Which timer.
        id: TimerId,
    },
}
