//! Protocol messages.
//!
//! The wire messages are a closed set of variants; every inter-replica
//! message is one [`Message`] serialized canonically and wrapped in a
//! [`SignedMessage`] envelope. The signature covers the payload bytes
//! exactly, so verification is independent of transport identity.

use crate::{Digest, ReplicaId, Request, Slot};
use sbor::prelude::BasicSbor;

/// Batch proposal from the primary of a view.
///
/// Carries the ordered request-digest list; the batch digest is the hash of
/// that list. Replicas resolve the payloads through their request stores.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Preprepare {
    /// The slot this batch is assigned to.
    pub slot: Slot,
    /// Hash over `request_digests`, in order.
    pub batch_digest: Digest,
    /// Digests of the batched requests, in delivery order. Empty only for
    /// the no-op fillers a view change installs.
    pub request_digests: Vec<Digest>,
}

impl Preprepare {
    /// A no-op preprepare: fills a slot with an empty batch during view
    /// change so later slots can deliver.
    pub fn noop(slot: Slot) -> Self {
        Self {
            slot,
            batch_digest: Digest::of_digests([]),
            request_digests: Vec::new(),
        }
    }

    /// Whether this is a no-op filler.
    pub fn is_noop(&self) -> bool {
        self.request_digests.is_empty()
    }

    /// Whether the batch digest matches the request-digest list.
    pub fn digest_consistent(&self) -> bool {
        self.batch_digest == Digest::of_digests(self.request_digests.iter())
    }
}

/// Agreement vote, phase two.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Prepare {
    /// The slot being voted on.
    pub slot: Slot,
    /// The batch digest this signer binds itself to for the slot.
    pub batch_digest: Digest,
}

/// Agreement vote, phase three.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Commit {
    /// The slot being committed.
    pub slot: Slot,
    /// The batch digest being committed.
    pub batch_digest: Digest,
}

/// One P-set or Q-set evidence record carried in a view change.
///
/// A P entry records the highest view at which the sender held a prepared
/// certificate for `seq`; a Q entry records the highest view at which it
/// accepted a preprepare for `(seq, batch_digest)`. The ordered
/// request-digest list rides along so a new primary can materialize the
/// preprepare for a chosen digest; the list is self-certifying against
/// `batch_digest`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PqEntry {
    /// Sequence number of the slot.
    pub seq: u64,
    /// Highest view at which the evidence was observed.
    pub view: u64,
    /// Batch digest of the slot at that view.
    pub batch_digest: Digest,
    /// Ordered request digests composing the batch.
    pub request_digests: Vec<Digest>,
}

impl PqEntry {
    /// Whether the batch digest matches the request-digest list.
    pub fn digest_consistent(&self) -> bool {
        self.batch_digest == Digest::of_digests(self.request_digests.iter())
    }
}

/// Announcement that the sender wants to move to `new_view`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ViewChange {
    /// The view the sender wants to install.
    pub new_view: u64,
    /// Highest sequence the sender has delivered.
    pub last_exec: u64,
    /// Prepared-certificate evidence, one entry per slot.
    pub pset: Vec<PqEntry>,
    /// Preprepare evidence, one entry per `(slot, digest)`.
    pub qset: Vec<PqEntry>,
}

impl ViewChange {
    /// The sender's P entry for a slot, if any.
    pub fn p_entry(&self, seq: u64) -> Option<&PqEntry> {
        self.pset.iter().find(|e| e.seq == seq)
    }
}

/// The new primary's proof that `new_view` may start, with the preprepares
/// every replica must install before resuming normal operation.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewView {
    /// The view being installed.
    pub new_view: u64,
    /// At least `2F+1` distinct-signer ViewChange envelopes justifying the
    /// selection below. Receivers re-verify and recompute independently.
    pub view_changes: Vec<SignedMessage>,
    /// The chosen preprepares, ascending by sequence.
    pub preprepares: Vec<Preprepare>,
}

/// The closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum Message {
    /// A client request, broadcast by the replica that accepted it.
    Request(Request),
    /// Batch proposal from the primary.
    Preprepare(Preprepare),
    /// Phase-two vote.
    Prepare(Prepare),
    /// Phase-three vote.
    Commit(Commit),
    /// View change announcement.
    ViewChange(ViewChange),
    /// New view installation from the new primary.
    NewView(NewView),
}

impl Message {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request(_) => "Request",
            Message::Preprepare(_) => "Preprepare",
            Message::Prepare(_) => "Prepare",
            Message::Commit(_) => "Commit",
            Message::ViewChange(_) => "ViewChange",
            Message::NewView(_) => "NewView",
        }
    }
}

/// The signed envelope: the only thing that travels between replicas.
///
/// `payload` is the canonical SBOR encoding of exactly one [`Message`]. The
/// signature covers `payload` exactly and is verified against the signer's
/// registered public key, never against the transport identity.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SignedMessage {
    /// Canonical message bytes.
    pub payload: Vec<u8>,
    /// Claimed author, in `[0, N)`.
    pub signer: ReplicaId,
    /// Signature over `payload`.
    pub signature: Vec<u8>,
}
