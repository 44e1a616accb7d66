//! Replica and slot identifiers.

use sbor::prelude::BasicSbor;

/// Stable identifier of a replica, in `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub struct ReplicaId(pub u64);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The primary (leader) of a view: `view mod N`.
pub fn primary_of(view: u64, n: u64) -> ReplicaId {
    ReplicaId(view % n)
}

/// A slot identifies one position in the ordered batch log: a `(view, seq)`
/// pair. Sequence numbers are 1-based and monotonic; slots are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub struct Slot {
    /// Leadership epoch.
    pub view: u64,
    /// Batch number; `seq = 0` is reserved for "nothing assigned yet".
    pub seq: u64,
}

impl Slot {
    /// Construct a slot.
    pub fn new(view: u64, seq: u64) -> Self {
        Self { view, seq }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.view, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_rotates_through_replicas() {
        assert_eq!(primary_of(0, 4), ReplicaId(0));
        assert_eq!(primary_of(1, 4), ReplicaId(1));
        assert_eq!(primary_of(4, 4), ReplicaId(0));
        assert_eq!(primary_of(7, 4), ReplicaId(3));
    }
}
