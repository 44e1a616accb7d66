//! Per-slot log entries.

use lockstep_types::{Digest, Preprepare, ReplicaId};
use std::collections::BTreeMap;

/// Outcome of recording a vote from a signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Record {
    /// First vote from this signer for the slot.
    Added,
    /// Same signer, same digest: idempotent redelivery.
    Duplicate,
    /// Same signer, different digest: byzantine evidence, dropped.
    Equivocation,
}

/// Log entry for one slot of one view.
///
/// Created on the first valid message for the slot and mutated only by the
/// engine. Entries are retained after delivery; log truncation is out of
/// scope.
#[derive(Debug, Clone)]
pub(crate) struct SlotEntry {
    /// The view this entry belongs to. A view change replaces the entry
    /// wholesale; counters never mix across views.
    pub view: u64,
    /// The accepted preprepare, at most one per `(view, seq)`.
    pub preprepare: Option<Preprepare>,
    /// A preprepare waiting for missing requests, bounded by the request
    /// timer.
    pub parked: Option<Preprepare>,
    /// First prepare digest per signer.
    pub prepares: BTreeMap<ReplicaId, Digest>,
    /// First commit digest per signer.
    pub commits: BTreeMap<ReplicaId, Digest>,
    /// Prepared certificate reached.
    pub prepared: bool,
    /// Commit quorum reached.
    pub committed: bool,
    /// Batch handed to the host (or skipped, for no-op fillers).
    pub delivered: bool,
}

impl SlotEntry {
    pub fn new(view: u64) -> Self {
        Self {
            view,
            preprepare: None,
            parked: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            prepared: false,
            committed: false,
            delivered: false,
        }
    }

    /// The accepted batch digest, if a preprepare has been accepted.
    pub fn digest(&self) -> Option<Digest> {
        self.preprepare.as_ref().map(|pp| pp.batch_digest)
    }

    /// Record a prepare; the first digest per signer binds that signer.
    pub fn record_prepare(&mut self, signer: ReplicaId, digest: Digest) -> Record {
        Self::record(&mut self.prepares, signer, digest)
    }

    /// Record a commit; the first digest per signer binds that signer.
    pub fn record_commit(&mut self, signer: ReplicaId, digest: Digest) -> Record {
        Self::record(&mut self.commits, signer, digest)
    }

    fn record(votes: &mut BTreeMap<ReplicaId, Digest>, signer: ReplicaId, digest: Digest) -> Record {
        match votes.get(&signer) {
            None => {
                votes.insert(signer, digest);
                Record::Added
            }
            Some(existing) if *existing == digest => Record::Duplicate,
            Some(_) => Record::Equivocation,
        }
    }

    /// Distinct prepares matching `digest`, excluding the primary (whose
    /// preprepare stands in for its prepare).
    pub fn matching_prepares(&self, digest: Digest, primary: ReplicaId) -> usize {
        self.prepares
            .iter()
            .filter(|(signer, d)| **signer != primary && **d == digest)
            .count()
    }

    /// Distinct commits matching `digest`.
    pub fn matching_commits(&self, digest: Digest) -> usize {
        self.commits.values().filter(|d| **d == digest).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(tag: u8) -> Digest {
        Digest::of(&[tag])
    }

    #[test]
    fn first_vote_binds_the_signer() {
        let mut entry = SlotEntry::new(0);
        assert_eq!(entry.record_prepare(ReplicaId(1), digest(1)), Record::Added);
        assert_eq!(
            entry.record_prepare(ReplicaId(1), digest(1)),
            Record::Duplicate
        );
        assert_eq!(
            entry.record_prepare(ReplicaId(1), digest(2)),
            Record::Equivocation
        );
        // The binding survives the equivocation attempt.
        assert_eq!(entry.matching_prepares(digest(1), ReplicaId(0)), 1);
        assert_eq!(entry.matching_prepares(digest(2), ReplicaId(0)), 0);
    }

    #[test]
    fn prepare_count_excludes_the_primary() {
        let mut entry = SlotEntry::new(0);
        entry.record_prepare(ReplicaId(0), digest(7));
        entry.record_prepare(ReplicaId(1), digest(7));
        entry.record_prepare(ReplicaId(2), digest(7));
        assert_eq!(entry.matching_prepares(digest(7), ReplicaId(0)), 2);
        assert_eq!(entry.matching_prepares(digest(7), ReplicaId(3)), 3);
    }

    #[test]
    fn commit_count_is_digest_scoped() {
        let mut entry = SlotEntry::new(0);
        entry.record_commit(ReplicaId(0), digest(7));
        entry.record_commit(ReplicaId(1), digest(8));
        entry.record_commit(ReplicaId(2), digest(7));
        assert_eq!(entry.matching_commits(digest(7)), 2);
        assert_eq!(entry.matching_commits(digest(8)), 1);
    }
}
