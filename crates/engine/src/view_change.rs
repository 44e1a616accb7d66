//! View change: liveness recovery when the primary is suspected faulty.
//!
//! A replica initiates a view change when a request timer fires (something
//! it accepted has not been delivered in time) or when `F+1` peers are
//! already asking for a higher view (catch-up: at least one of them is
//! honest). The designated primary of the target view collects `2F+1`
//! ViewChange messages, computes which batches must survive into the new
//! view, and broadcasts a NewView carrying the evidence. Every replica
//! re-verifies the evidence and recomputes the selection independently
//! before adopting the view.

use crate::config::Config;
use crate::state::Replica;
use lockstep_core::{Action, TimerId};
use lockstep_types::{
    decode_payload, Digest, Message, NewView, PqEntry, Preprepare, ReplicaId, SignedMessage, Slot,
    ViewChange,
};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, trace, warn};

impl Replica {
    /// Begin changing to `target`. Idempotent for targets at or below the
    /// one already in progress.
    pub(crate) fn start_view_change(&mut self, target: u64, actions: &mut Vec<Action>) {
        if target <= self.view {
            return;
        }
        if self.in_view_change && target <= self.vc_target {
            return;
        }

        info!(id = %self.id, view = self.view, target, "starting view change");
        self.in_view_change = true;
        self.vc_target = target;

        // Primary duties end here; buffered requests stay in the store and
        // are re-proposed by the new primary.
        self.batch.clear();
        if self.batch_timer_armed {
            self.batch_timer_armed = false;
            actions.push(Action::CancelTimer { id: TimerId::Batch });
        }

        // Fresh patience for the new view: every undelivered request gets a
        // full timeout again.
        let mut digests: Vec<Digest> = self.requests.keys().copied().collect();
        digests.sort();
        for digest in digests {
            self.timed.insert(digest);
            actions.push(Action::SetTimer {
                id: TimerId::Request(digest),
                duration: self.config.request_timeout,
            });
        }

        self.persist_pset(actions);
        self.persist_qset(actions);

        let vc = ViewChange {
            new_view: target,
            last_exec: self.last_exec,
            pset: self.current_pset(),
            qset: self.current_qset(),
        };
        self.push_broadcast(Message::ViewChange(vc), actions);
    }

    /// Record a peer's ViewChange (our own arrives here too, via loopback).
    pub(crate) fn on_view_change(
        &mut self,
        envelope: SignedMessage,
        vc: ViewChange,
        src: ReplicaId,
        actions: &mut Vec<Action>,
    ) {
        if vc.new_view <= self.view {
            debug!(new_view = vc.new_view, view = self.view, "dropping stale view change");
            return;
        }
        if vc
            .pset
            .iter()
            .chain(vc.qset.iter())
            .any(|e| !e.digest_consistent())
        {
            warn!(%src, "dropping view change with inconsistent evidence");
            return;
        }

        let senders = self.view_changes.entry(vc.new_view).or_default();
        if senders.contains_key(&src) {
            trace!(new_view = vc.new_view, %src, "duplicate view change");
            return;
        }
        senders.insert(src, (envelope, vc.clone()));
        debug!(
            id = %self.id,
            new_view = vc.new_view,
            %src,
            count = senders.len(),
            "recorded view change"
        );

        self.maybe_join_view_change(actions);
        self.maybe_send_new_view(vc.new_view, actions);
    }

    /// Catch-up trigger: if `F+1` distinct replicas want a view above ours,
    /// at least one honest replica timed out; join them.
    fn maybe_join_view_change(&mut self, actions: &mut Vec<Action>) {
        let mut targets: BTreeMap<ReplicaId, u64> = BTreeMap::new();
        for (target, senders) in &self.view_changes {
            if *target <= self.view {
                continue;
            }
            for sender in senders.keys() {
                let entry = targets.entry(*sender).or_insert(*target);
                *entry = (*entry).max(*target);
            }
        }

        let mut sorted: Vec<u64> = targets.into_values().collect();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        let weak = self.config.weak_quorum();
        if sorted.len() < weak {
            return;
        }
        // The F+1-th highest target is wanted by at least F+1 replicas.
        let target = sorted[weak - 1];
        let current = if self.in_view_change {
            self.vc_target
        } else {
            self.view
        };
        if target > current {
            info!(id = %self.id, target, "joining view change");
            self.start_view_change(target, actions);
        }
    }

    /// As primary-elect of `target`, broadcast a NewView once a quorum of
    /// ViewChange messages allows a decision for every affected slot.
    fn maybe_send_new_view(&mut self, target: u64, actions: &mut Vec<Action>) {
        if self.primary_of_view(target) != self.id || self.new_view_sent.contains(&target) {
            return;
        }
        let Some(senders) = self.view_changes.get(&target) else {
            return;
        };
        if senders.len() < self.config.quorum() {
            return;
        }

        let vcs: BTreeMap<ReplicaId, ViewChange> = senders
            .iter()
            .map(|(id, (_, vc))| (*id, vc.clone()))
            .collect();
        let Some(preprepares) = compute_new_view(target, &vcs, &self.config) else {
            // Some slot is still undecidable with this evidence; wait for
            // more ViewChange messages.
            debug!(id = %self.id, target, "new view evidence incomplete, waiting");
            return;
        };

        let view_changes: Vec<SignedMessage> =
            senders.values().map(|(env, _)| env.clone()).collect();
        info!(
            id = %self.id,
            new_view = target,
            slots = preprepares.len(),
            "broadcasting new view"
        );
        self.new_view_sent.insert(target);
        self.push_broadcast(
            Message::NewView(NewView {
                new_view: target,
                view_changes,
                preprepares,
            }),
            actions,
        );
    }

    /// Validate a NewView and adopt the view if the embedded evidence
    /// justifies exactly the preprepares it carries.
    pub(crate) fn on_new_view(&mut self, nv: NewView, src: ReplicaId, actions: &mut Vec<Action>) {
        if nv.new_view <= self.view {
            debug!(new_view = nv.new_view, view = self.view, "dropping stale new view");
            return;
        }
        if src != self.primary_of_view(nv.new_view) {
            warn!(new_view = nv.new_view, %src, "dropping new view from non-primary");
            return;
        }

        // Re-verify the embedded ViewChange envelopes; distinct valid
        // signers only.
        let mut vcs: BTreeMap<ReplicaId, ViewChange> = BTreeMap::new();
        for envelope in &nv.view_changes {
            if envelope.signer.0 >= self.config.n {
                debug!(signer = %envelope.signer, "embedded view change from unknown signer");
                continue;
            }
            if !self
                .signer
                .check_sig(&envelope.payload, envelope.signer, &envelope.signature)
            {
                debug!(signer = %envelope.signer, "embedded view change has bad signature");
                continue;
            }
            let Ok(Message::ViewChange(vc)) = decode_payload(&envelope.payload) else {
                debug!(signer = %envelope.signer, "embedded payload is not a view change");
                continue;
            };
            if vc.new_view != nv.new_view {
                debug!(signer = %envelope.signer, "embedded view change targets another view");
                continue;
            }
            if vc
                .pset
                .iter()
                .chain(vc.qset.iter())
                .any(|e| !e.digest_consistent())
            {
                debug!(signer = %envelope.signer, "embedded view change evidence inconsistent");
                continue;
            }
            vcs.entry(envelope.signer).or_insert(vc);
        }

        if vcs.len() < self.config.quorum() {
            warn!(
                new_view = nv.new_view,
                valid = vcs.len(),
                "new view lacks a quorum of valid view changes"
            );
            return;
        }

        // Recompute the selection independently; the new primary does not
        // get to pick batches the evidence does not force.
        let expected = compute_new_view(nv.new_view, &vcs, &self.config);
        if expected.as_deref() != Some(nv.preprepares.as_slice()) {
            warn!(
                id = %self.id,
                new_view = nv.new_view,
                "new view selection mismatch, escalating"
            );
            self.start_view_change(nv.new_view + 1, actions);
            return;
        }

        self.adopt_new_view(nv.new_view, nv.preprepares, actions);
    }

    fn adopt_new_view(
        &mut self,
        new_view: u64,
        preprepares: Vec<Preprepare>,
        actions: &mut Vec<Action>,
    ) {
        info!(id = %self.id, old_view = self.view, new_view, "installing new view");
        self.view = new_view;
        self.in_view_change = false;
        self.vc_target = new_view;
        self.view_changes.retain(|target, _| *target > new_view);
        self.new_view_sent.retain(|target| *target > new_view);

        let high = preprepares
            .iter()
            .map(|pp| pp.slot.seq)
            .max()
            .unwrap_or(self.last_exec)
            .max(self.last_exec);
        // Assignments made in dead views are void; the new view continues
        // from the installed evidence.
        self.seq = high;
        self.accepted_seq = high;

        for pp in preprepares {
            if pp.slot.seq <= self.last_exec {
                continue;
            }
            let resolvable = pp
                .request_digests
                .iter()
                .all(|d| self.requests.contains_key(d));
            if resolvable {
                self.accept_preprepare(pp, actions);
            } else {
                debug!(slot = %pp.slot, "parking installed preprepare until requests arrive");
                let entry = self.slot_entry(pp.slot.seq);
                entry.parked = Some(pp);
            }
        }

        // The new primary re-proposes everything still pending that the
        // installed slots do not cover.
        if self.is_primary() {
            let mut pending: Vec<_> = self
                .requests
                .values()
                .filter(|r| !self.in_flight(&r.digest()))
                .cloned()
                .collect();
            pending.sort_by_key(|r| r.digest());
            for request in pending {
                self.enqueue_for_batch(request, actions);
            }
        }
    }
}

/// Compute the preprepares a NewView for `new_view` must install, given a
/// set of ViewChange messages from distinct senders.
///
/// For each slot between the lowest delivered sequence among the senders and
/// the highest slot with prepared evidence, pick the digest the evidence
/// forces, or a no-op when a quorum reports no prepared certificate at all.
/// Returns `None` when some slot is undecidable with this evidence; the
/// caller then waits for more ViewChange messages.
fn compute_new_view(
    new_view: u64,
    vcs: &BTreeMap<ReplicaId, ViewChange>,
    config: &Config,
) -> Option<Vec<Preprepare>> {
    let low = vcs.values().map(|vc| vc.last_exec).min()?;
    let high = vcs
        .values()
        .flat_map(|vc| vc.pset.iter().map(|e| e.seq))
        .max()
        .unwrap_or(low);

    let mut preprepares = Vec::new();
    for seq in (low + 1)..=high {
        // Candidate digests, highest prepared view first, one entry per
        // digest.
        let mut candidates: Vec<&PqEntry> =
            vcs.values().filter_map(|vc| vc.p_entry(seq)).collect();
        candidates.sort_by(|a, b| {
            b.view
                .cmp(&a.view)
                .then_with(|| a.batch_digest.cmp(&b.batch_digest))
        });
        let mut seen = HashSet::new();
        candidates.retain(|e| seen.insert(e.batch_digest));

        let mut chosen: Option<&PqEntry> = None;
        for candidate in candidates {
            if selection_holds(seq, candidate, vcs, config) {
                chosen = Some(candidate);
                break;
            }
        }

        match chosen {
            Some(candidate) => preprepares.push(Preprepare {
                slot: Slot::new(new_view, seq),
                batch_digest: candidate.batch_digest,
                request_digests: candidate.request_digests.clone(),
            }),
            None => {
                let blank = vcs
                    .values()
                    .filter(|vc| vc.p_entry(seq).is_none())
                    .count();
                if blank >= config.quorum() {
                    preprepares.push(Preprepare::noop(Slot::new(new_view, seq)));
                } else {
                    return None;
                }
            }
        }
    }
    Some(preprepares)
}

/// The selection rule for one candidate `(d*, v*)` at slot `seq`:
///
/// - at least `F+1` senders have no prepared certificate for the slot above
///   `v*`, or have one with digest `d*` (some honest replica vouches for the
///   certificate), and
/// - at least `2F+1` senders either saw a preprepare for `(seq, d*)` at view
///   `≥ v*`, or report no preprepare for the slot with a different digest
///   above `v*` (nothing contradicts it).
fn selection_holds(
    seq: u64,
    candidate: &PqEntry,
    vcs: &BTreeMap<ReplicaId, ViewChange>,
    config: &Config,
) -> bool {
    let anchored = vcs
        .values()
        .filter(|vc| match vc.p_entry(seq) {
            None => true,
            Some(e) => e.view <= candidate.view || e.batch_digest == candidate.batch_digest,
        })
        .count();
    if anchored < config.weak_quorum() {
        return false;
    }

    let supported = vcs
        .values()
        .filter(|vc| {
            let direct = vc.qset.iter().any(|e| {
                e.seq == seq
                    && e.batch_digest == candidate.batch_digest
                    && e.view >= candidate.view
            });
            let conflicting = vc.qset.iter().any(|e| {
                e.seq == seq
                    && e.batch_digest != candidate.batch_digest
                    && e.view > candidate.view
            });
            direct || !conflicting
        })
        .count();
    supported >= config.quorum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{broadcasts, config, receive, replica, signed};
    use lockstep_core::{Event, StateMachine};
    use lockstep_types::Request;
    use tracing_test::traced_test;

    fn pq(seq: u64, view: u64, reqs: &[&[u8]]) -> PqEntry {
        let digests: Vec<Digest> = reqs.iter().map(|r| Digest::of(r)).collect();
        PqEntry {
            seq,
            view,
            batch_digest: Digest::of_digests(digests.iter()),
            request_digests: digests,
        }
    }

    fn vc_message(new_view: u64, last_exec: u64, pset: Vec<PqEntry>, qset: Vec<PqEntry>) -> ViewChange {
        ViewChange {
            new_view,
            last_exec,
            pset,
            qset,
        }
    }

    #[test]
    fn selection_keeps_the_prepared_digest() {
        let cfg = config(4, 1);
        let prepared = pq(1, 0, &[b"abc"]);
        let mut vcs = BTreeMap::new();
        // All four replicas prepared slot 1 in view 0 (commits were lost).
        for i in 0..4 {
            vcs.insert(
                ReplicaId(i),
                vc_message(1, 0, vec![prepared.clone()], vec![prepared.clone()]),
            );
        }
        let pps = compute_new_view(1, &vcs, &cfg).unwrap();
        assert_eq!(pps.len(), 1);
        assert_eq!(pps[0].slot, Slot::new(1, 1));
        assert_eq!(pps[0].batch_digest, prepared.batch_digest);
    }

    #[test]
    fn selection_with_no_evidence_installs_nothing() {
        let cfg = config(4, 1);
        let mut vcs = BTreeMap::new();
        for i in 0..3 {
            vcs.insert(ReplicaId(i), vc_message(1, 0, vec![], vec![]));
        }
        assert_eq!(compute_new_view(1, &vcs, &cfg), Some(vec![]));
    }

    #[test]
    fn selection_fills_gaps_with_noops() {
        let cfg = config(4, 1);
        let prepared = pq(2, 0, &[b"later"]);
        let mut vcs = BTreeMap::new();
        // Only slot 2 was prepared anywhere; slot 1 gets a no-op filler.
        vcs.insert(
            ReplicaId(0),
            vc_message(1, 0, vec![prepared.clone()], vec![prepared.clone()]),
        );
        for i in 1..4 {
            vcs.insert(ReplicaId(i), vc_message(1, 0, vec![], vec![]));
        }
        let pps = compute_new_view(1, &vcs, &cfg).unwrap();
        assert_eq!(pps.len(), 2);
        assert!(pps[0].is_noop());
        assert_eq!(pps[0].slot, Slot::new(1, 1));
        assert_eq!(pps[1].batch_digest, prepared.batch_digest);
    }

    #[test]
    fn selection_prefers_the_supported_fork_after_equivocation() {
        let cfg = config(4, 1);
        let fork_a = pq(1, 0, &[b"one", b"two"]);
        let fork_b = pq(1, 0, &[b"two", b"one"]);
        let mut vcs = BTreeMap::new();
        // Replicas 2 and 3 prepared fork B; 0 and 1 only preprepared fork A.
        vcs.insert(ReplicaId(0), vc_message(1, 0, vec![], vec![fork_a.clone()]));
        vcs.insert(ReplicaId(1), vc_message(1, 0, vec![], vec![fork_a.clone()]));
        vcs.insert(
            ReplicaId(2),
            vc_message(1, 0, vec![fork_b.clone()], vec![fork_b.clone()]),
        );
        vcs.insert(
            ReplicaId(3),
            vc_message(1, 0, vec![fork_b.clone()], vec![fork_b.clone()]),
        );
        let pps = compute_new_view(1, &vcs, &cfg).unwrap();
        assert_eq!(pps.len(), 1);
        assert_eq!(pps[0].batch_digest, fork_b.batch_digest);
    }

    #[test]
    fn selection_waits_when_undecidable() {
        let cfg = config(4, 1);
        let prepared = pq(1, 0, &[b"abc"]);
        let mut vcs = BTreeMap::new();
        // One prepared report, two blanks: neither the certificate nor the
        // no-op is justified yet.
        vcs.insert(
            ReplicaId(2),
            vc_message(1, 0, vec![prepared.clone()], vec![prepared.clone()]),
        );
        // A sender claiming a conflicting higher-view preprepare blocks
        // support.
        let conflict = pq(1, 1, &[b"zzz"]);
        vcs.insert(ReplicaId(0), vc_message(1, 0, vec![], vec![conflict]));
        vcs.insert(ReplicaId(1), vc_message(1, 0, vec![], vec![]));
        assert_eq!(compute_new_view(1, &vcs, &cfg), None);
    }

    #[traced_test]
    #[test]
    fn catch_up_joins_on_weak_quorum() {
        let mut r = replica(3, 4, 1);
        let vc = vc_message(1, 0, vec![], vec![]);
        receive(&mut r, ReplicaId(0), Message::ViewChange(vc.clone()));
        assert!(!r.in_view_change());
        // Second distinct sender reaches F+1 = 2.
        let actions = receive(&mut r, ReplicaId(2), Message::ViewChange(vc));
        assert!(r.in_view_change());
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, Message::ViewChange(vc) if vc.new_view == 1)));
    }

    #[traced_test]
    #[test]
    fn primary_elect_emits_new_view_on_quorum() {
        let mut r = replica(1, 4, 1);
        let vc = vc_message(1, 0, vec![], vec![]);
        receive(&mut r, ReplicaId(0), Message::ViewChange(vc.clone()));
        receive(&mut r, ReplicaId(2), Message::ViewChange(vc.clone()));
        // Joining broadcast its own view change; loop it back for quorum.
        let own = vc_message(1, 0, vec![], vec![]);
        let actions = receive(&mut r, ReplicaId(1), Message::ViewChange(own));
        let nv = broadcasts(&actions)
            .into_iter()
            .find_map(|m| match m {
                Message::NewView(nv) => Some(nv),
                _ => None,
            })
            .expect("primary-elect should broadcast a new view");
        assert_eq!(nv.new_view, 1);
        assert_eq!(nv.view_changes.len(), 3);
        assert!(nv.preprepares.is_empty());
    }

    #[traced_test]
    #[test]
    fn new_view_is_adopted_and_prepares_follow() {
        let mut r = replica(3, 4, 1);
        // The replica knows the request, so the installed slot is
        // immediately preparable.
        receive(
            &mut r,
            ReplicaId(0),
            Message::Request(Request::new(b"abc".to_vec())),
        );

        let prepared = pq(1, 0, &[b"abc"]);
        let envelopes: Vec<SignedMessage> = (0..3)
            .map(|i| {
                signed(
                    ReplicaId(i),
                    &Message::ViewChange(vc_message(
                        1,
                        0,
                        vec![prepared.clone()],
                        vec![prepared.clone()],
                    )),
                )
            })
            .collect();
        let nv = NewView {
            new_view: 1,
            view_changes: envelopes,
            preprepares: vec![Preprepare {
                slot: Slot::new(1, 1),
                batch_digest: prepared.batch_digest,
                request_digests: prepared.request_digests.clone(),
            }],
        };

        let actions = receive(&mut r, ReplicaId(1), Message::NewView(nv));
        assert_eq!(r.view(), 1);
        assert!(!r.in_view_change());
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, Message::Prepare(p) if p.slot == Slot::new(1, 1))));
    }

    #[traced_test]
    #[test]
    fn mistaken_new_view_escalates() {
        let mut r = replica(3, 4, 1);
        let prepared = pq(1, 0, &[b"abc"]);
        let envelopes: Vec<SignedMessage> = (0..3)
            .map(|i| {
                signed(
                    ReplicaId(i),
                    &Message::ViewChange(vc_message(
                        1,
                        0,
                        vec![prepared.clone()],
                        vec![prepared.clone()],
                    )),
                )
            })
            .collect();
        // The primary-elect claims a no-op where the evidence forces a
        // batch.
        let nv = NewView {
            new_view: 1,
            view_changes: envelopes,
            preprepares: vec![Preprepare::noop(Slot::new(1, 1))],
        };
        let actions = receive(&mut r, ReplicaId(1), Message::NewView(nv));
        assert_eq!(r.view(), 0);
        assert!(r.in_view_change());
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, Message::ViewChange(vc) if vc.new_view == 2)));
    }

    #[traced_test]
    #[test]
    fn new_view_without_quorum_is_dropped() {
        let mut r = replica(3, 4, 1);
        let envelopes: Vec<SignedMessage> = (0..2)
            .map(|i| {
                signed(
                    ReplicaId(i),
                    &Message::ViewChange(vc_message(1, 0, vec![], vec![])),
                )
            })
            .collect();
        let nv = NewView {
            new_view: 1,
            view_changes: envelopes,
            preprepares: vec![],
        };
        let actions = receive(&mut r, ReplicaId(1), Message::NewView(nv));
        assert_eq!(r.view(), 0);
        assert!(actions.is_empty());
    }

    #[traced_test]
    #[test]
    fn view_change_rearms_request_timers() {
        let mut r = replica(2, 4, 1);
        let req = Request::new(vec![5]);
        receive(&mut r, ReplicaId(0), Message::Request(req.clone()));
        let actions = r.handle(Event::TimerFired {
            id: TimerId::Request(req.digest()),
        });
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer { id: TimerId::Request(d), .. } if *d == req.digest()
        )));
    }
}
