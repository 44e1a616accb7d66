//! The replica protocol state machine.
//!
//! This module implements request intake and batching, the three-phase
//! normal-case agreement, and in-order batch delivery. View change logic
//! lives in `view_change.rs` as further methods on [`Replica`].
//!
//! # State Machine Flow
//!
//! 1. **Client request** → broadcast to all replicas (including self)
//! 2. **Request received** → store by digest, arm request timer; the primary
//!    buffers it and cuts a batch on size or timer
//! 3. **Preprepare received** → validate, broadcast Prepare
//! 4. **2F matching non-primary Prepares** → prepared, broadcast Commit
//! 5. **2F+1 matching Commits** → committed
//! 6. **All lower slots delivered** → deliver, advance `last_exec`

use crate::config::{Config, ConfigError};
use crate::recovery::{request_key, RecoveredState, PSET_KEY, QSET_KEY};
use crate::slot::{Record, SlotEntry};
use lockstep_core::{Action, Event, Signer, StateMachine, TimerId};
use lockstep_types::{
    decode_payload, encode_payload, primary_of, Commit, Digest, Message, PqEntry, Prepare,
    Preprepare, ReplicaId, Request, SignedMessage, Slot,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// A single replica of the replicated state machine.
///
/// Synchronous and deterministic: every event is processed to completion on
/// the host's event thread, and all I/O happens through the returned
/// [`Action`]s.
pub struct Replica {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) id: ReplicaId,
    pub(crate) config: Config,
    /// Host cryptographic capability.
    pub(crate) signer: Arc<dyn Signer>,

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol state
    // ═══════════════════════════════════════════════════════════════════════
    /// Current leadership epoch. Monotone.
    pub(crate) view: u64,
    /// Last sequence number assigned or observed. The next batch occupies
    /// `seq + 1`.
    pub(crate) seq: u64,
    /// Highest sequence with an accepted or installed preprepare; the next
    /// acceptable preprepare is `accepted_seq + 1`.
    pub(crate) accepted_seq: u64,
    /// Highest delivered sequence.
    pub(crate) last_exec: u64,
    /// Per-slot log, keyed by sequence. Entries are retained after delivery.
    pub(crate) slots: BTreeMap<u64, SlotEntry>,

    // ═══════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════
    /// Undelivered requests, keyed by digest.
    pub(crate) requests: HashMap<Digest, Request>,
    /// Digests already delivered; duplicates of these are dropped.
    pub(crate) delivered_requests: HashSet<Digest>,
    /// Request digests with an armed request timer.
    pub(crate) timed: HashSet<Digest>,
    /// The primary's pending batch.
    pub(crate) batch: Vec<Request>,
    /// Whether the batch cut-off timer is armed.
    pub(crate) batch_timer_armed: bool,

    // ═══════════════════════════════════════════════════════════════════════
    // View-change evidence
    // ═══════════════════════════════════════════════════════════════════════
    /// Highest-view prepared certificate per slot (the P-set).
    pub(crate) phist: BTreeMap<u64, PqEntry>,
    /// Highest view per `(slot, digest)` preprepare (the Q-set).
    pub(crate) qhist: BTreeMap<(u64, Digest), PqEntry>,
    /// Whether a view change is in progress.
    pub(crate) in_view_change: bool,
    /// The view being changed to, meaningful while `in_view_change`.
    pub(crate) vc_target: u64,
    /// Collected ViewChange messages: target view → signer → envelope and
    /// decoded message. The envelopes are re-broadcast inside NewView.
    pub(crate) view_changes: BTreeMap<u64, BTreeMap<ReplicaId, (SignedMessage, lockstep_types::ViewChange)>>,
    /// Views for which this replica already broadcast a NewView.
    pub(crate) new_view_sent: HashSet<u64>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("view", &self.view)
            .field("seq", &self.seq)
            .field("last_exec", &self.last_exec)
            .field("slots", &self.slots.len())
            .field("requests", &self.requests.len())
            .field("in_view_change", &self.in_view_change)
            .finish()
    }
}

impl Replica {
    /// Create a replica.
    ///
    /// `recovered` restores state persisted before a crash; use
    /// `RecoveredState::default()` for a fresh start. Fails only on invalid
    /// configuration.
    pub fn new(
        id: ReplicaId,
        config: Config,
        signer: Arc<dyn Signer>,
        recovered: RecoveredState,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let view = recovered.max_view();
        let seq = recovered.max_seq().max(recovered.last_exec);

        let mut phist = BTreeMap::new();
        for e in &recovered.pset {
            if phist.get(&e.seq).map_or(true, |x: &PqEntry| x.view <= e.view) {
                phist.insert(e.seq, e.clone());
            }
        }
        let mut qhist = BTreeMap::new();
        for e in &recovered.qset {
            let key = (e.seq, e.batch_digest);
            if qhist.get(&key).map_or(true, |x: &PqEntry| x.view <= e.view) {
                qhist.insert(key, e.clone());
            }
        }

        let requests: HashMap<Digest, Request> = recovered
            .requests
            .iter()
            .map(|r| (r.digest(), r.clone()))
            .collect();

        if view > 0 || seq > 0 || !requests.is_empty() {
            info!(
                %id,
                view,
                seq,
                last_exec = recovered.last_exec,
                pset = phist.len(),
                qset = qhist.len(),
                requests = requests.len(),
                "restored replica state"
            );
        }

        Ok(Self {
            id,
            config,
            signer,
            view,
            seq,
            accepted_seq: seq,
            last_exec: recovered.last_exec,
            slots: BTreeMap::new(),
            requests,
            delivered_requests: HashSet::new(),
            timed: HashSet::new(),
            batch: Vec::new(),
            batch_timer_armed: false,
            phist,
            qhist,
            in_view_change: false,
            vc_target: view,
            view_changes: BTreeMap::new(),
            new_view_sent: HashSet::new(),
        })
    }

    /// Arm timers for restored state. Call once after construction, before
    /// feeding events.
    pub fn bootstrap(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut digests: Vec<Digest> = self.requests.keys().copied().collect();
        digests.sort();
        for digest in digests {
            self.timed.insert(digest);
            actions.push(Action::SetTimer {
                id: TimerId::Request(digest),
                duration: self.config.request_timeout,
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Current view.
    pub fn view(&self) -> u64 {
        self.view
    }

    /// Last assigned sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Highest delivered sequence number.
    pub fn last_exec(&self) -> u64 {
        self.last_exec
    }

    /// Whether this replica leads the current view.
    pub fn is_primary(&self) -> bool {
        self.primary_of_view(self.view) == self.id
    }

    /// Whether a view change is in progress.
    pub fn in_view_change(&self) -> bool {
        self.in_view_change
    }

    pub(crate) fn primary_of_view(&self, view: u64) -> ReplicaId {
        primary_of(view, self.config.n)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event dispatch
    // ═══════════════════════════════════════════════════════════════════════

    fn on_client_request(&mut self, payload: Vec<u8>, actions: &mut Vec<Action>) {
        let request = Request::new(payload);
        debug!(id = %self.id, digest = ?request.digest(), "broadcasting client request");
        self.push_broadcast(Message::Request(request), actions);
    }

    fn on_message(&mut self, envelope: SignedMessage, from: ReplicaId, actions: &mut Vec<Action>) {
        if envelope.signer.0 >= self.config.n {
            debug!(signer = %envelope.signer, "dropping message from unknown signer");
            return;
        }
        if !self
            .signer
            .check_sig(&envelope.payload, envelope.signer, &envelope.signature)
        {
            debug!(signer = %envelope.signer, %from, "dropping message with bad signature");
            return;
        }
        let message = match decode_payload(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(signer = %envelope.signer, error = %e, "dropping undecodable message");
                return;
            }
        };

        // The verified signer is the authoritative source; the transport
        // peer is logging color only.
        let src = envelope.signer;
        trace!(id = %self.id, kind = message.type_name(), %src, "handling message");
        match message {
            Message::Request(request) => self.on_request(request, src, actions),
            Message::Preprepare(pp) => self.on_preprepare(pp, src, actions),
            Message::Prepare(prepare) => self.on_prepare(prepare, src, actions),
            Message::Commit(commit) => self.on_commit(commit, src, actions),
            Message::ViewChange(vc) => self.on_view_change(envelope, vc, src, actions),
            Message::NewView(nv) => self.on_new_view(nv, src, actions),
        }
    }

    fn on_timer(&mut self, id: TimerId, actions: &mut Vec<Action>) {
        match id {
            TimerId::Batch => {
                self.batch_timer_armed = false;
                if self.is_primary() && !self.in_view_change {
                    self.cut_batch(actions);
                }
            }
            TimerId::Request(digest) => {
                self.timed.remove(&digest);
                if !self.requests.contains_key(&digest) {
                    // Late fire after delivery; cancel raced the fire.
                    trace!(?digest, "request timer fired for delivered request");
                    return;
                }
                warn!(
                    id = %self.id,
                    view = self.view,
                    ?digest,
                    "request not delivered within timeout, starting view change"
                );
                let target = if self.in_view_change {
                    self.vc_target + 1
                } else {
                    self.view + 1
                };
                self.start_view_change(target, actions);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Request intake & batching
    // ═══════════════════════════════════════════════════════════════════════

    fn on_request(&mut self, request: Request, src: ReplicaId, actions: &mut Vec<Action>) {
        let digest = request.digest();
        if self.delivered_requests.contains(&digest) {
            trace!(?digest, "ignoring already delivered request");
            return;
        }

        if !self.requests.contains_key(&digest) {
            match sbor::basic_encode(&request) {
                Ok(value) => actions.push(Action::Persist {
                    key: request_key(&digest),
                    value,
                }),
                Err(e) => warn!(?digest, error = ?e, "could not persist request"),
            }
            self.requests.insert(digest, request.clone());
            debug!(id = %self.id, ?digest, %src, "stored request");
        }

        if !self.timed.contains(&digest) {
            self.timed.insert(digest);
            actions.push(Action::SetTimer {
                id: TimerId::Request(digest),
                duration: self.config.request_timeout,
            });
        }

        if self.is_primary() && !self.in_view_change {
            self.enqueue_for_batch(request, actions);
        }

        self.try_unpark(actions);
    }

    /// Buffer a request into the primary's pending batch, cutting on size.
    pub(crate) fn enqueue_for_batch(&mut self, request: Request, actions: &mut Vec<Action>) {
        let digest = request.digest();
        if self.batch.iter().any(|r| r.digest() == digest) || self.in_flight(&digest) {
            return;
        }
        self.batch.push(request);
        if self.batch_bytes() >= self.config.batch_size_bytes {
            self.cut_batch(actions);
        } else if !self.batch_timer_armed {
            self.batch_timer_armed = true;
            actions.push(Action::SetTimer {
                id: TimerId::Batch,
                duration: self.config.batch_duration,
            });
        }
    }

    fn batch_bytes(&self) -> u64 {
        self.batch.iter().map(|r| r.size()).sum()
    }

    /// Whether a request digest is referenced by an undelivered preprepare
    /// of the current view. Entries left over from dead views do not count;
    /// their batches are either re-installed by the view change or proposed
    /// afresh.
    pub(crate) fn in_flight(&self, digest: &Digest) -> bool {
        self.slots.values().any(|entry| {
            entry.view == self.view
                && !entry.delivered
                && entry
                    .preprepare
                    .as_ref()
                    .or(entry.parked.as_ref())
                    .map_or(false, |pp| pp.request_digests.contains(digest))
        })
    }

    /// Take the pending batch and propose it for the next sequence.
    fn cut_batch(&mut self, actions: &mut Vec<Action>) {
        if self.batch_timer_armed {
            self.batch_timer_armed = false;
            actions.push(Action::CancelTimer { id: TimerId::Batch });
        }
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        let request_digests: Vec<Digest> = batch.iter().map(|r| r.digest()).collect();
        self.seq += 1;
        let pp = Preprepare {
            slot: Slot::new(self.view, self.seq),
            batch_digest: Digest::of_digests(request_digests.iter()),
            request_digests,
        };
        info!(id = %self.id, slot = %pp.slot, batch_len = batch.len(), "cutting batch");
        self.push_broadcast(Message::Preprepare(pp), actions);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Normal-case agreement
    // ═══════════════════════════════════════════════════════════════════════

    fn on_preprepare(&mut self, pp: Preprepare, src: ReplicaId, actions: &mut Vec<Action>) {
        if self.in_view_change {
            debug!(slot = %pp.slot, "dropping preprepare during view change");
            return;
        }
        if pp.slot.view != self.view {
            debug!(slot = %pp.slot, view = self.view, "dropping preprepare for other view");
            return;
        }
        if src != self.primary_of_view(pp.slot.view) {
            warn!(slot = %pp.slot, %src, "dropping preprepare from non-primary");
            return;
        }
        if pp.is_noop() || !pp.digest_consistent() {
            warn!(slot = %pp.slot, %src, "dropping malformed preprepare");
            return;
        }

        if pp.slot.seq <= self.accepted_seq {
            // At most one preprepare per (view, seq): a differing second one
            // from the same primary is byzantine evidence.
            if let Some(entry) = self.slots.get(&pp.slot.seq) {
                if entry.view == pp.slot.view {
                    let existing = entry
                        .preprepare
                        .as_ref()
                        .or(entry.parked.as_ref())
                        .map(|p| p.batch_digest);
                    match existing {
                        Some(d) if d != pp.batch_digest => {
                            warn!(slot = %pp.slot, %src, "dropping equivocating preprepare")
                        }
                        _ => trace!(slot = %pp.slot, "ignoring duplicate preprepare"),
                    }
                }
            }
            return;
        }
        if pp.slot.seq != self.accepted_seq + 1 {
            debug!(
                slot = %pp.slot,
                expected = self.accepted_seq + 1,
                "dropping out-of-sequence preprepare"
            );
            return;
        }

        let missing = pp
            .request_digests
            .iter()
            .any(|d| !self.requests.contains_key(d));
        if missing {
            // Requests are broadcast before preprepares in the happy path;
            // park until they arrive, bounded by the request timer. The
            // first parked version binds the slot like an accepted one
            // would.
            let entry = self.slot_entry(pp.slot.seq);
            match &entry.parked {
                Some(parked) if parked.batch_digest != pp.batch_digest => {
                    warn!(slot = %pp.slot, %src, "dropping equivocating preprepare")
                }
                Some(_) => trace!(slot = %pp.slot, "ignoring duplicate parked preprepare"),
                None => {
                    debug!(slot = %pp.slot, "parking preprepare until requests arrive");
                    entry.parked = Some(pp);
                }
            }
            return;
        }

        self.accept_preprepare(pp, actions);
    }

    /// Accept a validated preprepare: record it, record Q evidence,
    /// broadcast our Prepare (unless we lead the slot's view), and re-check
    /// quorums against any buffered votes.
    pub(crate) fn accept_preprepare(&mut self, pp: Preprepare, actions: &mut Vec<Action>) {
        let seq = pp.slot.seq;
        let view = pp.slot.view;

        let entry = self.slot_entry(seq);
        if entry.preprepare.is_some() {
            trace!(slot = %pp.slot, "preprepare already accepted");
            return;
        }
        entry.preprepare = Some(pp.clone());
        entry.parked = None;

        self.accepted_seq = self.accepted_seq.max(seq);
        self.seq = self.seq.max(seq);

        let key = (seq, pp.batch_digest);
        if self.qhist.get(&key).map_or(true, |e| e.view <= view) {
            self.qhist.insert(
                key,
                PqEntry {
                    seq,
                    view,
                    batch_digest: pp.batch_digest,
                    request_digests: pp.request_digests.clone(),
                },
            );
        }
        self.persist_qset(actions);

        debug!(id = %self.id, slot = %pp.slot, digest = ?pp.batch_digest, "accepted preprepare");

        if self.primary_of_view(view) != self.id {
            self.push_broadcast(
                Message::Prepare(Prepare {
                    slot: pp.slot,
                    batch_digest: pp.batch_digest,
                }),
                actions,
            );
        }

        self.check_prepared(seq, actions);
    }

    fn on_prepare(&mut self, prepare: Prepare, src: ReplicaId, actions: &mut Vec<Action>) {
        if self.in_view_change {
            debug!(slot = %prepare.slot, "dropping prepare during view change");
            return;
        }
        if prepare.slot.view != self.view {
            debug!(slot = %prepare.slot, view = self.view, "dropping prepare for other view");
            return;
        }
        if src == self.primary_of_view(prepare.slot.view) {
            // The primary's preprepare replaces its prepare.
            warn!(slot = %prepare.slot, %src, "dropping prepare from primary");
            return;
        }
        if prepare.slot.seq <= self.last_exec {
            trace!(slot = %prepare.slot, "ignoring prepare for delivered slot");
            return;
        }

        let entry = self.slot_entry(prepare.slot.seq);
        match entry.record_prepare(src, prepare.batch_digest) {
            Record::Added => self.check_prepared(prepare.slot.seq, actions),
            Record::Duplicate => trace!(slot = %prepare.slot, %src, "duplicate prepare"),
            Record::Equivocation => {
                warn!(slot = %prepare.slot, %src, "dropping equivocating prepare")
            }
        }
    }

    fn on_commit(&mut self, commit: Commit, src: ReplicaId, actions: &mut Vec<Action>) {
        if self.in_view_change {
            debug!(slot = %commit.slot, "dropping commit during view change");
            return;
        }
        if commit.slot.view != self.view {
            debug!(slot = %commit.slot, view = self.view, "dropping commit for other view");
            return;
        }
        if commit.slot.seq <= self.last_exec {
            trace!(slot = %commit.slot, "ignoring commit for delivered slot");
            return;
        }

        let entry = self.slot_entry(commit.slot.seq);
        match entry.record_commit(src, commit.batch_digest) {
            Record::Added => self.check_committed(commit.slot.seq, actions),
            Record::Duplicate => trace!(slot = %commit.slot, %src, "duplicate commit"),
            Record::Equivocation => {
                warn!(slot = %commit.slot, %src, "dropping equivocating commit")
            }
        }
    }

    /// Transition to prepared once the preprepare plus `2F` matching
    /// non-primary prepares are in.
    pub(crate) fn check_prepared(&mut self, seq: u64, actions: &mut Vec<Action>) {
        let Some(entry) = self.slots.get(&seq) else {
            return;
        };
        if entry.prepared || entry.delivered {
            return;
        }
        let Some(pp) = entry.preprepare.clone() else {
            return;
        };
        let primary = self.primary_of_view(pp.slot.view);
        if entry.matching_prepares(pp.batch_digest, primary) < self.config.prepare_quorum() {
            return;
        }

        if let Some(entry) = self.slots.get_mut(&seq) {
            entry.prepared = true;
        }
        info!(id = %self.id, slot = %pp.slot, digest = ?pp.batch_digest, "slot prepared");

        if self.phist.get(&seq).map_or(true, |e| e.view <= pp.slot.view) {
            self.phist.insert(
                seq,
                PqEntry {
                    seq,
                    view: pp.slot.view,
                    batch_digest: pp.batch_digest,
                    request_digests: pp.request_digests.clone(),
                },
            );
        }
        self.persist_pset(actions);

        self.push_broadcast(
            Message::Commit(Commit {
                slot: pp.slot,
                batch_digest: pp.batch_digest,
            }),
            actions,
        );

        self.check_committed(seq, actions);
    }

    /// Transition to committed on `2F+1` matching commits, then drain any
    /// now-deliverable slots.
    fn check_committed(&mut self, seq: u64, actions: &mut Vec<Action>) {
        let Some(entry) = self.slots.get(&seq) else {
            return;
        };
        if entry.committed || !entry.prepared {
            return;
        }
        let Some(digest) = entry.digest() else {
            return;
        };
        if entry.matching_commits(digest) < self.config.quorum() {
            return;
        }

        if let Some(entry) = self.slots.get_mut(&seq) {
            entry.committed = true;
        }
        info!(id = %self.id, seq, ?digest, "slot committed");

        self.try_deliver(actions);
    }

    /// Deliver committed slots in sequence order with no gaps.
    pub(crate) fn try_deliver(&mut self, actions: &mut Vec<Action>) {
        loop {
            let next = self.last_exec + 1;
            let Some(entry) = self.slots.get(&next) else {
                return;
            };
            if !entry.committed || entry.delivered {
                return;
            }
            let Some(pp) = entry.preprepare.clone() else {
                return;
            };

            if pp.is_noop() {
                // View-change filler: advances the sequence, nothing for the
                // host to execute.
                if let Some(entry) = self.slots.get_mut(&next) {
                    entry.delivered = true;
                }
                self.last_exec = next;
                debug!(id = %self.id, seq = next, "skipping no-op slot");
                continue;
            }

            let mut batch = Vec::with_capacity(pp.request_digests.len());
            for digest in &pp.request_digests {
                match self.requests.get(digest) {
                    Some(request) => batch.push(request.payload.clone()),
                    None => {
                        // Delivery resolves through the store; wait for the
                        // request, bounded by its timer.
                        debug!(seq = next, ?digest, "cannot deliver yet, request missing");
                        return;
                    }
                }
            }

            if let Some(entry) = self.slots.get_mut(&next) {
                entry.delivered = true;
            }
            self.last_exec = next;
            info!(id = %self.id, seq = next, batch_len = batch.len(), "delivering batch");
            actions.push(Action::Deliver { seq: next, batch });

            for digest in &pp.request_digests {
                self.requests.remove(digest);
                self.delivered_requests.insert(*digest);
                if self.timed.remove(digest) {
                    actions.push(Action::CancelTimer {
                        id: TimerId::Request(*digest),
                    });
                }
                actions.push(Action::PersistDelete {
                    key: request_key(digest),
                });
            }
            self.batch
                .retain(|r| !pp.request_digests.contains(&r.digest()));
        }
    }

    /// Accept any parked preprepare whose requests have all arrived.
    fn try_unpark(&mut self, actions: &mut Vec<Action>) {
        if self.in_view_change {
            return;
        }
        let parked: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, e)| e.parked.is_some() && e.view == self.view)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in parked {
            let ready = self
                .slots
                .get(&seq)
                .and_then(|e| e.parked.as_ref())
                .map_or(false, |pp| {
                    pp.request_digests
                        .iter()
                        .all(|d| self.requests.contains_key(d))
                });
            if !ready {
                continue;
            }
            if let Some(pp) = self.slots.get_mut(&seq).and_then(|e| e.parked.take()) {
                debug!(slot = %pp.slot, "unparking preprepare");
                self.accept_preprepare(pp, actions);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch the log entry for a sequence, creating it for the current view
    /// and discarding any stale lower-view entry. Counters never mix across
    /// views; the P/Q history keeps what the old entry proved.
    pub(crate) fn slot_entry(&mut self, seq: u64) -> &mut SlotEntry {
        let view = self.view;
        let entry = self
            .slots
            .entry(seq)
            .or_insert_with(|| SlotEntry::new(view));
        if entry.view < view {
            *entry = SlotEntry::new(view);
        }
        entry
    }

    /// Sign a message and queue it for broadcast.
    pub(crate) fn push_broadcast(&self, message: Message, actions: &mut Vec<Action>) {
        match self.sign_message(&message) {
            Some(envelope) => actions.push(Action::Broadcast { envelope }),
            None => warn!(kind = message.type_name(), "dropping unencodable outbound message"),
        }
    }

    pub(crate) fn sign_message(&self, message: &Message) -> Option<SignedMessage> {
        match encode_payload(message) {
            Ok(payload) => {
                let signature = self.signer.sign(&payload);
                Some(SignedMessage {
                    payload,
                    signer: self.id,
                    signature,
                })
            }
            Err(e) => {
                warn!(error = %e, "could not encode message");
                None
            }
        }
    }

    /// Current P-set, ordered by sequence.
    pub(crate) fn current_pset(&self) -> Vec<PqEntry> {
        self.phist.values().cloned().collect()
    }

    /// Current Q-set, ordered by `(sequence, digest)`.
    pub(crate) fn current_qset(&self) -> Vec<PqEntry> {
        self.qhist.values().cloned().collect()
    }

    pub(crate) fn persist_pset(&self, actions: &mut Vec<Action>) {
        match sbor::basic_encode(&self.current_pset()) {
            Ok(value) => actions.push(Action::Persist {
                key: PSET_KEY.to_string(),
                value,
            }),
            Err(e) => warn!(error = ?e, "could not persist pset"),
        }
    }

    pub(crate) fn persist_qset(&self, actions: &mut Vec<Action>) {
        match sbor::basic_encode(&self.current_qset()) {
            Ok(value) => actions.push(Action::Persist {
                key: QSET_KEY.to_string(),
                value,
            }),
            Err(e) => warn!(error = ?e, "could not persist qset"),
        }
    }
}

impl StateMachine for Replica {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            Event::ClientRequest { payload } => self.on_client_request(payload, &mut actions),
            Event::MessageReceived { envelope, from } => {
                self.on_message(envelope, from, &mut actions)
            }
            Event::TimerFired { id } => self.on_timer(id, &mut actions),
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{broadcasts, config, receive, replica, signed};
    use tracing_test::traced_test;

    fn preprepare_for(reqs: &[&[u8]], view: u64, seq: u64) -> Preprepare {
        let digests: Vec<Digest> = reqs.iter().map(|r| Digest::of(r)).collect();
        Preprepare {
            slot: Slot::new(view, seq),
            batch_digest: Digest::of_digests(digests.iter()),
            request_digests: digests,
        }
    }

    /// Feed the requests everyone would have seen via broadcast.
    fn seed_requests(r: &mut Replica, reqs: &[&[u8]]) {
        for (i, payload) in reqs.iter().enumerate() {
            let src = ReplicaId(i as u64 % r.config.n);
            receive(r, src, Message::Request(Request::new(payload.to_vec())));
        }
    }

    #[traced_test]
    #[test]
    fn backup_prepares_on_valid_preprepare() {
        let mut r = replica(1, 4, 1);
        seed_requests(&mut r, &[b"abc"]);
        let actions = receive(
            &mut r,
            ReplicaId(0),
            Message::Preprepare(preprepare_for(&[b"abc"], 0, 1)),
        );
        let broadcasts: Vec<Message> = broadcasts(&actions);
        assert!(matches!(broadcasts.as_slice(), [Message::Prepare(p)] if p.slot == Slot::new(0, 1)));
        assert_eq!(r.seq(), 1);
    }

    #[traced_test]
    #[test]
    fn preprepare_from_non_primary_is_dropped() {
        let mut r = replica(1, 4, 1);
        seed_requests(&mut r, &[b"abc"]);
        let actions = receive(
            &mut r,
            ReplicaId(2),
            Message::Preprepare(preprepare_for(&[b"abc"], 0, 1)),
        );
        assert!(broadcasts(&actions).is_empty());
        assert_eq!(r.accepted_seq, 0);
    }

    #[traced_test]
    #[test]
    fn out_of_sequence_preprepare_is_dropped() {
        let mut r = replica(1, 4, 1);
        seed_requests(&mut r, &[b"abc"]);
        let actions = receive(
            &mut r,
            ReplicaId(0),
            Message::Preprepare(preprepare_for(&[b"abc"], 0, 2)),
        );
        assert!(broadcasts(&actions).is_empty());
    }

    #[traced_test]
    #[test]
    fn second_differing_preprepare_is_byzantine_evidence() {
        let mut r = replica(1, 4, 1);
        seed_requests(&mut r, &[b"abc", b"xyz"]);
        receive(
            &mut r,
            ReplicaId(0),
            Message::Preprepare(preprepare_for(&[b"abc"], 0, 1)),
        );
        receive(
            &mut r,
            ReplicaId(0),
            Message::Preprepare(preprepare_for(&[b"xyz"], 0, 1)),
        );
        // The original acceptance stands.
        let entry = r.slots.get(&1).unwrap();
        assert_eq!(
            entry.digest().unwrap(),
            Digest::of_digests([&Digest::of(b"abc")])
        );
    }

    #[traced_test]
    #[test]
    fn missing_requests_park_the_preprepare() {
        let mut r = replica(1, 4, 1);
        let pp = preprepare_for(&[b"abc"], 0, 1);
        let actions = receive(&mut r, ReplicaId(0), Message::Preprepare(pp));
        assert!(broadcasts(&actions).is_empty());
        assert!(r.slots.get(&1).unwrap().parked.is_some());

        // The request arrives; the parked preprepare is accepted and a
        // Prepare goes out.
        let actions = receive(
            &mut r,
            ReplicaId(0),
            Message::Request(Request::new(b"abc".to_vec())),
        );
        let broadcasts = broadcasts(&actions);
        assert!(broadcasts
            .iter()
            .any(|m| matches!(m, Message::Prepare(_))));
        assert!(r.slots.get(&1).unwrap().preprepare.is_some());
    }

    #[traced_test]
    #[test]
    fn slot_walks_through_prepared_committed_delivered() {
        let mut r = replica(1, 4, 1);
        seed_requests(&mut r, &[b"abc"]);
        let pp = preprepare_for(&[b"abc"], 0, 1);
        receive(&mut r, ReplicaId(0), Message::Preprepare(pp.clone()));

        // Own prepare loopback plus one more backup: 2F = 2 non-primary
        // prepares.
        let prepare = Prepare {
            slot: pp.slot,
            batch_digest: pp.batch_digest,
        };
        receive(&mut r, ReplicaId(1), Message::Prepare(prepare.clone()));
        let actions = receive(&mut r, ReplicaId(2), Message::Prepare(prepare.clone()));
        assert!(r.slots.get(&1).unwrap().prepared);
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, Message::Commit(_))));

        // 2F+1 = 3 commits deliver the batch.
        let commit = Commit {
            slot: pp.slot,
            batch_digest: pp.batch_digest,
        };
        receive(&mut r, ReplicaId(0), Message::Commit(commit.clone()));
        receive(&mut r, ReplicaId(1), Message::Commit(commit.clone()));
        let actions = receive(&mut r, ReplicaId(2), Message::Commit(commit.clone()));
        let delivered: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Deliver { seq, batch } => Some((*seq, batch.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![(1, vec![b"abc".to_vec()])]);
        assert_eq!(r.last_exec(), 1);

        // Redelivery of the same commit is a no-op.
        let actions = receive(&mut r, ReplicaId(2), Message::Commit(commit));
        assert!(actions.is_empty());
    }

    #[traced_test]
    #[test]
    fn equivocating_prepares_do_not_double_count() {
        let mut r = replica(1, 4, 1);
        seed_requests(&mut r, &[b"abc", b"zzz"]);
        let pp = preprepare_for(&[b"abc"], 0, 1);
        receive(&mut r, ReplicaId(0), Message::Preprepare(pp.clone()));

        let other = Digest::of_digests([&Digest::of(b"zzz")]);
        receive(
            &mut r,
            ReplicaId(2),
            Message::Prepare(Prepare {
                slot: pp.slot,
                batch_digest: pp.batch_digest,
            }),
        );
        // Replica 2 flips digests: second vote is dropped, binding stands.
        receive(
            &mut r,
            ReplicaId(2),
            Message::Prepare(Prepare {
                slot: pp.slot,
                batch_digest: other,
            }),
        );
        let entry = r.slots.get(&1).unwrap();
        assert_eq!(entry.matching_prepares(pp.batch_digest, ReplicaId(0)), 2);
        assert_eq!(entry.matching_prepares(other, ReplicaId(0)), 0);
    }

    #[traced_test]
    #[test]
    fn primary_cuts_batch_on_size() {
        let mut r = replica(0, 4, 1);
        // 10-byte threshold, 12 bytes buffered: immediate cut.
        let r1 = Request::new(vec![1; 6]);
        let r2 = Request::new(vec![2; 6]);
        receive(&mut r, ReplicaId(0), Message::Request(r1.clone()));
        let actions = receive(&mut r, ReplicaId(1), Message::Request(r2.clone()));
        let pps: Vec<Preprepare> = broadcasts(&actions)
            .into_iter()
            .filter_map(|m| match m {
                Message::Preprepare(pp) => Some(pp),
                _ => None,
            })
            .collect();
        assert_eq!(pps.len(), 1);
        assert_eq!(pps[0].slot, Slot::new(0, 1));
        assert_eq!(
            pps[0].request_digests,
            vec![r1.digest(), r2.digest()]
        );
    }

    #[traced_test]
    #[test]
    fn primary_cuts_batch_on_timer() {
        let mut r = replica(0, 4, 1);
        let actions = receive(&mut r, ReplicaId(0), Message::Request(Request::new(vec![7; 3])));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Batch, .. })));
        assert!(broadcasts(&actions).is_empty());

        let actions = r.handle(Event::TimerFired { id: TimerId::Batch });
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, Message::Preprepare(_))));
    }

    #[traced_test]
    #[test]
    fn single_replica_delivers_immediately() {
        let mut r = replica(0, 1, 0);
        // Loopback of its own request broadcast.
        let req = Request::new(vec![1, 2, 3]);
        receive(&mut r, ReplicaId(0), Message::Request(req.clone()));
        // batch_size_bytes = 10 > 3, so the batch waits on the timer.
        let actions = r.handle(Event::TimerFired { id: TimerId::Batch });
        let pp = broadcasts(&actions)
            .into_iter()
            .find_map(|m| match m {
                Message::Preprepare(pp) => Some(pp),
                _ => None,
            })
            .unwrap();
        // Loopback preprepare: with F = 0 it is instantly prepared, and the
        // loopback commit completes the quorum of one.
        let actions = receive(&mut r, ReplicaId(0), Message::Preprepare(pp.clone()));
        let commit = broadcasts(&actions)
            .into_iter()
            .find_map(|m| match m {
                Message::Commit(c) => Some(c),
                _ => None,
            })
            .unwrap();
        let actions = receive(&mut r, ReplicaId(0), Message::Commit(commit));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Deliver { seq: 1, .. })));
        assert_eq!(r.last_exec(), 1);
    }

    #[traced_test]
    #[test]
    fn bad_signature_is_dropped() {
        let mut r = replica(1, 4, 1);
        let mut envelope = signed(ReplicaId(0), &Message::Request(Request::new(vec![1])));
        envelope.signature[0] ^= 0xff;
        let actions = r.handle(Event::MessageReceived {
            envelope,
            from: ReplicaId(0),
        });
        assert!(actions.is_empty());
        assert!(r.requests.is_empty());
    }

    #[traced_test]
    #[test]
    fn request_timeout_starts_view_change() {
        let mut r = replica(1, 4, 1);
        let req = Request::new(vec![9]);
        receive(&mut r, ReplicaId(2), Message::Request(req.clone()));
        let actions = r.handle(Event::TimerFired {
            id: TimerId::Request(req.digest()),
        });
        assert!(r.in_view_change());
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, Message::ViewChange(vc) if vc.new_view == 1)));
    }

    #[traced_test]
    #[test]
    fn late_request_timer_fire_is_ignored() {
        let mut r = replica(1, 4, 1);
        let digest = Digest::of(b"gone");
        let actions = r.handle(Event::TimerFired {
            id: TimerId::Request(digest),
        });
        assert!(actions.is_empty());
        assert!(!r.in_view_change());
    }

    #[test]
    fn recovery_restores_view_seq_and_requests() {
        use crate::recovery::RecoveredState;
        let d = Digest::of(b"r");
        let entry = PqEntry {
            seq: 2,
            view: 1,
            batch_digest: Digest::of_digests([&d]),
            request_digests: vec![d],
        };
        let recovered = RecoveredState {
            pset: vec![entry.clone()],
            qset: vec![entry],
            requests: vec![Request::new(b"r".to_vec())],
            last_exec: 2,
        };
        let mut r = Replica::new(
            ReplicaId(1),
            config(4, 1),
            std::sync::Arc::new(crate::testing::StubSigner),
            recovered,
        )
        .unwrap();
        assert_eq!(r.view(), 1);
        assert_eq!(r.seq(), 2);
        assert_eq!(r.last_exec(), 2);

        let actions = r.bootstrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Request(_), .. })));
    }
}
