//! Deterministic simulation runner.
//!
//! All replicas share one calendar queue ordered by `(time, sequence)`;
//! processing an event may enqueue more events (message deliveries, timer
//! fires). Given the same seed and the same inputs, every run is identical.

use crate::keys::{SimKeyring, SimSigner};
use crate::network::{FilterAction, NetworkConfig, SimNetwork};
use crate::storage::MemoryStore;
use lockstep_core::{Action, Event, StateMachine, StateStore, TimerId};
use lockstep_engine::{Config, RecoveredState, Replica};
use lockstep_types::{
    decode_envelope, encode_envelope, encode_payload, Message, ReplicaId, SignedMessage,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Runaway-loop guard for `run_to_quiescence`.
const MAX_EVENTS_PER_RUN: u64 = 500_000;

/// Queue position: time first, then insertion order for determinism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    at: Duration,
    seq: u64,
}

struct QueuedEvent {
    replica: ReplicaId,
    event: Event,
    /// Set for timer fires: skipped at pop time unless the token still
    /// matches the timer table (cancellation, or replacement by a later
    /// `SetTimer`).
    timer: Option<(TimerId, u64)>,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Frames scheduled for delivery.
    pub messages_sent: u64,
    /// Frames dropped by partition or packet loss.
    pub messages_dropped: u64,
    /// Frames dropped by the adversarial filter.
    pub messages_filtered: u64,
    /// Frames substituted by the adversarial filter.
    pub messages_rewritten: u64,
    /// Timers armed.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
    /// Timer fires skipped because of cancellation or replacement.
    pub timer_fires_skipped: u64,
}

/// Deterministic simulation of a full replica cluster.
pub struct SimRunner {
    config: Config,
    keyring: Arc<SimKeyring>,
    replicas: Vec<Replica>,
    stores: Vec<MemoryStore>,
    /// Per-replica delivery history, in delivery order.
    delivered: Vec<Vec<Vec<Vec<u8>>>>,
    network: SimNetwork,
    rng: ChaCha8Rng,
    queue: BTreeMap<EventKey, QueuedEvent>,
    next_seq: u64,
    next_timer_token: u64,
    timers: HashMap<(ReplicaId, TimerId), u64>,
    now: Duration,
    stats: SimStats,
}

impl SimRunner {
    /// Build a cluster of `config.n` fresh replicas.
    pub fn new(config: Config, network_config: NetworkConfig, seed: u64) -> Self {
        let keyring = Arc::new(SimKeyring::new(config.n, seed));
        let replicas: Vec<Replica> = (0..config.n)
            .map(|i| {
                let id = ReplicaId(i);
                Replica::new(
                    id,
                    config.clone(),
                    Arc::new(SimSigner::new(id, keyring.clone())),
                    RecoveredState::default(),
                )
                .expect("simulation config is valid")
            })
            .collect();
        let stores = (0..config.n).map(|_| MemoryStore::new()).collect();
        let delivered = (0..config.n).map(|_| Vec::new()).collect();

        info!(n = config.n, f = config.f, seed, "created simulation runner");

        Self {
            config,
            keyring,
            replicas,
            stores,
            delivered,
            network: SimNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            queue: BTreeMap::new(),
            next_seq: 0,
            next_timer_token: 0,
            timers: HashMap::new(),
            now: Duration::ZERO,
            stats: SimStats::default(),
        }
    }

    // ─── Accessors ───

    /// A replica by id.
    pub fn replica(&self, id: ReplicaId) -> &Replica {
        &self.replicas[id.0 as usize]
    }

    /// A replica's delivery history: batches in delivery order, each batch a
    /// list of request payloads.
    pub fn delivered(&self, id: ReplicaId) -> &[Vec<Vec<u8>>] {
        &self.delivered[id.0 as usize]
    }

    /// A replica's state store.
    pub fn store(&self, id: ReplicaId) -> &MemoryStore {
        &self.stores[id.0 as usize]
    }

    /// The simulated network, for partitions, loss, and filters.
    pub fn network_mut(&mut self) -> &mut SimNetwork {
        &mut self.network
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Run statistics.
    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Sign a message as `id` would; lets tests forge byzantine traffic.
    pub fn sign_as(&self, id: ReplicaId, message: &Message) -> SignedMessage {
        let payload = encode_payload(message).expect("encodable message");
        let signature = self.keyring.sign(id, &payload);
        SignedMessage {
            payload,
            signer: id,
            signature,
        }
    }

    // ─── Driving the simulation ───

    /// Submit a client request at a replica, effective at the current
    /// simulated time.
    pub fn submit(&mut self, id: ReplicaId, payload: Vec<u8>) {
        let event = Event::ClientRequest { payload };
        self.enqueue(self.now, id, event, None);
    }

    /// Process events until the queue drains.
    pub fn run_to_quiescence(&mut self) {
        let mut processed = 0u64;
        while self.step() {
            processed += 1;
            assert!(
                processed < MAX_EVENTS_PER_RUN,
                "simulation did not quiesce within {MAX_EVENTS_PER_RUN} events"
            );
        }
    }

    /// Process events with timestamps up to and including `deadline`.
    pub fn run_until(&mut self, deadline: Duration) {
        while self
            .queue
            .keys()
            .next()
            .map_or(false, |key| key.at <= deadline)
        {
            self.step();
        }
        self.now = self.now.max(deadline);
    }

    /// Simulate a crash and restart of one replica: its engine state is
    /// rebuilt from its state store, its in-flight timers die with it.
    pub fn restart(&mut self, id: ReplicaId) {
        info!(%id, "restarting replica");
        self.timers.retain(|(replica, _), _| *replica != id);

        let recovered = RecoveredState::load(&self.stores[id.0 as usize]);
        let mut replica = Replica::new(
            id,
            self.config.clone(),
            Arc::new(SimSigner::new(id, self.keyring.clone())),
            recovered,
        )
        .expect("simulation config is valid");
        let actions = replica.bootstrap();
        self.replicas[id.0 as usize] = replica;
        self.apply_actions(id, actions);
    }

    /// Pop and process one event. Returns false when the queue is empty.
    fn step(&mut self) -> bool {
        let Some((&key, _)) = self.queue.iter().next() else {
            return false;
        };
        let queued = self.queue.remove(&key).expect("peeked key exists");
        self.now = key.at;

        if let Some((timer_id, token)) = queued.timer {
            let live = self.timers.get(&(queued.replica, timer_id)) == Some(&token);
            if !live {
                self.stats.timer_fires_skipped += 1;
                trace!(replica = %queued.replica, ?timer_id, "skipping dead timer fire");
                return true;
            }
            self.timers.remove(&(queued.replica, timer_id));
        }

        self.stats.events_processed += 1;
        let actions = self.replicas[queued.replica.0 as usize].handle(queued.event);
        self.apply_actions(queued.replica, actions);
        true
    }

    fn apply_actions(&mut self, replica: ReplicaId, actions: Vec<Action>) {
        for action in actions {
            trace!(%replica, kind = action.type_name(), "executing action");
            match action {
                Action::Broadcast { envelope } => {
                    for dst in 0..self.config.n {
                        self.route(replica, ReplicaId(dst), envelope.clone());
                    }
                }
                Action::Send { to, envelope } => self.route(replica, to, envelope),
                Action::SetTimer { id, duration } => {
                    self.next_timer_token += 1;
                    let token = self.next_timer_token;
                    self.timers.insert((replica, id), token);
                    self.stats.timers_set += 1;
                    self.enqueue(
                        self.now + duration,
                        replica,
                        Event::TimerFired { id },
                        Some((id, token)),
                    );
                }
                Action::CancelTimer { id } => {
                    if self.timers.remove(&(replica, id)).is_some() {
                        self.stats.timers_cancelled += 1;
                    }
                }
                Action::Deliver { seq, batch } => {
                    debug!(%replica, seq, batch_len = batch.len(), "host delivery");
                    self.delivered[replica.0 as usize].push(batch);
                    self.stores[replica.0 as usize].set_last_seq(seq);
                }
                Action::Persist { key, value } => {
                    self.stores[replica.0 as usize].store_state(&key, &value);
                }
                Action::PersistDelete { key } => {
                    self.stores[replica.0 as usize].del_state(&key);
                }
            }
        }
    }

    /// Push one frame through the adversarial filter and the network, then
    /// schedule its delivery.
    fn route(&mut self, from: ReplicaId, to: ReplicaId, envelope: SignedMessage) {
        let envelope = match self.network.filter(from, to, &envelope) {
            FilterAction::Deliver => envelope,
            FilterAction::Drop => {
                self.stats.messages_filtered += 1;
                return;
            }
            FilterAction::Replace(substitute) => {
                self.stats.messages_rewritten += 1;
                substitute
            }
        };

        let Some(latency) = self.network.should_deliver(from, to, &mut self.rng) else {
            self.stats.messages_dropped += 1;
            return;
        };

        // Round-trip the wire codec, as a real transport would.
        let frame = match encode_envelope(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%from, error = %e, "unencodable frame dropped");
                return;
            }
        };
        let envelope = match decode_envelope(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%to, error = %e, "undecodable frame dropped");
                return;
            }
        };

        self.stats.messages_sent += 1;
        self.enqueue(
            self.now + latency,
            to,
            Event::MessageReceived { envelope, from },
            None,
        );
    }

    fn enqueue(
        &mut self,
        at: Duration,
        replica: ReplicaId,
        event: Event,
        timer: Option<(TimerId, u64)>,
    ) {
        self.next_seq += 1;
        let key = EventKey {
            at,
            seq: self.next_seq,
        };
        self.queue.insert(
            key,
            QueuedEvent {
                replica,
                event,
                timer,
            },
        );
    }
}
