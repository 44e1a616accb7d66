//! Simulated network with deterministic latency, packet loss, partitions,
//! and an adversarial message filter.

use lockstep_types::{ReplicaId, SignedMessage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// What the message filter decided for one frame.
pub enum FilterAction {
    /// Deliver the frame untouched.
    Deliver,
    /// Drop the frame on the floor.
    Drop,
    /// Deliver a substituted frame instead; the wire adversary.
    Replace(SignedMessage),
}

/// Hook inspecting every `(src, dst, frame)` before delivery.
pub type MessageFilter = Box<dyn FnMut(ReplicaId, ReplicaId, &SignedMessage) -> FilterAction>;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way latency between distinct replicas. Self-delivery
    /// (broadcast loopback) is instantaneous.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0).
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Simulated network for deterministic message delivery.
pub struct SimNetwork {
    config: NetworkConfig,
    /// Partitioned pairs; `(a, b)` means frames from a to b are dropped.
    partitions: HashSet<(ReplicaId, ReplicaId)>,
    /// Adversarial filter, if installed.
    filter: Option<MessageFilter>,
    /// Latency memoized per ordered pair: keeps per-pair delivery FIFO, so
    /// two requests sent back-to-back arrive in order.
    arrivals: HashMap<(ReplicaId, ReplicaId), Duration>,
}

impl SimNetwork {
    /// A network with the given configuration.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
            filter: None,
            arrivals: HashMap::new(),
        }
    }

    /// Install a message filter. Replaces any previous one.
    pub fn set_filter(&mut self, filter: MessageFilter) {
        self.filter = Some(filter);
    }

    /// Remove the message filter.
    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Run a frame through the filter.
    pub fn filter(
        &mut self,
        from: ReplicaId,
        to: ReplicaId,
        frame: &SignedMessage,
    ) -> FilterAction {
        match self.filter.as_mut() {
            Some(f) => f(from, to, frame),
            None => FilterAction::Deliver,
        }
    }

    /// Create a unidirectional partition: frames from `from` to `to` drop.
    pub fn partition_unidirectional(&mut self, from: ReplicaId, to: ReplicaId) {
        self.partitions.insert((from, to));
    }

    /// Create a bidirectional partition between two replicas.
    pub fn partition_bidirectional(&mut self, a: ReplicaId, b: ReplicaId) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Heal all partitions.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    /// Whether frames from `from` to `to` are currently dropped.
    pub fn is_partitioned(&self, from: ReplicaId, to: ReplicaId) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Set the packet loss rate (0.0 - 1.0).
    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Decide delivery for a frame: `None` to drop (partition or loss),
    /// `Some(latency)` to deliver.
    pub fn should_deliver(
        &mut self,
        from: ReplicaId,
        to: ReplicaId,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        if self.is_partitioned(from, to) {
            return None;
        }
        if self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate {
            return None;
        }
        Some(self.sample_latency(from, to, rng))
    }

    /// The one-way latency for a pair, jittered once then fixed.
    pub fn sample_latency(
        &mut self,
        from: ReplicaId,
        to: ReplicaId,
        rng: &mut ChaCha8Rng,
    ) -> Duration {
        if from == to {
            return Duration::ZERO;
        }
        if let Some(latency) = self.arrivals.get(&(from, to)) {
            return *latency;
        }
        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        let latency = Duration::from_secs_f64((base + jitter).max(0.000_001));
        self.arrivals.insert((from, to), latency);
        latency
    }
}
