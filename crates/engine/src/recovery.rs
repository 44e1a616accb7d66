//! Crash recovery.
//!
//! The engine persists its P-set under `"pset"`, its Q-set under `"qset"`,
//! and each accepted request under `"req.<digest-hex>"`. On boot the host
//! loads a [`RecoveredState`] from its state store and constructs the
//! replica with it; a missing or damaged field is a cold start for that
//! field.

use lockstep_types::{Digest, PqEntry, Request};
use lockstep_core::StateStore;
use tracing::{debug, warn};

/// Persistence key for the P-set.
pub const PSET_KEY: &str = "pset";
/// Persistence key for the Q-set.
pub const QSET_KEY: &str = "qset";
/// Persistence key prefix for accepted requests.
pub const REQ_PREFIX: &str = "req.";

/// Persistence key for a request digest.
pub fn request_key(digest: &Digest) -> String {
    format!("{REQ_PREFIX}{}", digest.to_hex())
}

/// State recovered from storage on startup.
///
/// Passed to `Replica::new()` to restore protocol state after a crash or
/// restart. For a fresh start, use `RecoveredState::default()`.
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    /// Prepared-certificate evidence, one entry per slot.
    pub pset: Vec<PqEntry>,
    /// Preprepare evidence, one entry per `(slot, digest)`.
    pub qset: Vec<PqEntry>,
    /// Requests that were accepted but not yet delivered.
    pub requests: Vec<Request>,
    /// Highest delivered sequence, from the host's executor record.
    pub last_exec: u64,
}

impl RecoveredState {
    /// Load recovered state from a state store.
    pub fn load(store: &dyn StateStore) -> Self {
        let pset = Self::load_pq(store, PSET_KEY);
        let qset = Self::load_pq(store, QSET_KEY);

        let mut requests = Vec::new();
        for (key, value) in store.read_state_set(REQ_PREFIX) {
            match sbor::basic_decode::<Request>(&value) {
                Ok(req) => requests.push(req),
                Err(e) => warn!(key, error = ?e, "could not restore request"),
            }
        }
        // Deterministic rehydration order regardless of store iteration.
        requests.sort_by_key(|r| r.digest());

        let last_exec = store.last_seq_no().unwrap_or_else(|| {
            debug!("no delivered sequence recorded, cold start");
            0
        });

        Self {
            pset,
            qset,
            requests,
            last_exec,
        }
    }

    fn load_pq(store: &dyn StateStore, key: &str) -> Vec<PqEntry> {
        let Some(raw) = store.read_state(key) else {
            debug!(key, "no persisted set, cold start");
            return Vec::new();
        };
        match sbor::basic_decode::<Vec<PqEntry>>(&raw) {
            Ok(set) => set,
            Err(e) => {
                warn!(key, error = ?e, "could not decode persisted set, local state is damaged");
                Vec::new()
            }
        }
    }

    /// The highest view observed across the P and Q sets.
    pub fn max_view(&self) -> u64 {
        self.pset
            .iter()
            .chain(self.qset.iter())
            .map(|e| e.view)
            .max()
            .unwrap_or(0)
    }

    /// The highest sequence observed across the P and Q sets.
    pub fn max_seq(&self) -> u64 {
        self.pset
            .iter()
            .chain(self.qset.iter())
            .map(|e| e.seq)
            .max()
            .unwrap_or(0)
    }
}
