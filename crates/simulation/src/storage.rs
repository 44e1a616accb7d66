//! In-memory state store for simulated replicas.

use lockstep_core::StateStore;
use std::collections::BTreeMap;

/// In-memory key-value store with the same interface the production host
/// backs with RocksDB.
///
/// Kept by the runner across simulated restarts: rebuilding a replica from
/// its `MemoryStore` is the crash-recovery path.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    map: BTreeMap<String, Vec<u8>>,
    last_seq: Option<u64>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the highest delivered sequence; called by the runner when it
    /// executes a `Deliver` action, playing the host executor's role.
    pub fn set_last_seq(&mut self, seq: u64) {
        self.last_seq = Some(self.last_seq.map_or(seq, |prev| prev.max(seq)));
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn store_state(&mut self, key: &str, value: &[u8]) {
        self.map.insert(key.to_string(), value.to_vec());
    }

    fn read_state(&self, key: &str) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn read_state_set(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn del_state(&mut self, key: &str) {
        self.map.remove(key);
    }

    fn last_seq_no(&self) -> Option<u64> {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_is_bounded() {
        let mut store = MemoryStore::new();
        store.store_state("req.aa", b"1");
        store.store_state("req.bb", b"2");
        store.store_state("rez", b"3");
        store.store_state("pset", b"4");
        let set = store.read_state_set("req.");
        assert_eq!(
            set.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["req.aa", "req.bb"]
        );
    }

    #[test]
    fn last_seq_is_monotone() {
        let mut store = MemoryStore::new();
        assert_eq!(store.last_seq_no(), None);
        store.set_last_seq(3);
        store.set_last_seq(1);
        assert_eq!(store.last_seq_no(), Some(3));
    }
}
