//! RocksDB-backed state store.
//!
//! All operations are synchronous blocking I/O; the runner executes them
//! inline on its event loop, which keeps persistence ordered with respect to
//! the engine actions that requested it.

use lockstep_core::StateStore;
use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Key under which the highest delivered sequence is recorded. Chosen
/// outside the engine's `pset`/`qset`/`req.` namespace.
const LAST_SEQ_KEY: &str = "meta.last_seq";

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(String),
}

/// RocksDB-based state store for production use.
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_keep_log_file_num(4);
        let db = DB::open(&opts, path).map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(Self { db })
    }

    /// Record the highest delivered sequence; called by the runner when it
    /// executes a `Deliver` action.
    pub fn set_last_seq(&mut self, seq: u64) {
        let current = self.last_seq_no().unwrap_or(0);
        if seq <= current {
            return;
        }
        if let Err(e) = self.db.put(LAST_SEQ_KEY, seq.to_be_bytes()) {
            warn!(seq, error = %e, "could not record delivered sequence");
        }
    }
}

impl StateStore for RocksDbStore {
    fn store_state(&mut self, key: &str, value: &[u8]) {
        if let Err(e) = self.db.put(key, value) {
            warn!(key, error = %e, "state write failed");
        }
    }

    fn read_state(&self, key: &str) -> Option<Vec<u8>> {
        match self.db.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "state read failed");
                None
            }
        }
    }

    fn read_state_set(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.db
            .iterator(IteratorMode::From(
                prefix.as_bytes(),
                rocksdb::Direction::Forward,
            ))
            .take_while(|item| match item {
                Ok((key, _)) => key.starts_with(prefix.as_bytes()),
                Err(_) => false,
            })
            .filter_map(|item| {
                let (key, value) = item.ok()?;
                let key = String::from_utf8(key.to_vec()).ok()?;
                Some((key, value.to_vec()))
            })
            .collect()
    }

    fn del_state(&mut self, key: &str) {
        if let Err(e) = self.db.delete(key) {
            warn!(key, error = %e, "state delete failed");
        }
    }

    fn last_seq_no(&self) -> Option<u64> {
        let raw = self.read_state(LAST_SEQ_KEY)?;
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksDbStore::open(dir.path()).unwrap();
        assert_eq!(store.read_state("pset"), None);
        store.store_state("pset", b"abc");
        assert_eq!(store.read_state("pset"), Some(b"abc".to_vec()));
        store.del_state("pset");
        assert_eq!(store.read_state("pset"), None);
    }

    #[test]
    fn prefix_scan_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksDbStore::open(dir.path()).unwrap();
        store.store_state("req.aa", b"1");
        store.store_state("req.bb", b"2");
        store.store_state("rez", b"3");
        let set = store.read_state_set("req.");
        assert_eq!(
            set.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["req.aa", "req.bb"]
        );
    }

    #[test]
    fn last_seq_survives_reopen_and_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = RocksDbStore::open(dir.path()).unwrap();
            store.set_last_seq(3);
            store.set_last_seq(1);
            assert_eq!(store.last_seq_no(), Some(3));
        }
        let store = RocksDbStore::open(dir.path()).unwrap();
        assert_eq!(store.last_seq_no(), Some(3));
    }
}
