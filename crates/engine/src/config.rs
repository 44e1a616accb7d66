//! Replica configuration.

use std::time::Duration;
use thiserror::Error;

/// Configuration error, fatal at construction time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `N ≥ 3F + 1` is required for quorum intersection.
    #[error("n = {n} is too small for f = {f}: need n >= 3f + 1")]
    TooFewReplicas {
        /// Configured replica count.
        n: u64,
        /// Configured fault tolerance.
        f: u64,
    },

    /// An empty system cannot agree on anything.
    #[error("n must be at least 1")]
    NoReplicas,
}

/// Replica configuration, identical at every replica and fixed for the
/// lifetime of an instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total number of replicas.
    pub n: u64,
    /// Tolerated byzantine faults.
    pub f: u64,
    /// The primary cuts a batch once buffered payload reaches this size.
    pub batch_size_bytes: u64,
    /// The primary cuts a batch this long after the first buffered request,
    /// whichever comes first.
    pub batch_duration: Duration,
    /// A request not delivered within this duration triggers a view change.
    pub request_timeout: Duration,
}

impl Config {
    /// Validate the fault-tolerance arithmetic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n == 0 {
            return Err(ConfigError::NoReplicas);
        }
        if self.n < 3 * self.f + 1 {
            return Err(ConfigError::TooFewReplicas {
                n: self.n,
                f: self.f,
            });
        }
        Ok(())
    }

    /// Quorum size: `2F + 1`.
    pub fn quorum(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// Prepares needed beyond the primary's preprepare: `2F`.
    pub fn prepare_quorum(&self) -> usize {
        (2 * self.f) as usize
    }

    /// Weak certificate size: `F + 1`, guarantees at least one honest
    /// member.
    pub fn weak_quorum(&self) -> usize {
        (self.f + 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(n: u64, f: u64) -> Config {
        Config {
            n,
            f,
            batch_size_bytes: 10,
            batch_duration: Duration::from_secs(2),
            request_timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn accepts_minimal_configurations() {
        assert!(config(1, 0).validate().is_ok());
        assert!(config(4, 1).validate().is_ok());
        assert!(config(7, 2).validate().is_ok());
    }

    #[test]
    fn rejects_undersized_clusters() {
        assert_eq!(
            config(3, 1).validate(),
            Err(ConfigError::TooFewReplicas { n: 3, f: 1 })
        );
        assert_eq!(config(0, 0).validate(), Err(ConfigError::NoReplicas));
    }

    #[test]
    fn quorum_sizes() {
        let c = config(4, 1);
        assert_eq!(c.quorum(), 3);
        assert_eq!(c.prepare_quorum(), 2);
        assert_eq!(c.weak_quorum(), 2);
    }
}
