use serde::{Deserialize, Serialize};

use crate::error::TxGraphError;
use crate::txset::TX_SET_CAPACITY;

/// Default cap on the number of transactions in one cluster.
pub const CLUSTER_COUNT_LIMIT: usize = 64;

/// Tunables for a [`ClusterTxGraph`](crate::graph::ClusterTxGraph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxGraphConfig {
    /// No connected component may exceed this many transactions. At most 64.
    pub max_cluster_count: usize,
    /// Iteration budget of the candidate search per relinearization.
    /// Zero falls back to the ancestor-set heuristic alone.
    pub max_search_iterations: u64,
    /// Free entry slots that trigger an automatic compaction once removals
    /// are applied. Zero disables automatic compaction.
    pub compaction_threshold: usize,
}

impl Default for TxGraphConfig {
    fn default() -> Self {
        Self {
            max_cluster_count: CLUSTER_COUNT_LIMIT,
            max_search_iterations: 10_000,
            compaction_threshold: 128,
        }
    }
}

impl TxGraphConfig {
    pub fn validate(&self) -> Result<(), TxGraphError> {
        if self.max_cluster_count == 0 || self.max_cluster_count > TX_SET_CAPACITY {
            return Err(TxGraphError::InvalidConfig(format!(
                "max_cluster_count must be in 1..={TX_SET_CAPACITY}, got {}",
                self.max_cluster_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        TxGraphConfig::default()
            .validate()
            .expect("default config validates");
    }

    #[test]
    fn cluster_cap_is_bounded_by_set_capacity() {
        let config = TxGraphConfig {
            max_cluster_count: 65,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TxGraphError::InvalidConfig(_))
        ));

        let config = TxGraphConfig {
            max_cluster_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: TxGraphConfig =
            serde_json::from_str(r#"{"max_cluster_count": 8}"#).expect("parse config");
        assert_eq!(config.max_cluster_count, 8);
        assert_eq!(config.max_search_iterations, 10_000);
        assert_eq!(config.compaction_threshold, 128);
    }
}
