/// Rejected mutations and configuration problems.
///
/// Operations on stale or empty refs are not errors; they are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxGraphError {
    #[error("dependency would create a cycle: parent already descends from child")]
    WouldCycle,

    #[error("merged cluster would hold {count} transactions, limit is {limit}")]
    ClusterLimitExceeded { count: usize, limit: usize },

    #[error("invalid graph configuration: {0}")]
    InvalidConfig(String),
}

/// Internal invariant violations reported by `sanity_check`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SanityError {
    #[error("registry: {0}")]
    Registry(String),

    #[error("dependency closure of cluster {cluster}: {reason}")]
    Closure { cluster: u32, reason: String },

    #[error("cluster {cluster}: {reason}")]
    Cluster { cluster: u32, reason: String },

    #[error("linearization of cluster {cluster}: {reason}")]
    Linearization { cluster: u32, reason: String },

    #[error("chunking of cluster {cluster}: {reason}")]
    Chunking { cluster: u32, reason: String },
}
