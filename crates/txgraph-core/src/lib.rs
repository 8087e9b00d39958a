//! In-memory transaction dependency graph for a mempool.
//!
//! Transactions are grouped into clusters (connected components of the
//! dependency graph). Each cluster keeps a linearization and its chunking,
//! from which block building and eviction read a mining order. See
//! [`graph::TxGraph`] for the operations.

pub mod chunking;
pub(crate) mod cluster;
pub mod config;
pub mod depgraph;
pub mod error;
pub mod feerate;
pub mod graph;
pub mod linearize;
pub mod registry;
pub mod txset;

#[cfg(test)]
mod test_util;

pub use config::TxGraphConfig;
pub use error::{SanityError, TxGraphError};
pub use feerate::FeePerWeight;
pub use graph::{make_tx_graph, ChunkSummary, ClusterTxGraph, TxGraph};
pub use registry::{Ref, RefId};
