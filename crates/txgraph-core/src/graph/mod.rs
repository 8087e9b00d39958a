//! The `TxGraph` capability contract and its cluster-based implementation.
//!
//! Mutations are staged. Removal marks an entry gone immediately (it stops
//! existing, its `Ref` empties and the count drops), but the cluster
//! structures are only updated at the next checkpoint: any dependency
//! addition, any query needing cluster state, `compact`, `reconcile` or
//! `sanity_check`. Pending removals are always applied before a dependency
//! addition. So if `C -> B` is added after `B` was removed, the addition is
//! a no-op. The result equals the caller's order of calls whenever a
//! removal takes all ancestors or all descendants of the removed
//! transaction along with it.
//!
//! Removing a transaction keeps the dependencies that ran through it: with
//! `A -> B -> C`, removing `B` leaves `C` descending from `A`.
//!
//! Splitting disconnected clusters and relinearizing are deferred per
//! cluster until a query needs the result.

mod sanity;

use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use serde::Serialize;

use crate::cluster::{Cluster, Quality};
use crate::config::TxGraphConfig;
use crate::error::{SanityError, TxGraphError};
use crate::feerate::{clamp_fee, FeePerWeight};
use crate::registry::{ClusterIndex, GraphIndex, Locator, Ref, RefId, Registry};
use crate::txset::TxSet;

// ==============================================================================
// Capability Contract
// ==============================================================================

/// A chunk as reported to block building and eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkSummary {
    /// Transactions in linearization order.
    pub refs: Vec<RefId>,
    pub feerate: FeePerWeight,
}

/// Pending transactions, their dependencies and the derived mining order.
///
/// Operations on empty refs, refs to removed transactions or refs from
/// another graph are no-ops (queries return empty values).
pub trait TxGraph: Send {
    /// Create a transaction with the given feerate and no dependencies.
    ///
    /// The feerate is stored [`normalized`](FeePerWeight::normalized), so a
    /// size below 1 becomes 1.
    fn add_transaction(&mut self, feerate: FeePerWeight) -> Ref;

    /// Remove a transaction; `arg` becomes empty. No-op if already removed.
    fn remove_transaction(&mut self, arg: &Ref);

    /// Make `child` depend on `parent`.
    ///
    /// A no-op if either does not exist or `parent` already is an ancestor
    /// of `child`. Rejected, leaving the graph unchanged, if `parent`
    /// descends from `child` or the merged cluster would exceed the cluster
    /// limit.
    fn add_dependency(&mut self, parent: &Ref, child: &Ref) -> Result<(), TxGraphError>;

    /// Change the fee of a transaction, keeping its size. The fee is clamped
    /// like in [`FeePerWeight::normalized`].
    fn set_transaction_fee(&mut self, arg: &Ref, fee: i64);

    fn exists(&self, arg: &Ref) -> bool;

    /// The transaction's own feerate, or empty if it does not exist.
    fn get_individual_feerate(&self, arg: &Ref) -> FeePerWeight;

    /// Feerate of the chunk holding the transaction, or empty if it does not
    /// exist.
    fn get_chunk_feerate(&mut self, arg: &Ref) -> FeePerWeight;

    /// The transaction's cluster in linearization order, or empty.
    fn get_cluster(&mut self, arg: &Ref) -> Vec<RefId>;

    /// All ancestors including the transaction itself, in unspecified order.
    fn get_ancestors(&mut self, arg: &Ref) -> Vec<RefId>;

    /// All descendants including the transaction itself, in unspecified
    /// order.
    fn get_descendants(&mut self, arg: &Ref) -> Vec<RefId>;

    fn get_transaction_count(&self) -> usize;

    /// Number of distinct clusters among the existing transactions in `args`.
    fn count_distinct_clusters(&mut self, args: &[&Ref]) -> usize;

    /// Every chunk of the graph, best feerate first. Chunks of one cluster
    /// keep their linearization order.
    fn get_chunks_in_mining_order(&mut self) -> Vec<ChunkSummary>;

    /// The last chunk in mining order.
    fn get_worst_chunk(&mut self) -> Option<ChunkSummary>;

    /// Close holes in the entry arena, updating every live `Ref`.
    fn compact(&mut self);

    /// Apply all deferred removals, splits and relinearizations.
    fn reconcile(&mut self);

    /// Reconcile, then verify every internal invariant. Expensive; meant for
    /// tests and debugging.
    fn sanity_check(&mut self) -> Result<(), SanityError>;
}

/// Construct a graph with the default configuration.
pub fn make_tx_graph() -> Box<dyn TxGraph> {
    Box::new(ClusterTxGraph::new())
}

// ==============================================================================
// Cluster-based Implementation
// ==============================================================================

pub struct ClusterTxGraph {
    config: TxGraphConfig,
    registry: Registry,
    clusters: Vec<Option<Cluster>>,
    free_clusters: BTreeSet<ClusterIndex>,
    to_remove: Vec<GraphIndex>,
}

impl Default for ClusterTxGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterTxGraph {
    pub fn new() -> Self {
        Self {
            config: TxGraphConfig::default(),
            registry: Registry::new(),
            clusters: Vec::new(),
            free_clusters: BTreeSet::new(),
            to_remove: Vec::new(),
        }
    }

    pub fn with_config(config: TxGraphConfig) -> Result<Self, TxGraphError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    pub fn config(&self) -> &TxGraphConfig {
        &self.config
    }

    /// Number of clusters currently tracked (before any deferred split).
    pub fn cluster_count(&self) -> usize {
        self.clusters.iter().filter(|c| c.is_some()).count()
    }

    // ========================================================================
    // Cluster arena
    // ========================================================================

    /// Store a cluster and point each member's locator at it.
    fn place_cluster(&mut self, cluster: Cluster) -> ClusterIndex {
        let ci = match self.free_clusters.pop_first() {
            Some(ci) => ci,
            None => {
                self.clusters.push(None);
                (self.clusters.len() - 1) as ClusterIndex
            }
        };
        for pos in cluster.depgraph().positions() {
            let index = cluster.member(pos);
            if let Some(entry) = self.registry.get_mut(index) {
                entry.locator = Some(Locator { cluster: ci, pos });
            }
        }
        self.clusters[ci as usize] = Some(cluster);
        ci
    }

    fn take_cluster(&mut self, ci: ClusterIndex) -> Option<Cluster> {
        let cluster = self.clusters.get_mut(ci as usize)?.take()?;
        self.free_clusters.insert(ci);
        Some(cluster)
    }

    fn cluster(&self, ci: ClusterIndex) -> Option<&Cluster> {
        self.clusters.get(ci as usize)?.as_ref()
    }

    fn cluster_mut(&mut self, ci: ClusterIndex) -> Option<&mut Cluster> {
        self.clusters.get_mut(ci as usize)?.as_mut()
    }

    fn locator(&self, index: GraphIndex) -> Option<Locator> {
        self.registry.get(index)?.locator
    }

    // ========================================================================
    // Deferred work
    // ========================================================================

    /// Apply queued removals to the cluster structures and free their
    /// entry indices.
    fn apply_removals(&mut self) {
        if self.to_remove.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.to_remove);
        let mut per_cluster: BTreeMap<ClusterIndex, TxSet> = BTreeMap::new();
        for &index in &pending {
            if let Some(loc) = self.locator(index) {
                per_cluster.entry(loc.cluster).or_default().insert(loc.pos);
            }
        }
        for (&ci, &del) in &per_cluster {
            let Some(cluster) = self.cluster_mut(ci) else {
                continue;
            };
            cluster.remove(del);
            if cluster.is_empty() {
                self.take_cluster(ci);
            }
        }
        for &index in &pending {
            self.registry.free(index);
        }
        tracing::debug!(
            removed = pending.len(),
            clusters = per_cluster.len(),
            "applied pending removals"
        );

        let threshold = self.config.compaction_threshold;
        if threshold > 0 && self.registry.free_count() >= threshold {
            self.compact_entries();
        }
    }

    /// Split the cluster if removals may have disconnected it.
    fn split_cluster(&mut self, ci: ClusterIndex) {
        if self.cluster(ci).map(Cluster::quality) != Some(Quality::NeedsSplit) {
            return;
        }
        let Some(cluster) = self.take_cluster(ci) else {
            return;
        };
        let parts = cluster.split();
        let count = parts.len();
        for part in parts {
            self.place_cluster(part);
        }
        if count > 1 {
            tracing::debug!(cluster = ci, parts = count, "split cluster");
        }
    }

    fn relinearize_cluster(&mut self, ci: ClusterIndex) {
        let max_iterations = self.config.max_search_iterations;
        let Some(cluster) = self.cluster_mut(ci) else {
            return;
        };
        if cluster.quality() != Quality::NeedsRelinearize {
            return;
        }
        let iterations = cluster.relinearize(max_iterations);
        tracing::debug!(
            cluster = ci,
            txs = cluster.tx_count(),
            chunks = cluster.chunks().len(),
            iterations,
            "relinearized cluster"
        );
    }

    /// Make the cluster of `index` connected and return it.
    fn split_for(&mut self, index: GraphIndex) -> Option<ClusterIndex> {
        let ci = self.locator(index)?.cluster;
        self.split_cluster(ci);
        Some(self.locator(index)?.cluster)
    }

    /// Make the cluster of `index` fully up to date and return it.
    fn refresh_for(&mut self, index: GraphIndex) -> Option<ClusterIndex> {
        let ci = self.split_for(index)?;
        self.relinearize_cluster(ci);
        Some(ci)
    }

    fn compact_entries(&mut self) {
        let clusters = &mut self.clusters;
        let moved = self.registry.compact(|_from, to, entry| {
            if let Some(loc) = entry.locator {
                if let Some(Some(cluster)) = clusters.get_mut(loc.cluster as usize) {
                    cluster.set_member(loc.pos, to);
                }
            }
        });
        if moved > 0 {
            tracing::debug!(moved, "compacted entry arena");
        }
    }

    fn ref_ids(&self, indices: impl Iterator<Item = GraphIndex>) -> Vec<RefId> {
        indices
            .filter_map(|index| self.registry.get(index).map(|e| e.ref_id))
            .collect()
    }

    /// Resolve `arg` after applying pending removals.
    fn resolve_applied(&mut self, arg: &Ref) -> Option<GraphIndex> {
        self.apply_removals();
        self.registry.resolve(arg)
    }

    fn chunks_of(&self, cluster: &Cluster) -> Vec<ChunkSummary> {
        let lin = cluster.linearization();
        cluster
            .chunks()
            .iter()
            .map(|chunk| {
                let members = lin[chunk.start..chunk.end].iter().map(|&pos| cluster.member(pos));
                ChunkSummary {
                    refs: self.ref_ids(members),
                    feerate: chunk.feerate,
                }
            })
            .collect()
    }

    fn merge_clusters(
        &mut self,
        parent_ci: ClusterIndex,
        child_ci: ClusterIndex,
    ) -> Option<ClusterIndex> {
        let parent_count = self.cluster(parent_ci)?.tx_count();
        let child_count = self.cluster(child_ci)?.tx_count();
        // Keep the larger cluster in place so fewer entries move.
        let (target, source) = if child_count > parent_count {
            (child_ci, parent_ci)
        } else {
            (parent_ci, child_ci)
        };
        let absorbed = self.take_cluster(source)?;
        let moved = self.cluster_mut(target)?.absorb(absorbed);
        for &(index, pos) in &moved {
            if let Some(entry) = self.registry.get_mut(index) {
                entry.locator = Some(Locator {
                    cluster: target,
                    pos,
                });
            }
        }
        tracing::debug!(
            into = target,
            from = source,
            moved = moved.len(),
            "merged clusters"
        );
        Some(target)
    }
}

// ==============================================================================
// Mining order helpers
// ==============================================================================

/// Head of one cluster's remaining chunk list, ordered so that the heap pops
/// the best chunk: higher feerate, then smaller size, then lower first
/// `RefId`.
struct ChunkHead {
    feerate: FeePerWeight,
    first: RefId,
    source: usize,
}

impl PartialEq for ChunkHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for ChunkHead {}

impl PartialOrd for ChunkHead {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkHead {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.feerate
            .cmp_preference(&other.feerate)
            .then_with(|| other.first.cmp(&self.first))
            .then_with(|| other.source.cmp(&self.source))
    }
}

// ==============================================================================
// TxGraph implementation
// ==============================================================================

impl TxGraph for ClusterTxGraph {
    fn add_transaction(&mut self, feerate: FeePerWeight) -> Ref {
        let feerate = feerate.normalized();
        let (index, arg) = self.registry.insert(feerate);
        let ci = self.place_cluster(Cluster::singleton(index, feerate));
        tracing::trace!(index, cluster = ci, %feerate, "added transaction");
        arg
    }

    fn remove_transaction(&mut self, arg: &Ref) {
        let Some(index) = self.registry.resolve(arg) else {
            return;
        };
        self.registry.unlink(index);
        self.to_remove.push(index);
        tracing::trace!(index, "queued transaction removal");
    }

    fn add_dependency(&mut self, parent: &Ref, child: &Ref) -> Result<(), TxGraphError> {
        self.apply_removals();
        let (Some(par), Some(chl)) = (self.registry.resolve(parent), self.registry.resolve(child))
        else {
            return Ok(());
        };
        if par == chl {
            return Ok(());
        }

        self.split_for(par);
        self.split_for(chl);
        let (Some(par_loc), Some(chl_loc)) = (self.locator(par), self.locator(chl)) else {
            return Ok(());
        };

        if par_loc.cluster == chl_loc.cluster {
            let Some(cluster) = self.cluster_mut(par_loc.cluster) else {
                return Ok(());
            };
            let depgraph = cluster.depgraph();
            if depgraph.ancestors(chl_loc.pos).contains(par_loc.pos) {
                return Ok(());
            }
            if depgraph.descendants(chl_loc.pos).contains(par_loc.pos) {
                tracing::warn!(
                    parent = par,
                    child = chl,
                    "rejected dependency: would create a cycle"
                );
                return Err(TxGraphError::WouldCycle);
            }
            cluster.add_dependency(par_loc.pos, chl_loc.pos);
            tracing::trace!(
                parent = par,
                child = chl,
                cluster = par_loc.cluster,
                "added dependency"
            );
            return Ok(());
        }

        let limit = self.config.max_cluster_count;
        let count = self.cluster(par_loc.cluster).map_or(0, Cluster::tx_count)
            + self.cluster(chl_loc.cluster).map_or(0, Cluster::tx_count);
        if count > limit {
            tracing::warn!(
                parent = par,
                child = chl,
                count,
                limit,
                "rejected dependency: cluster limit exceeded"
            );
            return Err(TxGraphError::ClusterLimitExceeded { count, limit });
        }

        let Some(target) = self.merge_clusters(par_loc.cluster, chl_loc.cluster) else {
            return Ok(());
        };
        let (Some(par_loc), Some(chl_loc)) = (self.locator(par), self.locator(chl)) else {
            return Ok(());
        };
        if let Some(cluster) = self.cluster_mut(target) {
            cluster.add_dependency(par_loc.pos, chl_loc.pos);
        }
        tracing::trace!(parent = par, child = chl, cluster = target, "added dependency");
        Ok(())
    }

    fn set_transaction_fee(&mut self, arg: &Ref, fee: i64) {
        let fee = clamp_fee(fee);
        let Some(index) = self.registry.resolve(arg) else {
            return;
        };
        let Some(entry) = self.registry.get_mut(index) else {
            return;
        };
        entry.feerate.fee = fee;
        let locator = entry.locator;
        if let Some(loc) = locator {
            if let Some(cluster) = self.cluster_mut(loc.cluster) {
                cluster.set_fee(loc.pos, fee);
            }
        }
        tracing::trace!(index, fee, "set transaction fee");
    }

    fn exists(&self, arg: &Ref) -> bool {
        self.registry.resolve(arg).is_some()
    }

    fn get_individual_feerate(&self, arg: &Ref) -> FeePerWeight {
        self.registry
            .resolve(arg)
            .and_then(|index| self.registry.get(index))
            .map_or(FeePerWeight::EMPTY, |entry| entry.feerate)
    }

    fn get_chunk_feerate(&mut self, arg: &Ref) -> FeePerWeight {
        let Some(index) = self.resolve_applied(arg) else {
            return FeePerWeight::EMPTY;
        };
        let Some(ci) = self.refresh_for(index) else {
            return FeePerWeight::EMPTY;
        };
        let pos = self.locator(index).map(|loc| loc.pos);
        self.cluster(ci)
            .zip(pos)
            .and_then(|(cluster, pos)| cluster.chunk_feerate(pos))
            .unwrap_or(FeePerWeight::EMPTY)
    }

    fn get_cluster(&mut self, arg: &Ref) -> Vec<RefId> {
        let Some(index) = self.resolve_applied(arg) else {
            return Vec::new();
        };
        let Some(ci) = self.refresh_for(index) else {
            return Vec::new();
        };
        match self.cluster(ci) {
            Some(cluster) => self.ref_ids(cluster.members_in_order()),
            None => Vec::new(),
        }
    }

    fn get_ancestors(&mut self, arg: &Ref) -> Vec<RefId> {
        let Some(index) = self.resolve_applied(arg) else {
            return Vec::new();
        };
        let Some(loc) = self.locator(index) else {
            return Vec::new();
        };
        match self.cluster(loc.cluster) {
            Some(cluster) => {
                self.ref_ids(cluster.members_of(cluster.depgraph().ancestors(loc.pos)))
            }
            None => Vec::new(),
        }
    }

    fn get_descendants(&mut self, arg: &Ref) -> Vec<RefId> {
        let Some(index) = self.resolve_applied(arg) else {
            return Vec::new();
        };
        let Some(loc) = self.locator(index) else {
            return Vec::new();
        };
        match self.cluster(loc.cluster) {
            Some(cluster) => {
                self.ref_ids(cluster.members_of(cluster.depgraph().descendants(loc.pos)))
            }
            None => Vec::new(),
        }
    }

    fn get_transaction_count(&self) -> usize {
        self.registry.live_count()
    }

    fn count_distinct_clusters(&mut self, args: &[&Ref]) -> usize {
        self.apply_removals();
        let mut seen = BTreeSet::new();
        for arg in args {
            if let Some(index) = self.registry.resolve(arg) {
                if let Some(ci) = self.split_for(index) {
                    seen.insert(ci);
                }
            }
        }
        seen.len()
    }

    fn get_chunks_in_mining_order(&mut self) -> Vec<ChunkSummary> {
        self.reconcile();

        let mut queues: Vec<std::collections::VecDeque<ChunkSummary>> = self
            .clusters
            .iter()
            .flatten()
            .map(|cluster| self.chunks_of(cluster).into())
            .collect();

        let mut heap = BinaryHeap::new();
        for (source, queue) in queues.iter().enumerate() {
            if let Some(head) = queue.front() {
                heap.push(ChunkHead {
                    feerate: head.feerate,
                    first: head.refs.first().copied().unwrap_or(RefId(u64::MAX)),
                    source,
                });
            }
        }

        let mut out = Vec::new();
        while let Some(ChunkHead { source, .. }) = heap.pop() {
            let Some(chunk) = queues[source].pop_front() else {
                continue;
            };
            out.push(chunk);
            if let Some(head) = queues[source].front() {
                heap.push(ChunkHead {
                    feerate: head.feerate,
                    first: head.refs.first().copied().unwrap_or(RefId(u64::MAX)),
                    source,
                });
            }
        }
        out
    }

    fn get_worst_chunk(&mut self) -> Option<ChunkSummary> {
        self.get_chunks_in_mining_order().pop()
    }

    fn compact(&mut self) {
        self.apply_removals();
        self.compact_entries();
    }

    fn reconcile(&mut self) {
        self.apply_removals();
        let mut ci = 0;
        while ci < self.clusters.len() {
            self.split_cluster(ci as ClusterIndex);
            ci += 1;
        }
        for ci in 0..self.clusters.len() {
            self.relinearize_cluster(ci as ClusterIndex);
        }
    }

    fn sanity_check(&mut self) -> Result<(), SanityError> {
        self.reconcile();
        self.check_invariants()
    }
}

// ==============================================================================
// Tests
// ==============================================================================
