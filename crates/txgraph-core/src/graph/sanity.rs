//! Full consistency check of a reconciled `ClusterTxGraph`.

use std::collections::BTreeSet;

use super::ClusterTxGraph;
use crate::chunking::chunk_linearization;
use crate::cluster::{Cluster, Quality};
use crate::error::SanityError;
use crate::feerate::FeePerWeight;
use crate::linearize::is_topological;
use crate::registry::{ClusterIndex, GraphIndex, Locator};
use crate::txset::TxSet;

impl ClusterTxGraph {
    /// Verify every invariant. Expects no deferred work to be pending.
    pub(super) fn check_invariants(&self) -> Result<(), SanityError> {
        self.check_registry()?;
        let mut total = 0;
        for (ci, cluster) in self.clusters.iter().enumerate() {
            let ci = ci as ClusterIndex;
            match cluster {
                Some(cluster) => {
                    if self.free_clusters.contains(&ci) {
                        return Err(cluster_err(ci, "occupied slot is on the free list"));
                    }
                    self.check_cluster(ci, cluster)?;
                    total += cluster.tx_count();
                }
                None if !self.free_clusters.contains(&ci) => {
                    return Err(cluster_err(ci, "empty slot missing from the free list"));
                }
                None => {}
            }
        }
        if total != self.registry.live_count() {
            return Err(SanityError::Registry(format!(
                "clusters hold {total} transactions, registry counts {}",
                self.registry.live_count()
            )));
        }
        Ok(())
    }

    fn check_registry(&self) -> Result<(), SanityError> {
        if !self.to_remove.is_empty() {
            return Err(SanityError::Registry(format!(
                "{} removals still pending",
                self.to_remove.len()
            )));
        }

        let mut ref_ids = BTreeSet::new();
        let mut count = 0;
        let mut orphaned = 0;
        for (index, entry) in self.registry.iter() {
            count += 1;
            if !self.registry.is_owned(index) {
                orphaned += 1;
            }
            if entry.removed {
                return Err(SanityError::Registry(format!(
                    "entry {index} is removed but not freed"
                )));
            }
            if !ref_ids.insert(entry.ref_id) {
                return Err(SanityError::Registry(format!(
                    "ref id {} appears twice",
                    entry.ref_id
                )));
            }
            let Some(Locator { cluster: ci, pos }) = entry.locator else {
                return Err(SanityError::Registry(format!("entry {index} has no cluster")));
            };
            let Some(cluster) = self.cluster(ci) else {
                return Err(SanityError::Registry(format!(
                    "entry {index} points at missing cluster {ci}"
                )));
            };
            if !cluster.depgraph().positions().contains(pos) || cluster.member(pos) != index {
                return Err(SanityError::Registry(format!(
                    "entry {index} points at cluster {ci} position {pos}, which holds {}",
                    cluster.member(pos)
                )));
            }
        }
        if count != self.registry.live_count() {
            return Err(SanityError::Registry(format!(
                "{count} entries allocated, live count is {}",
                self.registry.live_count()
            )));
        }

        if orphaned > 0 {
            tracing::debug!(orphaned, "transactions without a live ref");
        }

        for index in 0..self.registry.capacity() as GraphIndex {
            let allocated = self.registry.get(index).is_some();
            if allocated == self.registry.is_free(index) {
                return Err(SanityError::Registry(format!(
                    "slot {index} allocated={allocated} disagrees with the free list"
                )));
            }
        }
        Ok(())
    }

    fn check_cluster(&self, ci: ClusterIndex, cluster: &Cluster) -> Result<(), SanityError> {
        let depgraph = cluster.depgraph();
        let used = depgraph.positions();

        if cluster.is_empty() {
            return Err(cluster_err(ci, "empty"));
        }
        if cluster.tx_count() > self.config.max_cluster_count {
            return Err(cluster_err(
                ci,
                format!(
                    "{} transactions exceed the limit of {}",
                    cluster.tx_count(),
                    self.config.max_cluster_count
                ),
            ));
        }
        if cluster.quality() != Quality::Acceptable {
            return Err(cluster_err(ci, format!("left in state {:?}", cluster.quality())));
        }
        for pos in used {
            let index = cluster.member(pos);
            let expected = Some(Locator { cluster: ci, pos });
            if self.registry.get(index).and_then(|e| e.locator) != expected {
                return Err(cluster_err(
                    ci,
                    format!("position {pos} holds entry {index}, which points elsewhere"),
                ));
            }
        }
        if !depgraph.is_connected(used) {
            return Err(cluster_err(ci, "not connected"));
        }

        // Closure: reflexive, acyclic, transitive, mirrored.
        for pos in used {
            let anc = depgraph.ancestors(pos);
            let desc = depgraph.descendants(pos);
            let closure_err = |reason: String| SanityError::Closure {
                cluster: ci,
                reason,
            };
            if !anc.contains(pos) || !desc.contains(pos) {
                return Err(closure_err(format!("position {pos} does not contain itself")));
            }
            if !anc.is_subset_of(used) || !desc.is_subset_of(used) {
                return Err(closure_err(format!("position {pos} reaches unused positions")));
            }
            if anc & desc != TxSet::singleton(pos) {
                return Err(closure_err(format!("position {pos} is on a cycle")));
            }
            for a in anc {
                if !depgraph.descendants(a).contains(pos) {
                    return Err(closure_err(format!("{a} -> {pos} is not mirrored")));
                }
                if !depgraph.ancestors(a).is_subset_of(anc) {
                    return Err(closure_err(format!("ancestors of {pos} are not transitive")));
                }
            }

            // The reduced parents alone regenerate the ancestor set.
            let parents = depgraph.reduced_parents(pos);
            let mut regenerated = TxSet::singleton(pos);
            for p in parents {
                if (depgraph.ancestors(p) & parents) != TxSet::singleton(p) {
                    return Err(closure_err(format!("reduced parent {p} of {pos} is implied")));
                }
                regenerated |= depgraph.ancestors(p);
            }
            if regenerated != anc {
                return Err(closure_err(format!("reduced parents of {pos} lose ancestors")));
            }
        }

        let lin = cluster.linearization();
        if !is_topological(depgraph, lin) {
            return Err(SanityError::Linearization {
                cluster: ci,
                reason: format!("{lin:?} is not a topological order"),
            });
        }

        self.check_chunks(ci, cluster)
    }

    fn check_chunks(&self, ci: ClusterIndex, cluster: &Cluster) -> Result<(), SanityError> {
        let depgraph = cluster.depgraph();
        let lin = cluster.linearization();
        let chunks = cluster.chunks();
        let chunk_err = |reason: String| SanityError::Chunking {
            cluster: ci,
            reason,
        };

        let mut next = 0;
        let mut prev: Option<FeePerWeight> = None;
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.start != next || chunk.is_empty() || chunk.end > lin.len() {
                return Err(chunk_err(format!(
                    "chunk {i} spans {}..{} after {next}",
                    chunk.start, chunk.end
                )));
            }
            let set: TxSet = lin[chunk.start..chunk.end].iter().copied().collect();
            if set != chunk.set {
                return Err(chunk_err(format!("chunk {i} set does not match its span")));
            }
            if depgraph.feerate_of(set) != chunk.feerate {
                return Err(chunk_err(format!("chunk {i} feerate {} is stale", chunk.feerate)));
            }
            if prev.is_some_and(|p| chunk.feerate.feerate_gt(&p)) {
                return Err(chunk_err(format!("chunk {i} beats the chunk before it")));
            }
            if !depgraph.is_connected(set) {
                return Err(chunk_err(format!("chunk {i} is not connected")));
            }
            for pos in set {
                if cluster.chunk_feerate(pos) != Some(chunk.feerate) {
                    return Err(chunk_err(format!("position {pos} maps to the wrong chunk")));
                }
            }
            prev = Some(chunk.feerate);
            next = chunk.end;
        }
        if next != lin.len() {
            return Err(chunk_err(format!("chunks cover {next} of {} transactions", lin.len())));
        }
        if chunk_linearization(depgraph, lin) != chunks {
            return Err(chunk_err("chunks differ from a fresh chunking".to_string()));
        }
        Ok(())
    }
}

fn cluster_err(cluster: ClusterIndex, reason: impl Into<String>) -> SanityError {
    SanityError::Cluster {
        cluster,
        reason: reason.into(),
    }
}
