//! Cluster tracker: one connected component of the transaction graph.
//!
//! A cluster owns the dependency store of its members, the current
//! linearization and (once refreshed) its chunking. Work after a mutation is
//! tracked with [`Quality`] so that splitting and relinearizing can be
//! deferred until something needs the result.

use crate::chunking::{chunk_linearization, Chunk};
use crate::depgraph::DepGraph;
use crate::feerate::FeePerWeight;
use crate::linearize::{fix_linearization, linearize};
use crate::registry::GraphIndex;
use crate::txset::{DepGraphIndex, TxSet};

const NO_MEMBER: GraphIndex = GraphIndex::MAX;

/// How much deferred work a cluster carries. Ordered from most to least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Quality {
    /// Transactions were removed; the cluster may no longer be connected.
    NeedsSplit,
    /// Connected, but the linearization predates a mutation.
    NeedsRelinearize,
    /// Linearization and chunking are current.
    Acceptable,
}

pub(crate) struct Cluster {
    depgraph: DepGraph,
    /// Entry index per position; `NO_MEMBER` for unused positions.
    members: Vec<GraphIndex>,
    /// Always a topological order of every position in `depgraph`.
    linearization: Vec<DepGraphIndex>,
    chunks: Vec<Chunk>,
    /// Chunk index per position, valid while `quality` is `Acceptable`.
    chunk_of: Vec<usize>,
    quality: Quality,
}

impl Cluster {
    pub fn singleton(index: GraphIndex, feerate: FeePerWeight) -> Self {
        let mut cluster = Self::empty();
        let pos = cluster.depgraph.add_transaction(feerate);
        cluster.set_member(pos, index);
        cluster.linearization.push(pos);
        cluster.refresh_chunks();
        cluster
    }

    fn empty() -> Self {
        Self {
            depgraph: DepGraph::new(),
            members: Vec::new(),
            linearization: Vec::new(),
            chunks: Vec::new(),
            chunk_of: Vec::new(),
            quality: Quality::NeedsRelinearize,
        }
    }

    pub fn depgraph(&self) -> &DepGraph {
        &self.depgraph
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn tx_count(&self) -> usize {
        self.depgraph.tx_count()
    }

    pub fn is_empty(&self) -> bool {
        self.depgraph.tx_count() == 0
    }

    pub fn linearization(&self) -> &[DepGraphIndex] {
        &self.linearization
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn member(&self, pos: DepGraphIndex) -> GraphIndex {
        self.members.get(pos).copied().unwrap_or(NO_MEMBER)
    }

    pub fn set_member(&mut self, pos: DepGraphIndex, index: GraphIndex) {
        if pos >= self.members.len() {
            self.members.resize(pos + 1, NO_MEMBER);
        }
        self.members[pos] = index;
    }

    /// Entry indices of a set of positions, in position order.
    pub fn members_of(&self, set: TxSet) -> impl Iterator<Item = GraphIndex> + '_ {
        set.iter().map(|pos| self.member(pos))
    }

    /// Entry indices in linearization order.
    pub fn members_in_order(&self) -> impl Iterator<Item = GraphIndex> + '_ {
        self.linearization.iter().map(|&pos| self.member(pos))
    }

    fn degrade(&mut self, to: Quality) {
        self.quality = self.quality.min(to);
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub fn remove(&mut self, del: TxSet) {
        self.depgraph.remove_transactions(del);
        let used = self.depgraph.positions();
        self.linearization.retain(|&pos| used.contains(pos));
        self.members.truncate(self.depgraph.position_range());
        for pos in del {
            if pos < self.members.len() {
                self.members[pos] = NO_MEMBER;
            }
        }
        self.degrade(Quality::NeedsSplit);
    }

    pub fn add_dependency(&mut self, parent: DepGraphIndex, child: DepGraphIndex) {
        self.depgraph.add_dependencies(TxSet::singleton(parent), child);
        fix_linearization(&self.depgraph, &mut self.linearization);
        self.degrade(Quality::NeedsRelinearize);
    }

    pub fn set_fee(&mut self, pos: DepGraphIndex, fee: i64) {
        self.depgraph.set_fee(pos, fee);
        self.degrade(Quality::NeedsRelinearize);
    }

    /// Move every transaction of `other` into this cluster, appending its
    /// linearization. Returns the new position of each moved entry.
    pub fn absorb(&mut self, other: Cluster) -> Vec<(GraphIndex, DepGraphIndex)> {
        let map = self.depgraph.import(&other.depgraph, &other.linearization);
        let mut moved = Vec::with_capacity(other.linearization.len());
        for &old_pos in &other.linearization {
            let Some(new_pos) = map[old_pos] else { continue };
            let index = other.member(old_pos);
            self.set_member(new_pos, index);
            self.linearization.push(new_pos);
            moved.push((index, new_pos));
        }
        self.degrade(Quality::NeedsRelinearize);
        moved
    }

    /// Break the cluster into its connected components.
    ///
    /// Returns the cluster itself, marked NeedsRelinearize, when it is still
    /// connected, and nothing when it is empty. Components keep the relative
    /// order of the old linearization and are returned in order of their
    /// lowest old position.
    pub fn split(mut self) -> Vec<Cluster> {
        let mut todo = self.depgraph.positions();
        let mut components = Vec::new();
        while !todo.is_empty() {
            let component = self.depgraph.find_connected_component(todo);
            todo -= component;
            components.push(component);
        }
        match components.len() {
            0 => return Vec::new(),
            1 => {
                self.quality = Quality::NeedsRelinearize;
                return vec![self];
            }
            _ => {}
        }

        components
            .into_iter()
            .map(|component| {
                let order: Vec<DepGraphIndex> = self
                    .linearization
                    .iter()
                    .copied()
                    .filter(|&pos| component.contains(pos))
                    .collect();
                let mut part = Cluster::empty();
                let map = part.depgraph.import(&self.depgraph, &order);
                for &old_pos in &order {
                    if let Some(new_pos) = map[old_pos] {
                        part.set_member(new_pos, self.member(old_pos));
                        part.linearization.push(new_pos);
                    }
                }
                part
            })
            .collect()
    }

    /// Recompute the linearization and chunking. Returns the search
    /// iterations spent.
    pub fn relinearize(&mut self, max_iterations: u64) -> u64 {
        debug_assert!(self.quality != Quality::NeedsSplit, "split before relinearizing");
        let lin = linearize(&self.depgraph, &self.linearization, max_iterations);
        self.linearization = lin.order;
        self.refresh_chunks();
        lin.iterations
    }

    fn refresh_chunks(&mut self) {
        self.chunks = chunk_linearization(&self.depgraph, &self.linearization);
        self.chunk_of = vec![0; self.depgraph.position_range()];
        for (idx, chunk) in self.chunks.iter().enumerate() {
            for pos in chunk.set {
                self.chunk_of[pos] = idx;
            }
        }
        self.quality = Quality::Acceptable;
    }

    /// Feerate of the chunk holding `pos`. Only meaningful when `Acceptable`.
    pub fn chunk_feerate(&self, pos: DepGraphIndex) -> Option<FeePerWeight> {
        if self.quality != Quality::Acceptable {
            return None;
        }
        let idx = *self.chunk_of.get(pos)?;
        self.chunks.get(idx).map(|c| c.feerate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fr(fee: i64) -> FeePerWeight {
        FeePerWeight::new(fee, 100)
    }

    /// Cluster over entry indices `10, 11, ..` in a chain of the given fees.
    fn chain(fees: &[i64]) -> Cluster {
        let mut cluster = Cluster::singleton(10, fr(fees[0]));
        for (i, &fee) in fees.iter().enumerate().skip(1) {
            let other = Cluster::singleton(10 + i as GraphIndex, fr(fee));
            let moved = cluster.absorb(other);
            let (_, pos) = moved[0];
            cluster.add_dependency(pos - 1, pos);
        }
        cluster
    }

    #[test]
    fn singleton_is_acceptable() {
        let cluster = Cluster::singleton(7, fr(100));
        assert_eq!(cluster.quality(), Quality::Acceptable);
        assert_eq!(cluster.chunk_feerate(0), Some(fr(100)));
        assert_eq!(cluster.members_in_order().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn absorb_then_depend_needs_relinearize() {
        let mut cluster = chain(&[100, 400]);
        assert_eq!(cluster.quality(), Quality::NeedsRelinearize);
        assert_eq!(cluster.chunk_feerate(0), None);
        cluster.relinearize(100);
        assert_eq!(cluster.members_in_order().collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(cluster.chunks().len(), 1);
        assert_eq!(cluster.chunk_feerate(1), Some(FeePerWeight::new(500, 200)));
    }

    #[test]
    fn removing_middle_of_fork_splits() {
        // 10 -> 11 <- 12; drop 11.
        let mut cluster = Cluster::singleton(10, fr(1));
        for idx in [11, 12] {
            cluster.absorb(Cluster::singleton(idx, fr(1)));
        }
        cluster.add_dependency(0, 1);
        cluster.add_dependency(2, 1);
        cluster.remove(TxSet::singleton(1));
        assert_eq!(cluster.quality(), Quality::NeedsSplit);

        let parts = cluster.split();
        assert_eq!(parts.len(), 2);
        let members: Vec<Vec<GraphIndex>> = parts
            .iter()
            .map(|c| c.members_in_order().collect())
            .collect();
        assert_eq!(members, vec![vec![10], vec![12]]);
        assert!(parts.iter().all(|c| c.quality() == Quality::NeedsRelinearize));
    }

    #[test]
    fn removing_middle_of_chain_stays_connected() {
        let mut cluster = chain(&[1, 2, 3]);
        cluster.relinearize(100);
        cluster.remove(TxSet::singleton(1));
        let mut parts = cluster.split();
        assert_eq!(parts.len(), 1);
        let mut cluster = parts.remove(0);
        cluster.relinearize(100);
        assert_eq!(cluster.members_in_order().collect::<Vec<_>>(), vec![10, 12]);
    }

    #[test]
    fn removing_everything_leaves_nothing() {
        let mut cluster = chain(&[1, 2]);
        cluster.remove(cluster.depgraph().positions());
        assert!(cluster.is_empty());
        assert!(cluster.split().is_empty());
    }

    #[test]
    fn fee_change_reorders_independent_members() {
        let mut cluster = Cluster::singleton(1, fr(10));
        cluster.absorb(Cluster::singleton(2, fr(5)));
        cluster.relinearize(100);
        assert_eq!(cluster.members_in_order().collect::<Vec<_>>(), vec![1, 2]);
        cluster.set_fee(1, 50);
        cluster.relinearize(100);
        assert_eq!(cluster.members_in_order().collect::<Vec<_>>(), vec![2, 1]);
    }
}
