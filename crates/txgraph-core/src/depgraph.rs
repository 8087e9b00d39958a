//! Dependency store for a single cluster.
//!
//! Only the transitive closure is kept: every position knows its full
//! ancestor and descendant sets (itself included). Direct edges are not
//! recorded, so "A spends B, B spends C" and "A spends B and C" are the same
//! state. Removing a transaction keeps the closure among the survivors, so a
//! dependency that ran through a removed transaction stays in force.

use crate::feerate::FeePerWeight;
use crate::txset::{DepGraphIndex, TxSet, TX_SET_CAPACITY};

#[derive(Debug, Clone, Default)]
struct DepEntry {
    feerate: FeePerWeight,
    ancestors: TxSet,
    descendants: TxSet,
}

/// Closure-based dependency graph over at most 64 positions.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    entries: Vec<DepEntry>,
    used: TxSet,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// All positions currently holding a transaction.
    pub fn positions(&self) -> TxSet {
        self.used
    }

    pub fn tx_count(&self) -> usize {
        self.used.count()
    }

    /// One past the highest position that may be in use.
    pub fn position_range(&self) -> usize {
        self.entries.len()
    }

    pub fn ancestors(&self, pos: DepGraphIndex) -> TxSet {
        self.entries[pos].ancestors
    }

    pub fn descendants(&self, pos: DepGraphIndex) -> TxSet {
        self.entries[pos].descendants
    }

    pub fn feerate(&self, pos: DepGraphIndex) -> FeePerWeight {
        self.entries[pos].feerate
    }

    pub fn set_fee(&mut self, pos: DepGraphIndex, fee: i64) {
        self.entries[pos].feerate.fee = fee;
    }

    /// Aggregate feerate of a set of positions.
    pub fn feerate_of(&self, set: TxSet) -> FeePerWeight {
        set.iter().map(|pos| self.entries[pos].feerate).sum()
    }

    /// Add a transaction without dependencies at the lowest free position.
    ///
    /// The caller guarantees fewer than 64 positions are in use.
    pub fn add_transaction(&mut self, feerate: FeePerWeight) -> DepGraphIndex {
        let pos = (!self.used).first().unwrap_or(TX_SET_CAPACITY);
        debug_assert!(pos < TX_SET_CAPACITY, "dependency graph is full");
        let entry = DepEntry {
            feerate,
            ancestors: TxSet::singleton(pos),
            descendants: TxSet::singleton(pos),
        };
        if pos == self.entries.len() {
            self.entries.push(entry);
        } else {
            self.entries[pos] = entry;
        }
        self.used.insert(pos);
        pos
    }

    /// Make `child` depend on every position in `parents`, updating the
    /// closure of everything above and below.
    pub fn add_dependencies(&mut self, parents: TxSet, child: DepGraphIndex) {
        let mut par_anc = TxSet::EMPTY;
        for parent in parents {
            par_anc |= self.entries[parent].ancestors;
        }
        par_anc -= self.entries[child].ancestors;
        if par_anc.is_empty() {
            return;
        }
        let chl_des = self.entries[child].descendants;
        for anc in par_anc {
            self.entries[anc].descendants |= chl_des;
        }
        for des in chl_des {
            self.entries[des].ancestors |= par_anc;
        }
    }

    /// Drop positions from the graph. The closure between the remaining
    /// positions is unchanged.
    pub fn remove_transactions(&mut self, del: TxSet) {
        let del = del & self.used;
        self.used -= del;
        for pos in self.used {
            let entry = &mut self.entries[pos];
            entry.ancestors -= del;
            entry.descendants -= del;
        }
        for pos in del {
            self.entries[pos] = DepEntry::default();
        }
        let keep = self
            .used
            .iter()
            .last()
            .map(|highest| highest + 1)
            .unwrap_or(0);
        self.entries.truncate(keep);
    }

    /// Parents of `pos` that are not implied by any other parent.
    pub fn reduced_parents(&self, pos: DepGraphIndex) -> TxSet {
        let mut parents = self.ancestors(pos) - TxSet::singleton(pos);
        for anc in parents {
            if parents.contains(anc) {
                parents -= self.ancestors(anc) - TxSet::singleton(anc);
            }
        }
        parents
    }

    /// The connected component (within `within`) containing the lowest
    /// position of `within`.
    pub fn find_connected_component(&self, within: TxSet) -> TxSet {
        let Some(start) = within.first() else {
            return TxSet::EMPTY;
        };
        let mut component = TxSet::singleton(start);
        let mut frontier = component;
        while !frontier.is_empty() {
            let mut reach = TxSet::EMPTY;
            for pos in frontier {
                reach |= self.entries[pos].ancestors | self.entries[pos].descendants;
            }
            frontier = (reach & within) - component;
            component |= frontier;
        }
        component
    }

    pub fn is_connected(&self, set: TxSet) -> bool {
        self.find_connected_component(set) == set
    }

    /// Copy the positions listed in `order` (parents before children) from
    /// `other` into this graph, keeping the dependencies among them.
    ///
    /// Returns a map from `other` positions to positions in `self`.
    pub fn import(
        &mut self,
        other: &DepGraph,
        order: &[DepGraphIndex],
    ) -> Vec<Option<DepGraphIndex>> {
        let mut map = vec![None; other.position_range()];
        let imported: TxSet = order.iter().copied().collect();
        for &pos in order {
            map[pos] = Some(self.add_transaction(other.feerate(pos)));
        }
        for &pos in order {
            let Some(new_pos) = map[pos] else { continue };
            let parents: TxSet = ((other.ancestors(pos) & imported) - TxSet::singleton(pos))
                .iter()
                .filter_map(|p| map[p])
                .collect();
            self.add_dependencies(parents, new_pos);
        }
        map
    }
}
