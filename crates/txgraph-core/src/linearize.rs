//! Cluster linearization.
//!
//! A linearization is built in three steps:
//!
//! 1. Candidate construction: repeatedly move the best topologically closed
//!    subset of what remains to the output. The best remaining ancestor set
//!    seeds each step and a bounded branch-and-bound search tries to beat
//!    it.
//! 2. Merging with the previous linearization of the cluster, so the result
//!    is never worse than the order the cluster already had.
//! 3. Post-linearization, which reorders and groups transactions so that
//!    every resulting chunk is connected.
//!
//! Every step is deterministic for a given dependency graph and input
//! order.

use crate::chunking::best_prefix;
use crate::depgraph::DepGraph;
use crate::feerate::FeePerWeight;
use crate::txset::{DepGraphIndex, TxSet};

/// Outcome of [`linearize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linearization {
    pub order: Vec<DepGraphIndex>,
    /// Search iterations spent.
    pub iterations: u64,
}

// ==============================================================================
// Topology Helpers
// ==============================================================================

/// Whether `lin` lists every position of `depgraph` exactly once with parents
/// before children.
pub fn is_topological(depgraph: &DepGraph, lin: &[DepGraphIndex]) -> bool {
    let mut done = TxSet::EMPTY;
    for &pos in lin {
        if !depgraph.positions().contains(pos) || done.contains(pos) {
            return false;
        }
        if !(depgraph.ancestors(pos) - TxSet::singleton(pos)).is_subset_of(done) {
            return false;
        }
        done.insert(pos);
    }
    done == depgraph.positions()
}

/// Turn `lin` into a valid linearization of `depgraph` while moving as few
/// transactions as possible.
///
/// Positions no longer in the graph and duplicates are dropped. Missing
/// positions are appended. Then each step emits the earliest remaining
/// transaction whose ancestors have all been emitted.
pub fn fix_linearization(depgraph: &DepGraph, lin: &mut Vec<DepGraphIndex>) {
    let used = depgraph.positions();
    let mut seen = TxSet::EMPTY;
    lin.retain(|&pos| {
        if used.contains(pos) && !seen.contains(pos) {
            seen.insert(pos);
            true
        } else {
            false
        }
    });
    lin.extend((used - seen).iter());

    let mut pending = std::mem::take(lin);
    let mut done = TxSet::EMPTY;
    while !pending.is_empty() {
        let next = pending
            .iter()
            .position(|&pos| (depgraph.ancestors(pos) - done) == TxSet::singleton(pos))
            .unwrap_or(0);
        let pos = pending.remove(next);
        done.insert(pos);
        lin.push(pos);
    }
}

/// List a closed set in topological order: fewer in-set ancestors first,
/// then lower position.
fn emit_closed_set(depgraph: &DepGraph, set: TxSet) -> Vec<DepGraphIndex> {
    let mut out: Vec<DepGraphIndex> = set.iter().collect();
    out.sort_by_key(|&pos| ((depgraph.ancestors(pos) & set).count(), pos));
    out
}

// ==============================================================================
// Candidate Finding
// ==============================================================================

/// The remaining ancestor set (ancestors restricted to `todo`) with the
/// best feerate. Equal feerates prefer the smaller set, then the lower
/// position.
fn best_ancestor_candidate(depgraph: &DepGraph, todo: TxSet) -> (TxSet, FeePerWeight) {
    let mut best = (TxSet::EMPTY, FeePerWeight::EMPTY);
    for pos in todo {
        let set = depgraph.ancestors(pos) & todo;
        let fee = depgraph.feerate_of(set);
        if best.0.is_empty() || fee.cmp_preference(&best.1).is_gt() {
            best = (set, fee);
        }
    }
    best
}

/// Total order on individual feerates for the knapsack bound. Sizes below 1
/// rank above every positive size and compare among themselves by fee.
fn cmp_bound_order(a: &FeePerWeight, b: &FeePerWeight) -> std::cmp::Ordering {
    match (a.size > 0, b.size > 0) {
        (true, true) => a.cmp_feerate(b),
        (false, false) => a.fee.cmp(&b.fee),
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
    }
}

/// Upper bound on the feerate reachable by adding any subset of `und` to
/// `inc`, ignoring topology.
fn potential(
    depgraph: &DepGraph,
    inc: TxSet,
    inc_fee: FeePerWeight,
    und: TxSet,
) -> FeePerWeight {
    let mut candidates: Vec<(FeePerWeight, DepGraphIndex)> =
        und.iter().map(|pos| (depgraph.feerate(pos), pos)).collect();
    candidates.sort_by(|a, b| cmp_bound_order(&b.0, &a.0).then(a.1.cmp(&b.1)));

    let mut pot = inc_fee;
    let mut empty = inc.is_empty();
    for (fee, _) in candidates {
        if empty || fee.feerate_gt(&pot) {
            pot += fee;
            empty = false;
        } else {
            break;
        }
    }
    pot
}

/// Branch-and-bound over topologically closed subsets of `todo`.
///
/// Each work item splits on one undecided transaction: either it is
/// excluded together with its descendants, or included together with its
/// ancestors. Items whose potential cannot beat the best set found so far
/// are dropped. Stops early when `budget` runs out; the returned set is
/// always closed within `todo`.
fn search_candidate(
    depgraph: &DepGraph,
    todo: TxSet,
    initial: (TxSet, FeePerWeight),
    budget: &mut u64,
) -> (TxSet, FeePerWeight) {
    let mut best = initial;
    let mut stack: Vec<(TxSet, FeePerWeight, TxSet)> =
        vec![(TxSet::EMPTY, FeePerWeight::EMPTY, todo)];

    while let Some((inc, inc_fee, und)) = stack.pop() {
        if *budget == 0 {
            break;
        }
        *budget -= 1;

        // Split on the undecided transaction with the best individual feerate.
        let Some(split) = und.iter().reduce(|a, b| {
            if depgraph.feerate(b).feerate_gt(&depgraph.feerate(a)) {
                b
            } else {
                a
            }
        }) else {
            continue;
        };

        let exclude_und = und - depgraph.descendants(split);
        let add = (depgraph.ancestors(split) & todo) - inc;
        let include = inc | add;
        let include_fee = inc_fee + depgraph.feerate_of(add);
        let include_und = und - depgraph.ancestors(split);

        if include_fee.feerate_gt(&best.1) {
            best = (include, include_fee);
        }

        for (b_inc, b_fee, b_und) in [
            (inc, inc_fee, exclude_und),
            (include, include_fee, include_und),
        ] {
            if b_und.is_empty() {
                continue;
            }
            if potential(depgraph, b_inc, b_fee, b_und).feerate_gt(&best.1) {
                stack.push((b_inc, b_fee, b_und));
            }
        }
    }
    best
}

// ==============================================================================
// Linearization
// ==============================================================================

/// Compute a linearization of `depgraph`, starting from the cluster's
/// previous order `old` (which may be stale or empty).
pub fn linearize(
    depgraph: &DepGraph,
    old: &[DepGraphIndex],
    max_iterations: u64,
) -> Linearization {
    let mut budget = max_iterations;
    let mut todo = depgraph.positions();
    let mut candidate = Vec::with_capacity(todo.count());

    while !todo.is_empty() {
        let mut best = best_ancestor_candidate(depgraph, todo);
        if budget > 0 {
            best = search_candidate(depgraph, todo, best, &mut budget);
        }
        candidate.extend(emit_closed_set(depgraph, best.0));
        todo -= best.0;
    }

    let mut previous = old.to_vec();
    fix_linearization(depgraph, &mut previous);
    let mut order = merge_linearizations(depgraph, &candidate, &previous);
    post_linearize(depgraph, &mut order);

    Linearization {
        order,
        iterations: max_iterations - budget,
    }
}

/// Combine two linearizations of the same graph into one whose feerate
/// diagram is at least as good as either.
///
/// Each step takes the higher of the two best remaining prefixes (`lin1`
/// wins ties), then tries to improve it with the best prefix of the other
/// linearization restricted to that set.
pub fn merge_linearizations(
    depgraph: &DepGraph,
    lin1: &[DepGraphIndex],
    lin2: &[DepGraphIndex],
) -> Vec<DepGraphIndex> {
    let mut todo = depgraph.positions();
    let mut out = Vec::with_capacity(todo.count());

    while !todo.is_empty() {
        let (set1, fee1) = best_prefix(depgraph, lin1, todo);
        let (set2, fee2) = best_prefix(depgraph, lin2, todo);
        let (mut best_set, best_fee, other) = if set1.is_empty() || fee2.feerate_gt(&fee1) {
            (set2, fee2, lin1)
        } else {
            (set1, fee1, lin2)
        };
        if best_set.is_empty() {
            out.extend(todo.iter());
            break;
        }

        let (sub_set, sub_fee) = best_prefix(depgraph, other, best_set);
        if !sub_set.is_empty() && sub_fee.feerate_gt(&best_fee) {
            best_set = sub_set;
        }

        let mut emitted = TxSet::EMPTY;
        for &pos in lin1.iter().chain(lin2) {
            if best_set.contains(pos) && !emitted.contains(pos) {
                emitted.insert(pos);
                out.push(pos);
            }
        }
        todo -= best_set;
    }
    out
}

struct Group {
    txs: Vec<DepGraphIndex>,
    set: TxSet,
    deps: TxSet,
    feerate: FeePerWeight,
}

/// Improve `lin` in place so that all its chunks are connected.
///
/// Runs one pass back to front (fees negated, descendants as dependencies)
/// and one pass front to back. Each pass appends transactions as new
/// groups, then moves a new group up past every group with a lower
/// feerate. When the group it would pass is one it depends on, the two are
/// merged instead.
pub fn post_linearize(depgraph: &DepGraph, lin: &mut Vec<DepGraphIndex>) {
    for pass in 0..2 {
        let rev = pass == 0;
        let order: Vec<DepGraphIndex> = if rev {
            lin.iter().rev().copied().collect()
        } else {
            lin.clone()
        };

        let mut groups: Vec<Group> = Vec::with_capacity(order.len());
        for pos in order {
            let mut feerate = depgraph.feerate(pos);
            if rev {
                feerate.fee = -feerate.fee;
            }
            groups.push(Group {
                txs: vec![pos],
                set: TxSet::singleton(pos),
                deps: if rev {
                    depgraph.descendants(pos)
                } else {
                    depgraph.ancestors(pos)
                },
                feerate,
            });

            let mut cur = groups.len() - 1;
            while cur > 0 && groups[cur].feerate.feerate_gt(&groups[cur - 1].feerate) {
                if groups[cur].deps.overlaps(groups[cur - 1].set) {
                    let merged = groups.remove(cur);
                    let prev = &mut groups[cur - 1];
                    prev.txs.extend(merged.txs);
                    prev.set |= merged.set;
                    prev.deps |= merged.deps;
                    prev.feerate += merged.feerate;
                } else {
                    groups.swap(cur - 1, cur);
                }
                cur -= 1;
            }
        }

        let mut out: Vec<DepGraphIndex> = groups.into_iter().flat_map(|g| g.txs).collect();
        if rev {
            out.reverse();
        }
        *lin = out;
    }
}

// ==============================================================================
// Tests
// ==============================================================================
