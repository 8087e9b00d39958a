//! Chunker: partitions a linearization into highest-feerate prefixes.
//!
//! Each chunk is the prefix of the not-yet-chunked suffix with the highest
//! aggregate feerate. A longer prefix only wins on a strictly higher
//! feerate, so equal-feerate ties resolve to the shortest prefix.

use crate::depgraph::DepGraph;
use crate::feerate::FeePerWeight;
use crate::txset::{DepGraphIndex, TxSet};

/// A contiguous run `start..end` of a linearization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
    pub set: TxSet,
    pub feerate: FeePerWeight,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Highest-feerate prefix of `lin` restricted to the positions in `within`.
/// Returns the prefix set and its feerate; both are empty when nothing in
/// `lin` is in `within`.
pub fn best_prefix(
    depgraph: &DepGraph,
    lin: &[DepGraphIndex],
    within: TxSet,
) -> (TxSet, FeePerWeight) {
    let mut best = (TxSet::EMPTY, FeePerWeight::EMPTY);
    let mut acc_set = TxSet::EMPTY;
    let mut acc_fee = FeePerWeight::EMPTY;
    for &pos in lin.iter().filter(|&&pos| within.contains(pos)) {
        acc_set.insert(pos);
        acc_fee += depgraph.feerate(pos);
        if best.0.is_empty() || acc_fee.feerate_gt(&best.1) {
            best = (acc_set, acc_fee);
        }
    }
    best
}

/// Split `lin` into chunks. The chunks cover `lin` exactly, in order.
pub fn chunk_linearization(depgraph: &DepGraph, lin: &[DepGraphIndex]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < lin.len() {
        let mut best_end = start + 1;
        let mut best_fee = depgraph.feerate(lin[start]);
        let mut best_set = TxSet::singleton(lin[start]);
        let mut acc_fee = best_fee;
        let mut acc_set = best_set;
        for (offset, &pos) in lin[start + 1..].iter().enumerate() {
            acc_fee += depgraph.feerate(pos);
            acc_set.insert(pos);
            if acc_fee.feerate_gt(&best_fee) {
                best_end = start + offset + 2;
                best_fee = acc_fee;
                best_set = acc_set;
            }
        }
        chunks.push(Chunk {
            start,
            end: best_end,
            set: best_set,
            feerate: best_fee,
        });
        start = best_end;
    }
    chunks
}
