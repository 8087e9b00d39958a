//! Shared test helpers for `txgraph-core` unit tests.

use crate::feerate::FeePerWeight;
use crate::graph::TxGraph;
use crate::registry::{Ref, RefId};

/// Shorthand for a fee/size pair.
pub fn fee(fee: i64, size: i32) -> FeePerWeight {
    FeePerWeight::new(fee, size)
}

/// The `RefId`s of `refs`, in the given order.
pub fn ids(refs: &[&Ref]) -> Vec<RefId> {
    refs.iter()
        .map(|r| r.id().expect("ref was created by a graph"))
        .collect()
}

/// Remove every transaction so the refs can be dropped quietly.
pub fn remove_all<G: TxGraph + ?Sized>(graph: &mut G, refs: impl IntoIterator<Item = Ref>) {
    for r in refs {
        graph.remove_transaction(&r);
    }
}
