//! Handle registry: the entry arena and the caller-held `Ref`s aliasing it.
//!
//! Each live entry has exactly one `Ref`. The `Ref` and the registry share a
//! small slot holding the entry's current index; the registry only keeps a
//! weak link to it. That gives the two notifications handles need:
//!
//! - **Relocation**: when compaction moves an entry, the registry rewrites
//!   the index in the shared slot, so the caller's `Ref` follows the move.
//! - **Destruction**: dropping a `Ref` drops the slot, and the weak link in
//!   the registry stops resolving. The freed index can then never be taken
//!   as owned.
//!
//! Moving a `Ref` is an ordinary Rust move and needs no notification.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::feerate::FeePerWeight;
use crate::txset::DepGraphIndex;

/// Index of an entry in the registry's arena. Reused after removal.
pub type GraphIndex = u32;

/// Index of a cluster in the graph's cluster arena.
pub type ClusterIndex = u32;

const UNLINKED: GraphIndex = GraphIndex::MAX;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

// ==============================================================================
// RefId
// ==============================================================================

/// Identity of a `Ref`. Unique within its graph and never reused, unlike
/// the entry index behind it. Query results report transactions by `RefId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefId(pub u64);

impl std::fmt::Display for RefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ==============================================================================
// Ref
// ==============================================================================

#[derive(Debug)]
struct RefSlot {
    graph: u64,
    id: RefId,
    index: AtomicU32,
}

/// The caller's handle to a transaction in a graph.
///
/// Not `Clone`: a transaction has at most one `Ref`. A `Ref` is empty when
/// default-constructed or once its transaction has been removed. A `Ref`
/// must only be dropped after its transaction is removed; dropping it
/// earlier leaves the transaction in the graph without an owner.
#[derive(Default)]
pub struct Ref {
    slot: Option<Arc<RefSlot>>,
}

impl Ref {
    /// A `Ref` referencing nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True if this `Ref` does not reference a transaction.
    pub fn is_empty(&self) -> bool {
        self.slot
            .as_ref()
            .map_or(true, |slot| slot.index.load(Ordering::Relaxed) == UNLINKED)
    }

    /// The identity this `Ref` was created with, kept even after removal so
    /// earlier query results can still be matched against it.
    pub fn id(&self) -> Option<RefId> {
        self.slot.as_ref().map(|slot| slot.id)
    }

    fn link(&self) -> Option<(u64, GraphIndex, RefId)> {
        let slot = self.slot.as_ref()?;
        let index = slot.index.load(Ordering::Relaxed);
        (index != UNLINKED).then_some((slot.graph, index, slot.id))
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        if let Some((_, index, id)) = self.link() {
            tracing::warn!(
                ref_id = %id,
                index,
                "ref dropped while its transaction is still in the graph"
            );
        }
    }
}

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.link() {
            Some((graph, index, id)) => f
                .debug_struct("Ref")
                .field("graph", &graph)
                .field("index", &index)
                .field("id", &id)
                .finish(),
            None => f.write_str("Ref(empty)"),
        }
    }
}

// ==============================================================================
// Entries
// ==============================================================================

/// Where an entry lives inside the cluster tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Locator {
    pub cluster: ClusterIndex,
    pub pos: DepGraphIndex,
}

#[derive(Debug)]
pub(crate) struct Entry {
    owner: Weak<RefSlot>,
    pub ref_id: RefId,
    pub feerate: FeePerWeight,
    pub locator: Option<Locator>,
    /// Removed by the caller; structures are updated at the next checkpoint.
    pub removed: bool,
}

impl Entry {
    /// Whether a live `Ref` still points at `index`.
    fn owned_at(&self, index: GraphIndex) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|slot| slot.index.load(Ordering::Relaxed) == index)
    }
}

// ==============================================================================
// Registry
// ==============================================================================

pub(crate) struct Registry {
    graph: u64,
    next_ref_id: u64,
    entries: Vec<Option<Entry>>,
    free: BTreeSet<GraphIndex>,
    live: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            graph: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            next_ref_id: 0,
            entries: Vec::new(),
            free: BTreeSet::new(),
            live: 0,
        }
    }

    /// Allocate an entry (lowest free index first) and its paired `Ref`.
    pub fn insert(&mut self, feerate: FeePerWeight) -> (GraphIndex, Ref) {
        let index = match self.free.pop_first() {
            Some(index) => index,
            None => {
                self.entries.push(None);
                (self.entries.len() - 1) as GraphIndex
            }
        };
        let id = RefId(self.next_ref_id);
        self.next_ref_id += 1;

        let slot = Arc::new(RefSlot {
            graph: self.graph,
            id,
            index: AtomicU32::new(index),
        });
        self.entries[index as usize] = Some(Entry {
            owner: Arc::downgrade(&slot),
            ref_id: id,
            feerate,
            locator: None,
            removed: false,
        });
        self.live += 1;
        (index, Ref { slot: Some(slot) })
    }

    /// The entry index `arg` refers to, if it refers to a live entry of this
    /// registry.
    pub fn resolve(&self, arg: &Ref) -> Option<GraphIndex> {
        let (graph, index, id) = arg.link()?;
        if graph != self.graph {
            return None;
        }
        let entry = self.get(index)?;
        (!entry.removed && entry.ref_id == id).then_some(index)
    }

    pub fn get(&self, index: GraphIndex) -> Option<&Entry> {
        self.entries.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: GraphIndex) -> Option<&mut Entry> {
        self.entries.get_mut(index as usize)?.as_mut()
    }

    /// Mark an entry removed and empty its `Ref`. The index stays allocated
    /// until [`Registry::free`].
    pub fn unlink(&mut self, index: GraphIndex) {
        let Some(entry) = self.get_mut(index) else {
            return;
        };
        if entry.removed {
            return;
        }
        entry.removed = true;
        if let Some(slot) = entry.owner.upgrade() {
            slot.index.store(UNLINKED, Ordering::Relaxed);
        }
        self.live -= 1;
    }

    /// Release the index of an unlinked entry for reuse.
    pub fn free(&mut self, index: GraphIndex) {
        if let Some(slot) = self.entries.get_mut(index as usize) {
            if slot.take().is_some() {
                self.free.insert(index);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Length of the arena, holes included.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GraphIndex, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i as GraphIndex, e)))
    }

    pub fn is_free(&self, index: GraphIndex) -> bool {
        self.free.contains(&index)
    }

    /// Whether the entry at `index` still has a live `Ref` aliasing it.
    pub fn is_owned(&self, index: GraphIndex) -> bool {
        self.get(index).is_some_and(|e| e.owned_at(index))
    }

    /// Move entries from the end of the arena into holes until none remain.
    ///
    /// `relocate(from, to, entry)` runs for every move, after the entry's
    /// `Ref` already points at `to`. Must not run with unapplied removals.
    pub fn compact(&mut self, mut relocate: impl FnMut(GraphIndex, GraphIndex, &Entry)) -> usize {
        let mut moved = 0;
        loop {
            while matches!(self.entries.last(), Some(None)) {
                let last = (self.entries.len() - 1) as GraphIndex;
                self.entries.pop();
                self.free.remove(&last);
            }
            let Some(hole) = self.free.pop_first() else {
                break;
            };
            let Some(Some(entry)) = self.entries.pop() else {
                break;
            };
            let from = self.entries.len() as GraphIndex;
            if let Some(slot) = entry.owner.upgrade() {
                slot.index.store(hole, Ordering::Relaxed);
            }
            relocate(from, hole, &entry);
            self.entries[hole as usize] = Some(entry);
            moved += 1;
        }
        self.entries.shrink_to_fit();
        moved
    }
}

// ==============================================================================
// Tests
// ==============================================================================
