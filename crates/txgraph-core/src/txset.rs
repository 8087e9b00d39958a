//! `TxSet`: a set of in-cluster positions packed into one machine word.

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub, SubAssign};

/// Position of a transaction inside its cluster's dependency store.
pub type DepGraphIndex = usize;

/// Number of positions a `TxSet` can hold. This is also the hard upper bound
/// on the cluster size.
pub const TX_SET_CAPACITY: usize = 64;

/// A set of cluster positions in `0..64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxSet(u64);

impl TxSet {
    pub const EMPTY: TxSet = TxSet(0);

    pub const fn singleton(pos: DepGraphIndex) -> Self {
        Self(1u64 << pos)
    }

    /// The set `{0, 1, .., n-1}`.
    pub const fn fill(n: usize) -> Self {
        if n >= TX_SET_CAPACITY {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    pub fn contains(&self, pos: DepGraphIndex) -> bool {
        pos < TX_SET_CAPACITY && (self.0 >> pos) & 1 == 1
    }

    pub fn insert(&mut self, pos: DepGraphIndex) {
        self.0 |= 1u64 << pos;
    }

    pub fn remove(&mut self, pos: DepGraphIndex) {
        self.0 &= !(1u64 << pos);
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest position in the set.
    pub fn first(&self) -> Option<DepGraphIndex> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn overlaps(&self, other: TxSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_subset_of(&self, other: TxSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate positions in increasing order.
    pub fn iter(&self) -> TxSetIter {
        TxSetIter(self.0)
    }
}

pub struct TxSetIter(u64);

impl Iterator for TxSetIter {
    type Item = DepGraphIndex;

    fn next(&mut self) -> Option<DepGraphIndex> {
        if self.0 == 0 {
            return None;
        }
        let pos = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(pos)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl IntoIterator for TxSet {
    type Item = DepGraphIndex;
    type IntoIter = TxSetIter;
    fn into_iter(self) -> TxSetIter {
        self.iter()
    }
}

impl FromIterator<DepGraphIndex> for TxSet {
    fn from_iter<I: IntoIterator<Item = DepGraphIndex>>(iter: I) -> Self {
        let mut set = TxSet::EMPTY;
        for pos in iter {
            set.insert(pos);
        }
        set
    }
}

impl BitOr for TxSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TxSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TxSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for TxSet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Sub for TxSet {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for TxSet {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl Not for TxSet {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}
