//! Fee and size pairs used as exact feerates.
//!
//! A `FeePerWeight` is kept as a fraction rather than a float so that every
//! comparison the linearizer and chunker make is exact and reproducible.

use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use bitcoin::{Amount, SignedAmount, Weight};
use serde::{Deserialize, Serialize};

use crate::txset::TX_SET_CAPACITY;

/// Largest size a single transaction may carry. A full cluster of such
/// transactions still sums within `i32`.
pub const MAX_ENTRY_SIZE: i32 = i32::MAX / TX_SET_CAPACITY as i32;

/// Largest absolute fee a single transaction may carry, bounded the same way
/// as [`MAX_ENTRY_SIZE`].
pub const MAX_ENTRY_FEE: i64 = i64::MAX / TX_SET_CAPACITY as i64;

// ==============================================================================
// FeePerWeight
// ==============================================================================

/// A fee together with the size (weight) it pays for.
///
/// Aggregates of several transactions are formed by summing both fields, so
/// the feerate of a set is `sum(fee) / sum(size)`. The empty value (`0 / 0`)
/// is what queries about unknown transactions return.
///
/// `PartialEq` compares the raw pair; use [`FeePerWeight::cmp_feerate`] to
/// compare rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeePerWeight {
    pub fee: i64,
    pub size: i32,
}

impl FeePerWeight {
    pub const EMPTY: FeePerWeight = FeePerWeight { fee: 0, size: 0 };

    pub const fn new(fee: i64, size: i32) -> Self {
        Self { fee, size }
    }

    /// Build a feerate from the fee and weight reported by transaction
    /// validation. The result is [`normalized`](FeePerWeight::normalized).
    pub fn from_amount_weight(fee: Amount, weight: Weight) -> Self {
        Self {
            fee: i64::try_from(fee.to_sat()).unwrap_or(i64::MAX),
            size: clamp_weight(weight),
        }
        .normalized()
    }

    /// Like [`FeePerWeight::from_amount_weight`] but for a (possibly
    /// negative) modified fee.
    pub fn from_signed_amount_weight(fee: SignedAmount, weight: Weight) -> Self {
        Self {
            fee: fee.to_sat(),
            size: clamp_weight(weight),
        }
        .normalized()
    }

    /// Clamp into the range a cluster entry may hold: size in
    /// `1..=MAX_ENTRY_SIZE` and fee within `±MAX_ENTRY_FEE`.
    pub fn normalized(self) -> Self {
        Self {
            fee: clamp_fee(self.fee),
            size: self.size.clamp(1, MAX_ENTRY_SIZE),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Compare feerates only: `a.fee / a.size` against `b.fee / b.size`,
    /// evaluated as `a.fee * b.size` against `b.fee * a.size`.
    pub fn cmp_feerate(&self, other: &Self) -> Ordering {
        let lhs = i128::from(self.fee) * i128::from(other.size);
        let rhs = i128::from(other.fee) * i128::from(self.size);
        lhs.cmp(&rhs)
    }

    /// Strictly higher feerate than `other`.
    pub fn feerate_gt(&self, other: &Self) -> bool {
        self.cmp_feerate(other) == Ordering::Greater
    }

    /// Total order used for tie-breaking candidates: higher feerate first,
    /// and on equal feerate the smaller size is preferred.
    pub fn cmp_preference(&self, other: &Self) -> Ordering {
        match self.cmp_feerate(other) {
            Ordering::Equal => other.size.cmp(&self.size),
            ord => ord,
        }
    }

}

pub(crate) fn clamp_fee(fee: i64) -> i64 {
    fee.clamp(-MAX_ENTRY_FEE, MAX_ENTRY_FEE)
}

fn clamp_weight(weight: Weight) -> i32 {
    i32::try_from(weight.to_wu()).unwrap_or(i32::MAX)
}

impl Add for FeePerWeight {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            fee: self.fee.saturating_add(rhs.fee),
            size: self.size.saturating_add(rhs.size),
        }
    }
}

impl AddAssign for FeePerWeight {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for FeePerWeight {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            fee: self.fee.saturating_sub(rhs.fee),
            size: self.size.saturating_sub(rhs.size),
        }
    }
}

impl SubAssign for FeePerWeight {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for FeePerWeight {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::EMPTY, |acc, f| acc + f)
    }
}

impl std::fmt::Display for FeePerWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.fee, self.size)
    }
}

// ==============================================================================
// Tests
// ==============================================================================
