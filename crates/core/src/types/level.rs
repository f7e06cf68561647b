//! Price levels, book sides and the empty-slot sentinels.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Price carried by empty slots. Bids use `-MAX_PRICE`, asks `+MAX_PRICE`,
/// so an empty slot always ranks behind every real level.
pub const MAX_PRICE: f32 = 9_999_999.999_9;

/// Book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Buy side, best = highest price.
    Bid,
    /// Sell side, best = lowest price.
    Ask,
}

impl Side {
    /// Sentinel price for this side.
    #[inline]
    pub fn sentinel_price(self) -> f32 {
        match self {
            Side::Bid => -MAX_PRICE,
            Side::Ask => MAX_PRICE,
        }
    }

    /// Ranking order: `Less` means `a` is better than `b` on this side.
    #[inline]
    pub fn rank(self, a: f32, b: f32) -> Ordering {
        match self {
            Side::Bid => b.total_cmp(&a),
            Side::Ask => a.total_cmp(&b),
        }
    }

    /// `true` if price `a` strictly outranks price `b`.
    #[inline]
    pub fn ranks_better(self, a: f32, b: f32) -> bool {
        self.rank(a, b) == Ordering::Less
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

/// One (price, quantity) slot. Quantity 0 marks an absent level.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Level {
    pub price: f32,
    pub qty: f32,
}

impl Level {
    #[inline]
    pub const fn new(price: f32, qty: f32) -> Self {
        Self { price, qty }
    }

    /// Empty slot for `side`.
    #[inline]
    pub fn sentinel(side: Side) -> Self {
        Self {
            price: side.sentinel_price(),
            qty: 0.0,
        }
    }

    /// `true` for a slot that holds no real level.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.qty == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_rank_last() {
        assert!(Side::Bid.ranks_better(0.01, Side::Bid.sentinel_price()));
        assert!(Side::Ask.ranks_better(1_000_000.0, Side::Ask.sentinel_price()));
    }

    #[test]
    fn test_rank_direction() {
        assert!(Side::Bid.ranks_better(101.0, 100.0));
        assert!(!Side::Bid.ranks_better(100.0, 101.0));
        assert!(Side::Ask.ranks_better(100.0, 101.0));
        assert!(!Side::Ask.ranks_better(100.0, 100.0));
    }

    #[test]
    fn test_sentinel_is_empty() {
        assert!(Level::sentinel(Side::Bid).is_empty());
        assert_eq!(Level::sentinel(Side::Ask).price, MAX_PRICE);
        assert!(!Level::new(1.0, 0.5).is_empty());
    }
}
