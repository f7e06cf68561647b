//! Published market data: read-only book snapshots and ticker scalars.
//!
//! These are copies handed out by the book engine. Nothing here refers back
//! into live book state.

use serde::{Deserialize, Serialize};

use super::level::Level;
use super::pair::Pair;
use super::timestamp::Timestamp;

/// 24h ticker scalars for one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub low: f32,
    pub high: f32,
    pub last: f32,
    pub volume: f32,
    /// Exchange-reported best bid.
    pub bid: f32,
    /// Exchange-reported best ask.
    pub ask: f32,
}

/// Immutable copy of one instrument's book at a given sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Sequence id of the last applied snapshot or delta.
    pub id: i64,
    pub pair: Pair,
    /// Exactly N slots, best first. Empty slots hold the bid sentinel.
    pub bids: Vec<Level>,
    /// Exactly N slots, best first. Empty slots hold the ask sentinel.
    pub asks: Vec<Level>,
    pub ticker: Ticker,
    /// When the engine produced this copy.
    pub updated_at: Timestamp,
}

impl BookSnapshot {
    /// Configured depth N.
    pub fn depth(&self) -> usize {
        self.bids.len()
    }

    /// Best non-empty bid level.
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied().filter(|l| !l.is_empty())
    }

    /// Best non-empty ask level.
    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied().filter(|l| !l.is_empty())
    }

    /// `(best_bid + best_ask) / 2` when both sides are present.
    pub fn mid_price(&self) -> Option<f32> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / 2.0)
    }

    /// `best_ask - best_bid` when both sides are present.
    pub fn spread(&self) -> Option<f32> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::level::Side;

    fn snapshot(bids: Vec<Level>, asks: Vec<Level>) -> BookSnapshot {
        BookSnapshot {
            id: 1,
            pair: Pair::parse("BTC:USD").unwrap(),
            bids,
            asks,
            ticker: Ticker::default(),
            updated_at: Timestamp(0),
        }
    }

    #[test]
    fn test_mid_and_spread() {
        let s = snapshot(
            vec![Level::new(100.0, 1.0), Level::sentinel(Side::Bid)],
            vec![Level::new(102.0, 1.0), Level::sentinel(Side::Ask)],
        );
        assert_eq!(s.depth(), 2);
        assert_eq!(s.mid_price(), Some(101.0));
        assert_eq!(s.spread(), Some(2.0));
    }

    #[test]
    fn test_empty_side_has_no_best() {
        let s = snapshot(
            vec![Level::sentinel(Side::Bid)],
            vec![Level::new(102.0, 1.0)],
        );
        assert!(s.best_bid().is_none());
        assert!(s.mid_price().is_none());
        assert_eq!(s.best_ask(), Some(Level::new(102.0, 1.0)));
    }
}
