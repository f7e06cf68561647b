//! Fixed-depth L2 order book with sequence-continuity enforcement.
//!
//! Each side is an array of exactly `depth` slots kept in rank order: bids
//! descending, asks ascending. Unused slots hold the side's sentinel level
//! (price `∓MAX_PRICE`, qty 0), which always ranks behind every real price,
//! so the array never shrinks or grows.
//!
//! Deltas must carry the id immediately following the book's current id. A
//! rejected delta leaves the book untouched.

use cx_core::types::{BookSnapshot, Level, Pair, Side, Ticker, Timestamp};

/// Errors that can occur when applying a delta.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookError {
    /// No snapshot has been applied yet.
    #[error("book not initialized, a snapshot must precede deltas")]
    NotInitialized,
    /// The delta does not follow the last applied id.
    #[error("sequence gap: expected id {expected}, received {received}")]
    SequenceGap { expected: i64, received: i64 },
}

/// Bounded-depth order book for one instrument.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pair: Pair,
    /// Last applied snapshot or delta id.
    id: i64,
    /// `depth` slots, best (highest) first.
    bids: Vec<Level>,
    /// `depth` slots, best (lowest) first.
    asks: Vec<Level>,
    ticker: Ticker,
    initialized: bool,
}

impl OrderBook {
    /// Create an uninitialized book with every slot set to its sentinel.
    ///
    /// `depth` is clamped to at least one slot per side.
    pub fn new(pair: Pair, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            pair,
            id: 0,
            bids: vec![Level::sentinel(Side::Bid); depth],
            asks: vec![Level::sentinel(Side::Ask); depth],
            ticker: Ticker::default(),
            initialized: false,
        }
    }

    /// Replace all levels with a full snapshot and adopt its id.
    ///
    /// Zero-quantity levels are skipped, the rest are ranked best-first and
    /// only the best `depth` per side are kept. Ticker scalars survive.
    pub fn apply_snapshot(&mut self, id: i64, bids: &[(f32, f32)], asks: &[(f32, f32)]) {
        load_side(&mut self.bids, Side::Bid, bids);
        load_side(&mut self.asks, Side::Ask, asks);
        self.id = id;
        self.initialized = true;
    }

    /// Apply an incremental update carrying id `id`.
    ///
    /// Per level: quantity 0 removes a matching price, a matching price takes
    /// the new quantity, and a new price replaces the worst slot of its side
    /// when it ranks ahead of it. A new price ranking behind every slot of a
    /// full side is outside the tracked depth and ignored.
    pub fn apply_update(
        &mut self,
        id: i64,
        bids: &[(f32, f32)],
        asks: &[(f32, f32)],
    ) -> Result<(), BookError> {
        if !self.initialized {
            return Err(BookError::NotInitialized);
        }
        let expected = self.id + 1;
        if id != expected {
            return Err(BookError::SequenceGap {
                expected,
                received: id,
            });
        }

        for &(price, qty) in bids {
            apply_level(&mut self.bids, Side::Bid, price, qty);
        }
        for &(price, qty) in asks {
            apply_level(&mut self.asks, Side::Ask, price, qty);
        }
        sort_side(&mut self.bids, Side::Bid);
        sort_side(&mut self.asks, Side::Ask);

        self.id = id;
        Ok(())
    }

    /// Overwrite the ticker scalars. Levels and id are not touched.
    pub fn apply_ticker(&mut self, ticker: Ticker) {
        self.ticker = ticker;
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.bids.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn bids(&self) -> &[Level] {
        &self.bids
    }

    pub fn asks(&self) -> &[Level] {
        &self.asks
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    /// Best non-empty bid.
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied().filter(|l| !l.is_empty())
    }

    /// Best non-empty ask.
    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied().filter(|l| !l.is_empty())
    }

    /// Number of non-empty levels per side as `(bids, asks)`.
    pub fn level_count(&self) -> (usize, usize) {
        let count = |side: &[Level]| side.iter().filter(|l| !l.is_empty()).count();
        (count(&self.bids), count(&self.asks))
    }

    /// Copy of the current state for publishing.
    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            id: self.id,
            pair: self.pair.clone(),
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            ticker: self.ticker,
            updated_at: Timestamp::now(),
        }
    }
}

fn load_side(slots: &mut [Level], side: Side, levels: &[(f32, f32)]) {
    let mut ranked: Vec<Level> = levels
        .iter()
        .filter(|(_, qty)| *qty != 0.0)
        .map(|&(price, qty)| Level::new(price, qty))
        .collect();
    ranked.sort_by(|a, b| side.rank(a.price, b.price));
    ranked.dedup_by(|later, first| later.price == first.price);

    let sentinel = Level::sentinel(side);
    for (i, slot) in slots.iter_mut().enumerate() {
        *slot = ranked.get(i).copied().unwrap_or(sentinel);
    }
}

fn apply_level(slots: &mut [Level], side: Side, price: f32, qty: f32) {
    let found = slots.iter().position(|l| !l.is_empty() && l.price == price);

    if qty == 0.0 {
        if let Some(i) = found {
            slots[i] = Level::sentinel(side);
            sort_side(slots, side);
        }
        return;
    }

    if let Some(i) = found {
        slots[i].qty = qty;
        return;
    }

    // Slots are ranked, so the last one is the worst (a sentinel if any).
    let worst = slots.len() - 1;
    if slots[worst].is_empty() || side.ranks_better(price, slots[worst].price) {
        slots[worst] = Level::new(price, qty);
        sort_side(slots, side);
    } else {
        tracing::trace!(%side, price, "level outside tracked depth dropped");
    }
}

/// Stable sort, best first. Sentinels end up at the tail.
fn sort_side(slots: &mut [Level], side: Side) {
    slots.sort_by(|a, b| side.rank(a.price, b.price));
}

#[cfg(test)]
mod tests {
    use super::*;
    use cx_core::types::MAX_PRICE;

    fn btc_usd() -> Pair {
        Pair::parse("BTC:USD").unwrap()
    }

    fn bid_sentinel() -> Level {
        Level::new(-MAX_PRICE, 0.0)
    }

    fn ask_sentinel() -> Level {
        Level::new(MAX_PRICE, 0.0)
    }

    /// The reference book: id 1, two levels per side, depth 6.
    fn reference_book() -> OrderBook {
        let mut book = OrderBook::new(btc_usd(), 6);
        book.apply_snapshot(1, &[(100.0, 2.0), (99.0, 1.0)], &[(101.0, 1.0), (102.0, 3.0)]);
        book
    }

    fn full_book() -> OrderBook {
        let mut book = OrderBook::new(btc_usd(), 3);
        book.apply_snapshot(
            10,
            &[(100.0, 1.0), (99.0, 1.0), (98.0, 1.0)],
            &[(101.0, 1.0), (102.0, 1.0), (103.0, 1.0)],
        );
        book
    }

    fn prices(levels: &[Level]) -> Vec<f32> {
        levels.iter().map(|l| l.price).collect()
    }

    // -- 1. test_new_book_is_all_sentinels --
    #[test]
    fn test_new_book_is_all_sentinels() {
        let book = OrderBook::new(btc_usd(), 6);
        assert!(!book.is_initialized());
        assert_eq!(book.depth(), 6);
        assert!(book.bids().iter().all(|l| *l == bid_sentinel()));
        assert!(book.asks().iter().all(|l| *l == ask_sentinel()));
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.level_count(), (0, 0));
    }

    // -- 2. test_snapshot_fills_slots_and_pads_with_sentinels --
    #[test]
    fn test_snapshot_fills_slots_and_pads_with_sentinels() {
        let book = reference_book();
        assert!(book.is_initialized());
        assert_eq!(book.id(), 1);

        let mut expected_bids = vec![Level::new(100.0, 2.0), Level::new(99.0, 1.0)];
        expected_bids.extend(std::iter::repeat(bid_sentinel()).take(4));
        let mut expected_asks = vec![Level::new(101.0, 1.0), Level::new(102.0, 3.0)];
        expected_asks.extend(std::iter::repeat(ask_sentinel()).take(4));

        assert_eq!(book.bids(), expected_bids.as_slice());
        assert_eq!(book.asks(), expected_asks.as_slice());
    }

    // -- 3. test_snapshot_sorts_unordered_levels --
    #[test]
    fn test_snapshot_sorts_unordered_levels() {
        let mut ordered = OrderBook::new(btc_usd(), 6);
        ordered.apply_snapshot(1, &[(100.0, 2.0), (99.0, 1.0)], &[(101.0, 1.0), (102.0, 3.0)]);
        let mut reversed = OrderBook::new(btc_usd(), 6);
        reversed.apply_snapshot(1, &[(99.0, 1.0), (100.0, 2.0)], &[(102.0, 3.0), (101.0, 1.0)]);

        assert_eq!(ordered.bids(), reversed.bids());
        assert_eq!(ordered.asks(), reversed.asks());
        assert_eq!(reversed.best_bid(), Some(Level::new(100.0, 2.0)));
        assert_eq!(reversed.best_ask(), Some(Level::new(101.0, 1.0)));
    }

    // -- 4. test_snapshot_keeps_best_n --
    #[test]
    fn test_snapshot_keeps_best_n() {
        let mut book = OrderBook::new(btc_usd(), 2);
        book.apply_snapshot(5, &[(97.0, 1.0), (99.0, 1.0), (98.0, 1.0)], &[(103.0, 1.0), (101.0, 1.0), (102.0, 1.0)]);
        assert_eq!(prices(book.bids()), vec![99.0, 98.0]);
        assert_eq!(prices(book.asks()), vec![101.0, 102.0]);
    }

    // -- 5. test_snapshot_skips_zero_quantity --
    #[test]
    fn test_snapshot_skips_zero_quantity() {
        let mut book = OrderBook::new(btc_usd(), 3);
        book.apply_snapshot(1, &[(100.0, 0.0), (99.0, 1.0)], &[]);
        assert_eq!(book.bids()[0], Level::new(99.0, 1.0));
        assert_eq!(book.level_count(), (1, 0));
    }

    // -- 6. test_snapshot_resets_previous_levels --
    #[test]
    fn test_snapshot_resets_previous_levels() {
        let mut book = reference_book();
        book.apply_snapshot(40, &[(50.0, 1.0)], &[]);
        assert_eq!(book.id(), 40);
        assert_eq!(book.level_count(), (1, 0));
        assert_eq!(book.asks()[0], ask_sentinel());
    }

    // -- 7. test_delta_removes_level --
    #[test]
    fn test_delta_removes_level() {
        let mut book = reference_book();
        book.apply_update(2, &[(100.0, 0.0)], &[]).unwrap();

        let mut expected = vec![Level::new(99.0, 1.0)];
        expected.extend(std::iter::repeat(bid_sentinel()).take(5));
        assert_eq!(book.bids(), expected.as_slice());
        assert_eq!(book.id(), 2);
    }

    // -- 8. test_removing_absent_price_is_noop --
    #[test]
    fn test_removing_absent_price_is_noop() {
        let mut book = reference_book();
        let before = book.bids().to_vec();
        book.apply_update(2, &[(55.5, 0.0)], &[(55.5, 0.0)]).unwrap();
        assert_eq!(book.bids(), before.as_slice());
        assert_eq!(book.id(), 2);
    }

    // -- 9. test_delta_updates_quantity --
    #[test]
    fn test_delta_updates_quantity() {
        let mut book = reference_book();
        book.apply_update(2, &[(99.0, 7.5)], &[(102.0, 0.5)]).unwrap();
        assert_eq!(book.bids()[1], Level::new(99.0, 7.5));
        assert_eq!(book.asks()[1], Level::new(102.0, 0.5));
        assert_eq!(book.level_count(), (2, 2));
    }

    // -- 10. test_delta_inserts_into_free_slot --
    #[test]
    fn test_delta_inserts_into_free_slot() {
        let mut book = reference_book();
        book.apply_update(2, &[(100.5, 1.0), (98.0, 4.0)], &[(101.5, 2.0)]).unwrap();
        assert_eq!(prices(&book.bids()[..4]), vec![100.5, 100.0, 99.0, 98.0]);
        assert_eq!(prices(&book.asks()[..3]), vec![101.0, 101.5, 102.0]);
        assert_eq!(book.level_count(), (4, 3));
    }

    // -- 11. test_insert_into_full_side_evicts_last_slot --
    #[test]
    fn test_insert_into_full_side_evicts_last_slot() {
        let mut book = full_book();
        book.apply_update(11, &[(99.5, 2.0)], &[(100.5, 2.0)]).unwrap();
        // 98 and 103 held index N-1 and are gone.
        assert_eq!(prices(book.bids()), vec![100.0, 99.5, 99.0]);
        assert_eq!(prices(book.asks()), vec![100.5, 101.0, 102.0]);
    }

    // -- 12. test_insert_worse_than_full_side_is_ignored --
    #[test]
    fn test_insert_worse_than_full_side_is_ignored() {
        let mut book = full_book();
        book.apply_update(11, &[(90.0, 5.0)], &[(110.0, 5.0)]).unwrap();
        assert_eq!(prices(book.bids()), vec![100.0, 99.0, 98.0]);
        assert_eq!(prices(book.asks()), vec![101.0, 102.0, 103.0]);
        assert_eq!(book.id(), 11);
    }

    // -- 13. test_multiple_inserts_in_one_batch_do_not_overwrite --
    #[test]
    fn test_multiple_inserts_in_one_batch_do_not_overwrite() {
        let mut book = full_book();
        book.apply_update(11, &[(100.5, 1.0), (100.25, 1.0)], &[]).unwrap();
        assert_eq!(prices(book.bids()), vec![100.5, 100.25, 100.0]);
    }

    // -- 14. test_remove_then_insert_in_one_batch --
    #[test]
    fn test_remove_then_insert_in_one_batch() {
        let mut book = full_book();
        book.apply_update(11, &[(100.0, 0.0), (97.0, 3.0)], &[]).unwrap();
        assert_eq!(prices(book.bids()), vec![99.0, 98.0, 97.0]);
    }

    // -- 15. test_sequence_gap_rejected_without_mutation --
    #[test]
    fn test_sequence_gap_rejected_without_mutation() {
        let mut book = reference_book();
        let before = (book.bids().to_vec(), book.asks().to_vec());

        let err = book.apply_update(3, &[(100.0, 0.0)], &[]).unwrap_err();
        assert_eq!(
            err,
            BookError::SequenceGap {
                expected: 2,
                received: 3
            }
        );
        assert_eq!((book.bids().to_vec(), book.asks().to_vec()), before);
        assert_eq!(book.id(), 1);

        // Replayed id is a gap too.
        assert!(book.apply_update(1, &[], &[]).is_err());
    }

    // -- 16. test_update_before_snapshot_fails --
    #[test]
    fn test_update_before_snapshot_fails() {
        let mut book = OrderBook::new(btc_usd(), 6);
        assert_eq!(
            book.apply_update(1, &[(1.0, 1.0)], &[]),
            Err(BookError::NotInitialized)
        );
        assert_eq!(book.level_count(), (0, 0));
    }

    // -- 17. test_ticker_does_not_touch_levels --
    #[test]
    fn test_ticker_does_not_touch_levels() {
        let mut book = reference_book();
        let before = (book.bids().to_vec(), book.asks().to_vec(), book.id());
        let ticker = Ticker {
            low: 90.0,
            high: 110.0,
            last: 100.5,
            volume: 12.0,
            bid: 100.0,
            ask: 101.0,
        };
        book.apply_ticker(ticker);
        assert_eq!(*book.ticker(), ticker);
        assert_eq!((book.bids().to_vec(), book.asks().to_vec(), book.id()), before);
    }

    // -- 18. test_snapshot_copy --
    #[test]
    fn test_snapshot_copy() {
        let mut book = reference_book();
        let snap = book.snapshot();
        book.apply_update(2, &[(100.0, 0.0)], &[]).unwrap();

        assert_eq!(snap.id, 1);
        assert_eq!(snap.pair, btc_usd());
        assert_eq!(snap.bids[0], Level::new(100.0, 2.0));
        assert_eq!(snap.depth(), 6);
    }

    // -- 19. test_zero_depth_clamped --
    #[test]
    fn test_zero_depth_clamped() {
        let mut book = OrderBook::new(btc_usd(), 0);
        book.apply_snapshot(1, &[(1.0, 1.0), (2.0, 1.0)], &[]);
        assert_eq!(book.bids(), &[Level::new(2.0, 1.0)]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    const DEPTH: usize = 6;

    /// Prices on a 0.25 grid so equal draws collide and exercise updates.
    fn arb_price() -> impl Strategy<Value = f32> {
        (400u32..440u32).prop_map(|t| t as f32 * 0.25)
    }

    fn arb_qty() -> impl Strategy<Value = f32> {
        prop_oneof![Just(0.0f32), (1u32..1000u32).prop_map(|q| q as f32 / 100.0)]
    }

    fn arb_levels(max: usize) -> impl Strategy<Value = Vec<(f32, f32)>> {
        proptest::collection::vec((arb_price(), arb_qty()), 0..max)
    }

    fn book_from(bids: &[(f32, f32)], asks: &[(f32, f32)]) -> OrderBook {
        let mut book = OrderBook::new(Pair::parse("BTC:USD").unwrap(), DEPTH);
        book.apply_snapshot(1, bids, asks);
        book
    }

    fn is_ranked(levels: &[Level], side: Side) -> bool {
        levels
            .windows(2)
            .all(|w| !side.ranks_better(w[1].price, w[0].price))
    }

    // Strategy 1: every sequence of deltas keeps both sides ranked and sized
    proptest! {
        #[test]
        fn deltas_keep_sides_ranked(
            snap_bids in arb_levels(10),
            snap_asks in arb_levels(10),
            deltas in proptest::collection::vec((arb_levels(8), arb_levels(8)), 1..20),
        ) {
            let mut book = book_from(&snap_bids, &snap_asks);
            for (i, (bids, asks)) in deltas.iter().enumerate() {
                book.apply_update(2 + i as i64, bids, asks).unwrap();
                prop_assert!(is_ranked(book.bids(), Side::Bid));
                prop_assert!(is_ranked(book.asks(), Side::Ask));
                prop_assert_eq!(book.bids().len(), DEPTH);
                prop_assert_eq!(book.asks().len(), DEPTH);
            }
            prop_assert_eq!(book.id(), 1 + deltas.len() as i64);
        }
    }

    // Strategy 2: a delta with the wrong id never mutates the book
    proptest! {
        #[test]
        fn gap_never_mutates(
            snap_bids in arb_levels(10),
            bids in arb_levels(8),
            asks in arb_levels(8),
            id in prop_oneof![-5i64..=1i64, 3i64..100i64],
        ) {
            let mut book = book_from(&snap_bids, &[]);
            let before = (book.bids().to_vec(), book.asks().to_vec(), book.id());
            prop_assert!(book.apply_update(id, &bids, &asks).is_err());
            prop_assert_eq!((book.bids().to_vec(), book.asks().to_vec(), book.id()), before);
        }
    }

    // Strategy 3: removal of a present price leaves it absent
    proptest! {
        #[test]
        fn zero_quantity_removes_present_price(snap_bids in arb_levels(10)) {
            let book0 = book_from(&snap_bids, &[]);
            if let Some(best) = book0.best_bid() {
                let mut book = book0.clone();
                book.apply_update(2, &[(best.price, 0.0)], &[]).unwrap();
                prop_assert!(book.bids().iter().all(|l| l.is_empty() || l.price != best.price));
                let (before, _) = book0.level_count();
                let (after, _) = book.level_count();
                prop_assert_eq!(after + 1, before);
            }
        }
    }

    // Strategy 4: the kept snapshot levels are the best ones delivered
    proptest! {
        #[test]
        fn snapshot_keeps_best_levels(snap_bids in arb_levels(20)) {
            let book = book_from(&snap_bids, &[]);
            let best_delivered = snap_bids
                .iter()
                .filter(|(_, q)| *q != 0.0)
                .map(|(p, _)| *p)
                .fold(None, |acc: Option<f32>, p| Some(acc.map_or(p, |a| a.max(p))));
            prop_assert_eq!(book.best_bid().map(|l| l.price), best_delivered);
        }
    }
}
