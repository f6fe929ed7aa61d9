// =============================================================================
// Order Book Engine — sequence-validated delta application per symbol
// =============================================================================
//
// Each book adopts the first delta it sees as its baseline, so operation
// never depends on a REST snapshot being available. After the baseline,
// every delta must start exactly at last_update_id + 1; any mismatch resets
// the book to uninitialized and the next delta re-baselines.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::PriceLevel;

/// An incremental depth delta decoded from the exchange stream.
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub symbol: String,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    /// Exchange event time in milliseconds.
    pub timestamp_ms: i64,
}

/// Result of applying one delta to a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Book was uninitialized; the delta became the new baseline.
    Baseline,
    /// Delta was contiguous and applied.
    Applied,
    /// Sequence mismatch: delta dropped, book reset to uninitialized.
    GapDetected,
}

/// Consistent copy-out of one book, safe to hand to any consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update_id: u64,
    /// Microseconds since the UNIX epoch of the last applied update.
    pub timestamp_us: i64,
}

/// Per-symbol book: bids descending, asks ascending, both keyed by exact
/// decimal price.
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    initialized: bool,
    updated_at_us: i64,
    sequence_errors: u64,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            initialized: false,
            updated_at_us: 0,
            sequence_errors: 0,
        }
    }

    /// Apply one delta following the sequencing contract.
    pub fn apply(&mut self, update: &DepthUpdate) -> ApplyOutcome {
        if !self.initialized {
            // First accepted delta becomes the baseline state.
            self.bids.clear();
            self.asks.clear();
            self.apply_levels(update);
            self.last_update_id = update.last_update_id;
            self.initialized = true;
            self.updated_at_us = Utc::now().timestamp_micros();
            info!(
                symbol = %self.symbol,
                last_update_id = self.last_update_id,
                "order book baselined"
            );
            return ApplyOutcome::Baseline;
        }

        if update.first_update_id != self.last_update_id + 1 {
            self.sequence_errors += 1;
            self.initialized = false;
            warn!(
                symbol = %self.symbol,
                expected = self.last_update_id + 1,
                received = update.first_update_id,
                sequence_errors = self.sequence_errors,
                "sequence gap — book reset, next delta re-baselines"
            );
            return ApplyOutcome::GapDetected;
        }

        self.apply_levels(update);
        self.last_update_id = update.last_update_id;
        self.updated_at_us = Utc::now().timestamp_micros();

        if self.is_crossed() {
            warn!(
                symbol = %self.symbol,
                best_bid = ?self.best_bid().map(|l| l.price),
                best_ask = ?self.best_ask().map(|l| l.price),
                "book is crossed — quotes unavailable until it clears"
            );
        }

        ApplyOutcome::Applied
    }

    fn apply_levels(&mut self, update: &DepthUpdate) {
        for &(price, qty) in &update.bids {
            if qty.is_zero() {
                self.bids.remove(&price);
            } else {
                self.bids.insert(price, qty);
            }
        }
        for &(price, qty) in &update.asks {
            if qty.is_zero() {
                self.asks.remove(&price);
            } else {
                self.asks.insert(price, qty);
            }
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(&price, &quantity)| PriceLevel { price, quantity })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(&price, &quantity)| PriceLevel { price, quantity })
    }

    /// `best_bid >= best_ask`. Crossed books are logged, not auto-repaired.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Mid price, or `None` when either side is empty or the book is
    /// crossed (quote unavailable).
    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        if bid >= ask {
            debug!(symbol = %self.symbol, %bid, %ask, "crossed book — mid clamped to unavailable");
            return None;
        }
        Some((bid + ask) / Decimal::TWO)
    }

    /// Top `depth` levels of each side: bids descending, asks ascending.
    pub fn top_levels(&self, depth: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(&price, &quantity)| PriceLevel { price, quantity })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(&price, &quantity)| PriceLevel { price, quantity })
            .collect();
        (bids, asks)
    }

    /// Copy out a consistent snapshot of the top `depth` levels.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let (bids, asks) = self.top_levels(depth);
        BookSnapshot {
            symbol: self.symbol.clone(),
            bids,
            asks,
            last_update_id: self.last_update_id,
            timestamp_us: self.updated_at_us,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn sequence_errors(&self) -> u64 {
        self.sequence_errors
    }

    /// Force the book back to uninitialized (connection loss). Levels are
    /// retained for display but the next delta re-baselines over them.
    pub fn invalidate(&mut self) {
        self.initialized = false;
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every subscribed book. One writer task applies deltas; readers get
/// value snapshots and never alias writer-owned memory.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBook>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Create an empty book for `symbol`. Idempotent.
    pub fn subscribe(&self, symbol: &str) {
        let mut books = self.books.write();
        books
            .entry(symbol.to_string())
            .or_insert_with(|| OrderBook::new(symbol));
    }

    /// Drop the book for `symbol` entirely.
    pub fn unsubscribe(&self, symbol: &str) {
        self.books.write().remove(symbol);
    }

    /// Apply a delta to the owning book. Unknown symbols are ignored.
    pub fn apply(&self, update: &DepthUpdate) -> Option<ApplyOutcome> {
        let mut books = self.books.write();
        books.get_mut(&update.symbol).map(|book| book.apply(update))
    }

    pub fn snapshot(&self, symbol: &str, depth: usize) -> Option<BookSnapshot> {
        let books = self.books.read();
        books
            .get(symbol)
            .filter(|b| b.is_initialized())
            .map(|b| b.snapshot(depth))
    }

    pub fn mid_price(&self, symbol: &str) -> Option<Decimal> {
        self.books.read().get(symbol).and_then(|b| b.mid_price())
    }

    /// Invalidate every book after a connection loss; each becomes
    /// uninitialized until its next delta arrives.
    pub fn invalidate_all(&self) {
        let mut books = self.books.write();
        for book in books.values_mut() {
            book.invalidate();
        }
        info!(count = books.len(), "all order books invalidated");
    }

    pub fn sequence_errors(&self, symbol: &str) -> u64 {
        self.books
            .read()
            .get(symbol)
            .map(|b| b.sequence_errors())
            .unwrap_or(0)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn update(
        first: u64,
        last: u64,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    ) -> DepthUpdate {
        DepthUpdate {
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            last_update_id: last,
            bids,
            asks,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn first_delta_becomes_baseline() {
        let mut book = OrderBook::new("BTCUSDT");
        assert!(!book.is_initialized());

        let outcome = book.apply(&update(
            10,
            12,
            vec![(dec!(50000), dec!(1.5)), (dec!(49990), dec!(2.0))],
            vec![(dec!(50010), dec!(1.0))],
        ));

        assert_eq!(outcome, ApplyOutcome::Baseline);
        assert!(book.is_initialized());
        assert_eq!(book.last_update_id(), 12);
        assert_eq!(book.best_bid().unwrap().price, dec!(50000));
        assert_eq!(book.best_ask().unwrap().price, dec!(50010));
    }

    #[test]
    fn contiguous_delta_applies_and_zero_qty_removes() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(&update(
            1,
            1,
            vec![(dec!(50000), dec!(1.0)), (dec!(49990), dec!(2.0))],
            vec![(dec!(50010), dec!(1.0))],
        ));

        let outcome = book.apply(&update(
            2,
            3,
            vec![(dec!(50000), dec!(0)), (dec!(49995), dec!(0.5))],
            vec![(dec!(50010), dec!(3.0))],
        ));

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.best_bid().unwrap().price, dec!(49995));
        assert_eq!(book.best_ask().unwrap().quantity, dec!(3.0));
        assert_eq!(book.last_update_id(), 3);
    }

    #[test]
    fn gap_resets_and_next_delta_rebaselines() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(&update(1, 100, vec![(dec!(50000), dec!(1.0))], vec![]));
        assert_eq!(book.last_update_id(), 100);

        // first_id 102 != 101: gap.
        let outcome = book.apply(&update(102, 103, vec![(dec!(50001), dec!(1.0))], vec![]));
        assert_eq!(outcome, ApplyOutcome::GapDetected);
        assert!(!book.is_initialized());
        assert_eq!(book.sequence_errors(), 1);
        // Dropped delta left the ladder untouched.
        assert_eq!(book.best_bid().unwrap().price, dec!(50000));

        // Next delta is adopted as the new baseline and replaces the book.
        let outcome = book.apply(&update(
            150,
            151,
            vec![(dec!(50100), dec!(2.0))],
            vec![(dec!(50110), dec!(1.0))],
        ));
        assert_eq!(outcome, ApplyOutcome::Baseline);
        assert!(book.is_initialized());
        assert_eq!(book.last_update_id(), 151);
        assert_eq!(book.sequence_errors(), 1);
        // Book reflects only the baseline delta's levels.
        let (bids, asks) = book.top_levels(10);
        assert_eq!(bids.len(), 1);
        assert_eq!(asks.len(), 1);
        assert_eq!(bids[0].price, dec!(50100));
    }

    #[test]
    fn bids_descend_and_asks_ascend() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(&update(
            1,
            1,
            vec![
                (dec!(49990), dec!(1.0)),
                (dec!(50000), dec!(1.0)),
                (dec!(49995), dec!(1.0)),
            ],
            vec![
                (dec!(50020), dec!(1.0)),
                (dec!(50010), dec!(1.0)),
                (dec!(50015), dec!(1.0)),
            ],
        ));

        let (bids, asks) = book.top_levels(3);
        let bid_prices: Vec<Decimal> = bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<Decimal> = asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(50000), dec!(49995), dec!(49990)]);
        assert_eq!(ask_prices, vec![dec!(50010), dec!(50015), dec!(50020)]);
    }

    #[test]
    fn crossed_book_has_no_mid() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(&update(
            1,
            1,
            vec![(dec!(50020), dec!(1.0))],
            vec![(dec!(50010), dec!(1.0))],
        ));

        assert!(book.is_crossed());
        assert!(book.mid_price().is_none());
    }

    #[test]
    fn mid_price_between_best_levels() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply(&update(
            1,
            1,
            vec![(dec!(50000), dec!(1.0))],
            vec![(dec!(50010), dec!(1.0))],
        ));
        assert_eq!(book.mid_price(), Some(dec!(50005)));
    }

    #[test]
    fn manager_invalidate_all_marks_books_uninitialized() {
        let mgr = OrderBookManager::new();
        mgr.subscribe("BTCUSDT");
        mgr.apply(&update(1, 1, vec![(dec!(50000), dec!(1.0))], vec![]));
        assert!(mgr.snapshot("BTCUSDT", 5).is_some());

        mgr.invalidate_all();
        // Uninitialized books do not serve snapshots.
        assert!(mgr.snapshot("BTCUSDT", 5).is_none());

        // Re-baseline restores service.
        let outcome = mgr.apply(&update(500, 501, vec![(dec!(50100), dec!(1.0))], vec![]));
        assert_eq!(outcome, Some(ApplyOutcome::Baseline));
        assert!(mgr.snapshot("BTCUSDT", 5).is_some());
    }

    #[test]
    fn unsubscribe_destroys_book() {
        let mgr = OrderBookManager::new();
        mgr.subscribe("BTCUSDT");
        mgr.unsubscribe("BTCUSDT");
        assert!(mgr.symbols().is_empty());
        assert!(mgr
            .apply(&update(1, 1, vec![(dec!(50000), dec!(1.0))], vec![]))
            .is_none());
    }
}
