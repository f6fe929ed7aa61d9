// =============================================================================
// Market data — order books, ingestion, mark prices
// =============================================================================

pub mod ingestor;
pub mod orderbook;

pub use ingestor::run_ingestor;
pub use orderbook::{ApplyOutcome, BookSnapshot, DepthUpdate, OrderBook, OrderBookManager};

use std::collections::HashMap;

use parking_lot::RwLock;

/// Latest mark price per symbol: the last trade when one has printed,
/// otherwise the book mid. Account monitoring reads this lazily to value
/// open positions.
pub struct MarkPrices {
    last_trade: RwLock<HashMap<String, f64>>,
    mid: RwLock<HashMap<String, f64>>,
}

impl MarkPrices {
    pub fn new() -> Self {
        Self {
            last_trade: RwLock::new(HashMap::new()),
            mid: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_trade(&self, symbol: &str, price: f64) {
        self.last_trade.write().insert(symbol.to_string(), price);
    }

    pub fn set_mid(&self, symbol: &str, price: f64) {
        self.mid.write().insert(symbol.to_string(), price);
    }

    pub fn mark(&self, symbol: &str) -> Option<f64> {
        self.last_trade
            .read()
            .get(symbol)
            .copied()
            .or_else(|| self.mid.read().get(symbol).copied())
    }
}

impl Default for MarkPrices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_prefers_last_trade_over_mid() {
        let marks = MarkPrices::new();
        assert!(marks.mark("BTCUSDT").is_none());

        marks.set_mid("BTCUSDT", 50005.0);
        assert_eq!(marks.mark("BTCUSDT"), Some(50005.0));

        marks.set_trade("BTCUSDT", 50010.0);
        assert_eq!(marks.mark("BTCUSDT"), Some(50010.0));
    }
}
