// =============================================================================
// Publisher — fan-out of market data to the bus and the quote cache
// =============================================================================
//
// Every publish is fire-and-forget: the bus and cache wrappers count their
// own failures and never block the ingestion path.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bus::{self, Bus};
use crate::cache::{self, Cache, MARKET_DATA_TTL_SECS};
use crate::exchange::ws::TickerStats;
use crate::market_data::BookSnapshot;
use crate::types::Trade;

/// Quote snapshot mirrored into the cache under `market_data:{SYM}`.
/// Fallback read path only; authoritative for no one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub symbol: String,
    #[serde(default)]
    pub last_price: Option<Decimal>,
    #[serde(default)]
    pub best_bid: Option<Decimal>,
    #[serde(default)]
    pub best_ask: Option<Decimal>,
    #[serde(default)]
    pub mid_price: Option<Decimal>,
    #[serde(default)]
    pub stats_24h: Option<TickerStats>,
    /// Microseconds since the UNIX epoch.
    pub timestamp_us: i64,
}

pub struct Publisher {
    bus: Arc<Bus>,
    cache: Arc<Cache>,
}

impl Publisher {
    pub fn new(bus: Arc<Bus>, cache: Arc<Cache>) -> Self {
        Self { bus, cache }
    }

    /// Publish a book snapshot on `orderbook:{SYM}`.
    pub async fn publish_book(&self, snapshot: &BookSnapshot) {
        self.bus
            .publish_json(bus::orderbook_subject(&snapshot.symbol), snapshot)
            .await;
    }

    /// Publish a trade print on `trades:{SYM}`.
    pub async fn publish_trade(&self, trade: &Trade) {
        self.bus
            .publish_json(bus::trades_subject(&trade.symbol), trade)
            .await;
    }

    /// Refresh the cached quote for `symbol` (5 minute TTL).
    pub async fn update_quote(
        &self,
        symbol: &str,
        book: Option<&BookSnapshot>,
        last_trade: Option<Decimal>,
        stats_24h: Option<TickerStats>,
    ) {
        let best_bid = book.and_then(|b| b.bids.first().map(|l| l.price));
        let best_ask = book.and_then(|b| b.asks.first().map(|l| l.price));
        let mid_price = derive_mid(best_bid, best_ask);

        let quote = QuoteSnapshot {
            symbol: symbol.to_string(),
            last_price: last_trade.or(mid_price),
            best_bid,
            best_ask,
            mid_price,
            stats_24h,
            timestamp_us: chrono::Utc::now().timestamp_micros(),
        };

        self.cache
            .put_json(
                &cache::market_data_key(symbol),
                &quote,
                Some(MARKET_DATA_TTL_SECS),
            )
            .await;
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish()
    }
}

/// Crossed or one-sided books publish no mid.
fn derive_mid(best_bid: Option<Decimal>, best_ask: Option<Decimal>) -> Option<Decimal> {
    match (best_bid, best_ask) {
        (Some(bid), Some(ask)) if bid < ask => Some((bid + ask) / Decimal::TWO),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn mid_requires_an_uncrossed_two_sided_book() {
        assert_eq!(
            derive_mid(Some(dec!(50000)), Some(dec!(50010))),
            Some(dec!(50005))
        );
        assert_eq!(derive_mid(Some(dec!(50010)), Some(dec!(50000))), None);
        assert_eq!(derive_mid(Some(dec!(50000)), Some(dec!(50000))), None);
        assert_eq!(derive_mid(Some(dec!(50000)), None), None);
        assert_eq!(derive_mid(None, None), None);
    }

    #[test]
    fn quote_snapshot_serializes_without_optional_fields() {
        let quote = QuoteSnapshot {
            symbol: "BTCUSDT".to_string(),
            last_price: None,
            best_bid: Some(dec!(50000)),
            best_ask: Some(dec!(50010)),
            mid_price: Some(dec!(50005)),
            stats_24h: None,
            timestamp_us: 1_700_000_000_000_000,
        };
        let json = serde_json::to_value(&quote).unwrap();
        assert_eq!(json["symbol"], "BTCUSDT");
        assert!(json["stats_24h"].is_null());
        let back: QuoteSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.mid_price, Some(dec!(50005)));
    }
}
