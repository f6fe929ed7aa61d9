// =============================================================================
// Market-data ingestor — applies stream events to books and fans them out
// =============================================================================
//
// One task consumes the whole market stream, so per-symbol arrival order is
// preserved without extra coordination; sequence numbers guard the rest.
// Deltas are applied at arrival rate — the ingestor drops nothing and the
// publisher never blocks it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::exchange::ws::{MarketEvent, TickerStats};
use crate::health::{ComponentHealth, HealthRegistry, COMPONENT_EXCHANGE_WS};
use crate::market_data::{ApplyOutcome, MarkPrices, OrderBookManager};
use crate::publisher::Publisher;

/// Depth of the published book snapshots.
const SNAPSHOT_DEPTH: usize = 20;

/// Consume market events until the channel closes or shutdown fires.
pub async fn run_ingestor(
    mut rx: mpsc::Receiver<MarketEvent>,
    books: Arc<OrderBookManager>,
    publisher: Arc<Publisher>,
    marks: Arc<MarkPrices>,
    health: Arc<HealthRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tickers: HashMap<String, TickerStats> = HashMap::new();
    info!("market-data ingestor started");

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(e) => e,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        health.set(COMPONENT_EXCHANGE_WS, ComponentHealth::Healthy);

        match event {
            MarketEvent::Depth(update) => {
                let symbol = update.symbol.clone();
                match books.apply(&update) {
                    Some(ApplyOutcome::Applied) | Some(ApplyOutcome::Baseline) => {
                        if let Some(mid) = books.mid_price(&symbol) {
                            if let Some(m) = mid.to_f64() {
                                marks.set_mid(&symbol, m);
                            }
                        }
                        if let Some(snapshot) = books.snapshot(&symbol, SNAPSHOT_DEPTH) {
                            publisher.publish_book(&snapshot).await;
                            publisher
                                .update_quote(
                                    &symbol,
                                    Some(&snapshot),
                                    None,
                                    tickers.get(&symbol).cloned(),
                                )
                                .await;
                        }
                    }
                    Some(ApplyOutcome::GapDetected) => {
                        debug!(
                            symbol = %symbol,
                            sequence_errors = books.sequence_errors(&symbol),
                            "delta dropped on sequence gap"
                        );
                    }
                    None => {
                        debug!(symbol = %symbol, "delta for unsubscribed symbol ignored");
                    }
                }
            }
            MarketEvent::Trade(trade) => {
                if let Some(price) = trade.price.to_f64() {
                    marks.set_trade(&trade.symbol, price);
                }
                publisher.publish_trade(&trade).await;
                publisher
                    .update_quote(
                        &trade.symbol,
                        books.snapshot(&trade.symbol, SNAPSHOT_DEPTH).as_ref(),
                        Some(trade.price),
                        tickers.get(&trade.symbol).cloned(),
                    )
                    .await;
            }
            MarketEvent::Ticker(stats) => {
                tickers.insert(stats.symbol.clone(), stats);
            }
        }
    }

    info!("market-data ingestor stopped");
}
