// =============================================================================
// Recorder — durable time-series of fills, alerts, and P&L snapshots
// =============================================================================
//
// A bus consumer, deliberately decoupled from the hot path: it subscribes
// to the fills and alerts subjects and writes rows as they arrive, plus a
// periodic per-symbol P&L snapshot. Fill inserts are keyed on
// `exchange_trade_id`, so redelivered messages land at most once.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::account::monitor::AccountMonitor;
use crate::account::position::Position;
use crate::bus::{self, Bus};
use crate::market_data::MarkPrices;
use crate::types::{Alert, Fill, PositionSide};

/// Cadence of the per-symbol P&L snapshot.
const PNL_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// One row headed for `pnl_snapshots`.
#[derive(Debug, Clone, PartialEq)]
pub struct PnlRow {
    pub account: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Build snapshot rows from the monitor's position map, valuing unrealized
/// P&L at the current mark. Flat positions with no history are skipped.
pub fn pnl_rows(
    account: &str,
    positions: &std::collections::HashMap<String, Position>,
    marks: &MarkPrices,
) -> Vec<PnlRow> {
    positions
        .values()
        .filter(|p| p.side != PositionSide::Flat || p.realized_pnl != 0.0)
        .map(|p| {
            let unrealized = marks
                .mark(&p.symbol)
                .map(|mark| p.unrealized(mark))
                .unwrap_or(0.0);
            PnlRow {
                account: account.to_string(),
                symbol: p.symbol.clone(),
                side: p.side,
                quantity: p.quantity,
                avg_entry_price: p.avg_entry_price,
                realized_pnl: p.realized_pnl,
                unrealized_pnl: unrealized,
            }
        })
        .collect()
}

fn ms_to_ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

async fn insert_fill(pool: &PgPool, fill: &Fill) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO fills \
         (id, order_id, client_id, symbol, side, price, quantity, fee, fee_asset, \
          exchange_trade_id, ts) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (exchange_trade_id) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(fill.order_id as i64)
    .bind(&fill.client_id)
    .bind(&fill.symbol)
    .bind(fill.side.to_string())
    .bind(fill.price)
    .bind(fill.quantity)
    .bind(fill.fee)
    .bind(&fill.fee_asset)
    .bind(fill.exchange_trade_id as i64)
    .bind(ms_to_ts(fill.timestamp_ms))
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_alert(pool: &PgPool, alert: &Alert) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO alerts \
         (id, alert_type, severity, symbol, message, value, threshold, ts) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(Uuid::new_v4())
    .bind(&alert.alert_type)
    .bind(alert.severity.to_string())
    .bind(alert.symbol.as_deref())
    .bind(&alert.message)
    .bind(alert.value)
    .bind(alert.threshold)
    .bind(ms_to_ts(alert.timestamp_ms))
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_pnl_rows(pool: &PgPool, rows: &[PnlRow]) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    for row in rows {
        sqlx::query(
            "INSERT INTO pnl_snapshots \
             (id, account, symbol, side, quantity, avg_entry_price, \
              realized_pnl, unrealized_pnl, ts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(Uuid::new_v4())
        .bind(&row.account)
        .bind(&row.symbol)
        .bind(row.side.to_string())
        .bind(row.quantity)
        .bind(row.avg_entry_price)
        .bind(row.realized_pnl)
        .bind(row.unrealized_pnl)
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Run the recorder until shutdown. Subscription failures degrade to the
/// snapshot loop alone; insert failures are logged and dropped (the bus is
/// the source of truth for live consumers, the tables are history).
pub async fn run_recorder(
    pool: PgPool,
    bus: Arc<Bus>,
    monitor: Arc<AccountMonitor>,
    marks: Arc<MarkPrices>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut fills = bus.subscribe(bus::FILLS_WILDCARD.to_string()).await.ok();
    let mut alerts = bus.subscribe("alerts.*".to_string()).await.ok();
    if fills.is_none() || alerts.is_none() {
        warn!("recorder subscriptions incomplete — persisting snapshots only");
    }

    let mut snapshot_timer = tokio::time::interval(PNL_SNAPSHOT_INTERVAL);
    snapshot_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    snapshot_timer.tick().await;
    info!("recorder started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("recorder stopped");
                return;
            }
            _ = snapshot_timer.tick() => {
                let rows = pnl_rows(
                    monitor.account_id(),
                    &monitor.positions_snapshot(),
                    &marks,
                );
                if rows.is_empty() {
                    continue;
                }
                match insert_pnl_rows(&pool, &rows).await {
                    Ok(()) => debug!(count = rows.len(), "pnl snapshot persisted"),
                    Err(e) => warn!(error = %e, "pnl snapshot insert failed"),
                }
            }
            msg = next_or_pending(&mut fills) => {
                match serde_json::from_slice::<Fill>(&msg.payload) {
                    Ok(fill) => {
                        if let Err(e) = insert_fill(&pool, &fill).await {
                            warn!(error = %e, "fill insert failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable fill skipped by recorder"),
                }
            }
            msg = next_or_pending(&mut alerts) => {
                match serde_json::from_slice::<Alert>(&msg.payload) {
                    Ok(alert) => {
                        if let Err(e) = insert_alert(&pool, &alert).await {
                            warn!(error = %e, "alert insert failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable alert skipped by recorder"),
                }
            }
        }
    }
}

/// Await the next message, or park forever when the subscription is absent
/// or closed so the other select arms keep running.
async fn next_or_pending(sub: &mut Option<async_nats::Subscriber>) -> async_nats::Message {
    match sub {
        Some(s) => match s.next().await {
            Some(msg) => msg,
            None => {
                *sub = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use std::collections::HashMap;

    fn position_with_fill(symbol: &str, qty: f64, price: f64) -> Position {
        let mut pos = Position::flat("primary", symbol);
        pos.apply_fill(&Fill {
            order_id: 1,
            client_id: "ord".to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            price,
            quantity: qty,
            fee: 0.0,
            fee_asset: String::new(),
            exchange_trade_id: 0,
            timestamp_ms: 0,
        });
        pos
    }

    #[test]
    fn pnl_rows_value_open_positions_at_mark() {
        let marks = MarkPrices::new();
        marks.set_trade("BTCUSDT", 50_100.0);

        let mut positions = HashMap::new();
        positions.insert(
            "BTCUSDT".to_string(),
            position_with_fill("BTCUSDT", 2.0, 50_000.0),
        );

        let rows = pnl_rows("primary", &positions, &marks);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTCUSDT");
        assert_eq!(rows[0].side, PositionSide::Long);
        assert!((rows[0].unrealized_pnl - 200.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_rows_skip_untouched_flat_positions() {
        let marks = MarkPrices::new();
        let mut positions = HashMap::new();
        positions.insert(
            "BTCUSDT".to_string(),
            Position::flat("primary", "BTCUSDT"),
        );
        assert!(pnl_rows("primary", &positions, &marks).is_empty());

        // A closed position with realized history still snapshots.
        let mut closed = position_with_fill("ETHUSDT", 1.0, 3_000.0);
        closed.apply_fill(&Fill {
            order_id: 2,
            client_id: "ord2".to_string(),
            symbol: "ETHUSDT".to_string(),
            side: Side::Sell,
            price: 3_100.0,
            quantity: 1.0,
            fee: 0.0,
            fee_asset: String::new(),
            exchange_trade_id: 0,
            timestamp_ms: 0,
        });
        positions.insert("ETHUSDT".to_string(), closed);
        let rows = pnl_rows("primary", &positions, &marks);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].realized_pnl - 100.0).abs() < 1e-9);
        assert_eq!(rows[0].side, PositionSide::Flat);
    }

    #[test]
    fn millisecond_timestamps_convert() {
        let ts = ms_to_ts(1_700_000_000_000);
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_000);
    }
}
