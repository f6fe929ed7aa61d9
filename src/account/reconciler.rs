// =============================================================================
// Reconciler — periodic exchange snapshot vs. local state
// =============================================================================
//
// Every cycle fetches the authoritative REST account snapshot, computes the
// per-asset and per-symbol drift, and overwrites local state when drift
// exceeds tolerance. Exchange wins: local state is a projection. A cycle
// that cannot fetch the snapshot is skipped, never fatal.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::account::monitor::AccountMonitor;
use crate::account::position::Position;
use crate::bus::{self, Bus};
use crate::exchange::client::{ExchangeClient, ExchangePosition};
use crate::types::{Alert, AlertSeverity, Balance, PositionSide};

/// Balance drift below this is noise.
pub const BALANCE_EPSILON: f64 = 1e-5;
/// Position drift below this is noise.
pub const POSITION_EPSILON: f64 = 1e-4;

/// One out-of-tolerance balance difference.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDrift {
    pub asset: String,
    pub local_total: f64,
    pub exchange_total: f64,
    /// exchange − local.
    pub drift: f64,
    /// First sighting of this asset: populate, do not alert.
    pub initialization: bool,
}

/// One out-of-tolerance position difference (signed quantities).
#[derive(Debug, Clone, PartialEq)]
pub struct PositionDrift {
    pub symbol: String,
    pub local_qty: f64,
    pub exchange_qty: f64,
    /// exchange − local.
    pub drift: f64,
    pub exchange_entry_price: f64,
}

/// Per-asset drift between local balances and the exchange snapshot.
pub fn compute_balance_drift(
    local: &HashMap<String, Balance>,
    exchange: &[Balance],
) -> Vec<BalanceDrift> {
    let mut drifts = Vec::new();

    for ex in exchange {
        match local.get(&ex.asset) {
            Some(loc) => {
                let drift = ex.total() - loc.total();
                if drift.abs() >= BALANCE_EPSILON {
                    drifts.push(BalanceDrift {
                        asset: ex.asset.clone(),
                        local_total: loc.total(),
                        exchange_total: ex.total(),
                        drift,
                        initialization: false,
                    });
                }
            }
            None => {
                // Uninitialized balance: first run populates it.
                drifts.push(BalanceDrift {
                    asset: ex.asset.clone(),
                    local_total: 0.0,
                    exchange_total: ex.total(),
                    drift: ex.total(),
                    initialization: true,
                });
            }
        }
    }

    // Assets we hold locally that the exchange no longer reports.
    for (asset, loc) in local {
        if loc.total().abs() >= BALANCE_EPSILON
            && !exchange.iter().any(|ex| &ex.asset == asset)
        {
            drifts.push(BalanceDrift {
                asset: asset.clone(),
                local_total: loc.total(),
                exchange_total: 0.0,
                drift: -loc.total(),
                initialization: false,
            });
        }
    }

    drifts
}

fn signed_quantity(position: &Position) -> f64 {
    match position.side {
        PositionSide::Long => position.quantity,
        PositionSide::Short => -position.quantity,
        PositionSide::Flat => 0.0,
    }
}

/// Per-symbol drift between local positions and the exchange snapshot.
pub fn compute_position_drift(
    local: &HashMap<String, Position>,
    exchange: &[ExchangePosition],
) -> Vec<PositionDrift> {
    let mut drifts = Vec::new();

    for ex in exchange {
        let local_qty = local.get(&ex.symbol).map(signed_quantity).unwrap_or(0.0);
        let drift = ex.quantity - local_qty;
        if drift.abs() >= POSITION_EPSILON {
            drifts.push(PositionDrift {
                symbol: ex.symbol.clone(),
                local_qty,
                exchange_qty: ex.quantity,
                drift,
                exchange_entry_price: ex.entry_price,
            });
        }
    }

    // Local positions the exchange reports flat.
    for (symbol, position) in local {
        let local_qty = signed_quantity(position);
        if local_qty.abs() >= POSITION_EPSILON
            && !exchange.iter().any(|ex| &ex.symbol == symbol)
        {
            drifts.push(PositionDrift {
                symbol: symbol.clone(),
                local_qty,
                exchange_qty: 0.0,
                drift: -local_qty,
                exchange_entry_price: 0.0,
            });
        }
    }

    drifts
}

// -----------------------------------------------------------------------------
// Loop
// -----------------------------------------------------------------------------

/// Named periodic task: reconcile every `interval` until shutdown.
pub async fn run_reconciler(
    client: Arc<ExchangeClient>,
    monitor: Arc<AccountMonitor>,
    bus: Arc<Bus>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "reconciler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("reconciler stopped");
                return;
            }
        }

        let (balances, positions) = match client.fetch_account().await {
            Ok(snap) => {
                debug!(
                    total_wallet_balance = snap.total_wallet_balance,
                    available_balance = snap.available_balance,
                    "account snapshot fetched"
                );
                (snap.balances, snap.positions)
            }
            Err(e) => {
                // The combined endpoint is down; the narrower balance and
                // position endpoints sometimes still answer.
                warn!(error = %e, "account snapshot unavailable — trying split endpoints");
                match (client.fetch_balances().await, client.fetch_position_risk().await) {
                    (Ok(balances), Ok(positions)) => (balances, positions),
                    _ => {
                        warn!("exchange state unavailable — skipping cycle");
                        continue;
                    }
                }
            }
        };

        let balance_drifts = compute_balance_drift(&monitor.balances_snapshot(), &balances);
        let position_drifts = compute_position_drift(&monitor.positions_snapshot(), &positions);

        if balance_drifts.is_empty() && position_drifts.is_empty() {
            debug!("reconciliation clean — no drift");
            continue;
        }

        // Exchange wins: overwrite local under the monitor's write lease.
        let balance_overwrites: Vec<Balance> = balance_drifts
            .iter()
            .map(|d| {
                balances
                    .iter()
                    .find(|b| b.asset == d.asset)
                    .cloned()
                    // Asset gone at the exchange: zero it locally.
                    .unwrap_or_else(|| Balance {
                        asset: d.asset.clone(),
                        free: 0.0,
                        locked: 0.0,
                    })
            })
            .collect();

        let position_overwrites: Vec<ExchangePosition> = position_drifts
            .iter()
            .map(|d| ExchangePosition {
                symbol: d.symbol.clone(),
                quantity: d.exchange_qty,
                entry_price: d.exchange_entry_price,
                unrealized_pnl: 0.0,
            })
            .collect();

        monitor
            .apply_corrections(balance_overwrites, position_overwrites)
            .await;

        // Initialization populates silently; real drift alerts.
        for drift in balance_drifts.iter().filter(|d| !d.initialization) {
            warn!(
                asset = %drift.asset,
                local = drift.local_total,
                exchange = drift.exchange_total,
                drift = drift.drift,
                "balance drift corrected"
            );
            let alert = Alert::new(
                "balance_drift",
                AlertSeverity::Warning,
                None,
                format!(
                    "{} drifted by {:.8} (local {} -> exchange {})",
                    drift.asset, drift.drift, drift.local_total, drift.exchange_total
                ),
                drift.drift,
                BALANCE_EPSILON,
            );
            bus.publish_json(bus::alerts_subject(&alert.alert_type), &alert)
                .await;
        }

        for drift in &position_drifts {
            warn!(
                symbol = %drift.symbol,
                local_qty = drift.local_qty,
                exchange_qty = drift.exchange_qty,
                drift = drift.drift,
                "position drift corrected"
            );
            let alert = Alert::new(
                "position_drift",
                AlertSeverity::Warning,
                Some(drift.symbol.clone()),
                format!(
                    "{} drifted by {:.8} (local {} -> exchange {})",
                    drift.symbol, drift.drift, drift.local_qty, drift.exchange_qty
                ),
                drift.drift,
                POSITION_EPSILON,
            );
            bus.publish_json(bus::alerts_subject(&alert.alert_type), &alert)
                .await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fill, Side};

    fn balances(entries: &[(&str, f64)]) -> HashMap<String, Balance> {
        entries
            .iter()
            .map(|(asset, total)| {
                (
                    asset.to_string(),
                    Balance {
                        asset: asset.to_string(),
                        free: *total,
                        locked: 0.0,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn out_of_tolerance_balance_is_flagged() {
        // Local 1000.00000, exchange 995.00000: drift -5.0.
        let local = balances(&[("USDT", 1000.0)]);
        let exchange = vec![Balance {
            asset: "USDT".to_string(),
            free: 995.0,
            locked: 0.0,
        }];

        let drifts = compute_balance_drift(&local, &exchange);
        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].asset, "USDT");
        assert!((drifts[0].drift + 5.0).abs() < 1e-9);
        assert!(!drifts[0].initialization);
    }

    #[test]
    fn drift_inside_tolerance_is_noise() {
        let local = balances(&[("USDT", 1000.0)]);
        let exchange = vec![Balance {
            asset: "USDT".to_string(),
            free: 1000.0 + BALANCE_EPSILON / 2.0,
            locked: 0.0,
        }];
        assert!(compute_balance_drift(&local, &exchange).is_empty());
    }

    #[test]
    fn first_sighting_is_initialization_not_drift() {
        let local = HashMap::new();
        let exchange = vec![Balance {
            asset: "USDT".to_string(),
            free: 500.0,
            locked: 0.0,
        }];

        let drifts = compute_balance_drift(&local, &exchange);
        assert_eq!(drifts.len(), 1);
        assert!(drifts[0].initialization);
        assert!((drifts[0].exchange_total - 500.0).abs() < 1e-9);
    }

    #[test]
    fn locally_held_asset_missing_at_exchange_drifts_to_zero() {
        let local = balances(&[("BNB", 2.0)]);
        let drifts = compute_balance_drift(&local, &[]);
        assert_eq!(drifts.len(), 1);
        assert!((drifts[0].drift + 2.0).abs() < 1e-9);
        assert!(!drifts[0].initialization);
    }

    fn long_position(symbol: &str, qty: f64, entry: f64) -> Position {
        let mut pos = Position::flat("primary", symbol);
        pos.apply_fill(&Fill {
            order_id: 1,
            client_id: "ord".to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            price: entry,
            quantity: qty,
            fee: 0.0,
            fee_asset: String::new(),
            exchange_trade_id: 0,
            timestamp_ms: 0,
        });
        pos
    }

    #[test]
    fn position_drift_uses_signed_quantities() {
        let mut local = HashMap::new();
        local.insert("BTCUSDT".to_string(), long_position("BTCUSDT", 1.0, 50_000.0));

        let exchange = vec![ExchangePosition {
            symbol: "BTCUSDT".to_string(),
            quantity: -0.5,
            entry_price: 51_000.0,
            unrealized_pnl: 0.0,
        }];

        let drifts = compute_position_drift(&local, &exchange);
        assert_eq!(drifts.len(), 1);
        assert!((drifts[0].drift + 1.5).abs() < 1e-9);
    }

    #[test]
    fn flat_everywhere_is_clean() {
        let local = HashMap::new();
        assert!(compute_position_drift(&local, &[]).is_empty());

        let mut flat_local = HashMap::new();
        flat_local.insert(
            "BTCUSDT".to_string(),
            Position::flat("primary", "BTCUSDT"),
        );
        assert!(compute_position_drift(&flat_local, &[]).is_empty());
    }

    #[test]
    fn local_position_gone_at_exchange_is_corrected_to_flat() {
        let mut local = HashMap::new();
        local.insert("ETHUSDT".to_string(), long_position("ETHUSDT", 2.0, 3_000.0));

        let drifts = compute_position_drift(&local, &[]);
        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].exchange_qty, 0.0);
        assert!((drifts[0].drift + 2.0).abs() < 1e-9);
    }
}
