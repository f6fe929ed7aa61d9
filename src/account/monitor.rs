// =============================================================================
// Account Monitor — single writer for positions, balances, and risk state
// =============================================================================
//
// The monitor is the only component that mutates account state. Fills from
// the bus, ACCOUNT_UPDATE events from the exchange, and reconciliation
// corrections all funnel through it; readers get value snapshots. Risk
// thresholds are evaluated after every mutation and violations go out on
// `alerts.{type}`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::account::position::Position;
use crate::bus::{self, Bus};
use crate::cache::{self, Cache};
use crate::exchange::client::ExchangePosition;
use crate::market_data::MarkPrices;
use crate::types::{split_symbol, Alert, AlertSeverity, Balance, Fill, PositionSide, Side};

// -----------------------------------------------------------------------------
// Risk thresholds
// -----------------------------------------------------------------------------

fn default_min_balance() -> f64 {
    0.0
}

fn default_max_drawdown_pct() -> f64 {
    100.0
}

fn default_max_margin_ratio() -> f64 {
    1.0
}

fn default_max_position_size() -> f64 {
    f64::INFINITY
}

/// Configurable risk limits, hot-reloaded from the config service
/// (`risk_limit` type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Alert when the quote balance drops below this.
    #[serde(default = "default_min_balance")]
    pub min_balance: f64,
    /// Alert when drawdown from peak equity exceeds this percentage.
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    /// Alert when locked/total for the quote asset exceeds this ratio.
    #[serde(default = "default_max_margin_ratio")]
    pub max_margin_ratio: f64,
    /// Alert when any position magnitude exceeds this.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            min_balance: default_min_balance(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_margin_ratio: default_max_margin_ratio(),
            max_position_size: default_max_position_size(),
        }
    }
}

// -----------------------------------------------------------------------------
// Monitor
// -----------------------------------------------------------------------------

pub struct AccountMonitor {
    account_id: String,
    positions: RwLock<HashMap<String, Position>>,
    balances: RwLock<HashMap<String, Balance>>,
    risk: RwLock<RiskThresholds>,
    peak_equity: RwLock<f64>,
    marks: Arc<MarkPrices>,
    bus: Arc<Bus>,
    cache: Arc<Cache>,
}

impl AccountMonitor {
    pub fn new(
        account_id: impl Into<String>,
        marks: Arc<MarkPrices>,
        bus: Arc<Bus>,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            positions: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            risk: RwLock::new(RiskThresholds::default()),
            peak_equity: RwLock::new(0.0),
            marks,
            bus,
            cache,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply one fill: position math, balance flows, publication, risk.
    pub async fn apply_fill(&self, fill: &Fill) {
        let position = {
            let mut positions = self.positions.write();
            let position = positions
                .entry(fill.symbol.clone())
                .or_insert_with(|| Position::flat(&self.account_id, &fill.symbol));
            let outcome = position.apply_fill(fill);
            debug!(
                symbol = %fill.symbol,
                realized_delta = outcome.realized_delta,
                reversed = outcome.reversed,
                closed = outcome.closed,
                "fill applied to position"
            );
            position.clone()
        };

        self.apply_fill_to_balances(fill);

        self.publish_position(&position).await;
        self.publish_balances_for_fill(fill).await;
        self.run_risk_checks().await;
    }

    /// Quote outflow/inflow, base inflow/outflow, fee deduction.
    fn apply_fill_to_balances(&self, fill: &Fill) {
        let (base, quote) = split_symbol(&fill.symbol);
        let notional = fill.price * fill.quantity;

        let mut balances = self.balances.write();
        {
            let quote_bal = balances
                .entry(quote.clone())
                .or_insert_with(|| Balance {
                    asset: quote.clone(),
                    free: 0.0,
                    locked: 0.0,
                });
            match fill.side {
                Side::Buy => quote_bal.free -= notional,
                Side::Sell => quote_bal.free += notional,
            }
        }
        {
            let base_bal = balances.entry(base.clone()).or_insert_with(|| Balance {
                asset: base.clone(),
                free: 0.0,
                locked: 0.0,
            });
            match fill.side {
                Side::Buy => base_bal.free += fill.quantity,
                Side::Sell => base_bal.free -= fill.quantity,
            }
        }
        if fill.fee != 0.0 && !fill.fee_asset.is_empty() {
            let fee_bal = balances
                .entry(fill.fee_asset.clone())
                .or_insert_with(|| Balance {
                    asset: fill.fee_asset.clone(),
                    free: 0.0,
                    locked: 0.0,
                });
            fee_bal.free -= fill.fee;
        }
    }

    // -------------------------------------------------------------------------
    // Exchange account events
    // -------------------------------------------------------------------------

    /// ACCOUNT_UPDATE balance slice: the exchange figures win.
    pub async fn apply_balance_snapshot(&self, updates: Vec<Balance>) {
        {
            let mut balances = self.balances.write();
            for update in &updates {
                balances.insert(update.asset.clone(), update.clone());
            }
        }
        for balance in &updates {
            self.publish_balance(balance).await;
        }
        self.run_risk_checks().await;
    }

    /// ACCOUNT_UPDATE position slice: overwrite quantity/entry, keep the
    /// locally accumulated realized P&L.
    pub async fn apply_position_snapshot(&self, updates: Vec<ExchangePosition>) {
        let mut published = Vec::with_capacity(updates.len());
        {
            let mut positions = self.positions.write();
            for update in updates {
                let position = positions
                    .entry(update.symbol.clone())
                    .or_insert_with(|| Position::flat(&self.account_id, &update.symbol));
                overwrite_position(position, update.quantity, update.entry_price);
                published.push(position.clone());
            }
        }
        for position in &published {
            self.publish_position(position).await;
        }
        self.run_risk_checks().await;
    }

    // -------------------------------------------------------------------------
    // Reconciliation lease
    // -------------------------------------------------------------------------

    /// Overwrite local state with exchange figures. Called only by the
    /// reconciler, which holds the write lease for the duration of each
    /// overwrite; every entity is corrected atomically under the lock.
    pub async fn apply_corrections(
        &self,
        balance_overwrites: Vec<Balance>,
        position_overwrites: Vec<ExchangePosition>,
    ) {
        if !balance_overwrites.is_empty() {
            let mut balances = self.balances.write();
            for b in &balance_overwrites {
                balances.insert(b.asset.clone(), b.clone());
            }
        }
        for balance in &balance_overwrites {
            info!(asset = %balance.asset, total = balance.total(), "balance corrected from exchange");
            self.publish_balance(balance).await;
        }

        let mut published = Vec::with_capacity(position_overwrites.len());
        if !position_overwrites.is_empty() {
            let mut positions = self.positions.write();
            for p in position_overwrites {
                let position = positions
                    .entry(p.symbol.clone())
                    .or_insert_with(|| Position::flat(&self.account_id, &p.symbol));
                overwrite_position(position, p.quantity, p.entry_price);
                published.push(position.clone());
            }
        }
        for position in &published {
            info!(
                symbol = %position.symbol,
                side = %position.side,
                quantity = position.quantity,
                "position corrected from exchange"
            );
            self.publish_position(position).await;
        }

        if !balance_overwrites.is_empty() || !published.is_empty() {
            self.run_risk_checks().await;
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn balances_snapshot(&self) -> HashMap<String, Balance> {
        self.balances.read().clone()
    }

    pub fn positions_snapshot(&self) -> HashMap<String, Position> {
        self.positions.read().clone()
    }

    /// Position with unrealized P&L valued at the current mark.
    pub fn position(&self, symbol: &str) -> Option<Position> {
        let mut position = self.positions.read().get(symbol).cloned()?;
        if let Some(mark) = self.marks.mark(symbol) {
            position.unrealized_pnl = position.unrealized(mark);
        }
        Some(position)
    }

    pub fn set_risk_thresholds(&self, thresholds: RiskThresholds) {
        info!(?thresholds, "risk thresholds updated");
        *self.risk.write() = thresholds;
    }

    // -------------------------------------------------------------------------
    // Publication
    // -------------------------------------------------------------------------

    async fn publish_position(&self, position: &Position) {
        let mut valued = position.clone();
        if let Some(mark) = self.marks.mark(&position.symbol) {
            valued.unrealized_pnl = valued.unrealized(mark);
        }
        self.bus
            .publish_json(bus::POSITION_UPDATE_SUBJECT.to_string(), &valued)
            .await;
        self.cache
            .put_json(
                &cache::position_key(&self.account_id, &position.symbol),
                &valued,
                None,
            )
            .await;
    }

    async fn publish_balance(&self, balance: &Balance) {
        self.bus
            .publish_json(bus::BALANCE_UPDATE_SUBJECT.to_string(), balance)
            .await;
        self.cache
            .put_json(
                &cache::balance_key(&self.account_id, &balance.asset),
                balance,
                None,
            )
            .await;
    }

    async fn publish_balances_for_fill(&self, fill: &Fill) {
        let (base, quote) = split_symbol(&fill.symbol);
        let mut assets = vec![base, quote];
        if !fill.fee_asset.is_empty() && !assets.contains(&fill.fee_asset) {
            assets.push(fill.fee_asset.clone());
        }
        let balances = self.balances.read().clone();
        for asset in assets {
            if let Some(balance) = balances.get(&asset) {
                self.publish_balance(balance).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Risk checks
    // -------------------------------------------------------------------------

    async fn run_risk_checks(&self) {
        let alerts = self.evaluate_risk();
        for alert in alerts {
            warn!(
                alert_type = %alert.alert_type,
                value = alert.value,
                threshold = alert.threshold,
                "risk alert"
            );
            self.bus
                .publish_json(bus::alerts_subject(&alert.alert_type), &alert)
                .await;
        }
    }

    fn evaluate_risk(&self) -> Vec<Alert> {
        let thresholds = self.risk.read().clone();
        let balances = self.balances.read();
        let positions = self.positions.read();
        let mut alerts = Vec::new();

        // Quote-asset floor and margin ratio.
        if let Some(quote) = balances.get("USDT") {
            if quote.total() < thresholds.min_balance {
                alerts.push(Alert::new(
                    "low_balance",
                    AlertSeverity::Critical,
                    None,
                    format!("quote balance {} below floor", quote.total()),
                    quote.total(),
                    thresholds.min_balance,
                ));
            }
            let total = quote.total();
            if total > 0.0 {
                let margin_ratio = quote.locked / total;
                if margin_ratio > thresholds.max_margin_ratio {
                    alerts.push(Alert::new(
                        "margin_ratio",
                        AlertSeverity::Warning,
                        None,
                        format!("margin ratio {margin_ratio:.4} above limit"),
                        margin_ratio,
                        thresholds.max_margin_ratio,
                    ));
                }
            }
        }

        // Per-symbol position magnitude.
        for position in positions.values() {
            if position.side != PositionSide::Flat
                && position.quantity > thresholds.max_position_size
            {
                alerts.push(Alert::new(
                    "position_limit",
                    AlertSeverity::Warning,
                    Some(position.symbol.clone()),
                    format!(
                        "{} position {} exceeds size limit",
                        position.symbol, position.quantity
                    ),
                    position.quantity,
                    thresholds.max_position_size,
                ));
            }
        }

        // Drawdown from peak equity (balances + unrealized).
        let unrealized: f64 = positions
            .values()
            .filter_map(|p| self.marks.mark(&p.symbol).map(|m| p.unrealized(m)))
            .sum();
        let equity: f64 = balances.values().map(Balance::total).sum::<f64>() + unrealized;
        drop(balances);
        drop(positions);

        let mut peak = self.peak_equity.write();
        if equity > *peak {
            *peak = equity;
        }
        if *peak > 0.0 {
            let drawdown_pct = (*peak - equity) / *peak * 100.0;
            if drawdown_pct > thresholds.max_drawdown_pct {
                alerts.push(Alert::new(
                    "max_drawdown",
                    AlertSeverity::Critical,
                    None,
                    format!("drawdown {drawdown_pct:.2}% exceeds limit"),
                    drawdown_pct,
                    thresholds.max_drawdown_pct,
                ));
            }
        }

        alerts
    }
}

/// Map a signed exchange quantity onto side + magnitude.
fn overwrite_position(position: &mut Position, signed_qty: f64, entry_price: f64) {
    if signed_qty.abs() < 1e-12 {
        position.side = PositionSide::Flat;
        position.quantity = 0.0;
        position.avg_entry_price = 0.0;
    } else {
        position.side = if signed_qty > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        position.quantity = signed_qty.abs();
        position.avg_entry_price = entry_price;
    }
    position.last_updated_ms = chrono::Utc::now().timestamp_millis();
}

// -----------------------------------------------------------------------------
// Fill consumer
// -----------------------------------------------------------------------------

/// Subscribe to `orders.fills.*` and feed the monitor.
pub async fn run_fill_consumer(
    monitor: Arc<AccountMonitor>,
    bus: Arc<Bus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sub = match bus.subscribe(bus::FILLS_WILDCARD.to_string()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "fill subscription failed");
            return;
        }
    };
    info!(subject = bus::FILLS_WILDCARD, "fill consumer started");

    loop {
        let msg = tokio::select! {
            msg = sub.next() => match msg {
                Some(m) => m,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        match serde_json::from_slice::<Fill>(&msg.payload) {
            Ok(fill) => monitor.apply_fill(&fill).await,
            Err(e) => warn!(error = %e, "undecodable fill dropped"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_maps_signed_quantity() {
        let mut pos = Position::flat("primary", "BTCUSDT");
        overwrite_position(&mut pos, 1.5, 50_000.0);
        assert_eq!(pos.side, PositionSide::Long);
        assert!((pos.quantity - 1.5).abs() < 1e-12);

        overwrite_position(&mut pos, -0.25, 51_000.0);
        assert_eq!(pos.side, PositionSide::Short);
        assert!((pos.quantity - 0.25).abs() < 1e-12);
        assert!((pos.avg_entry_price - 51_000.0).abs() < 1e-9);

        overwrite_position(&mut pos, 0.0, 0.0);
        assert_eq!(pos.side, PositionSide::Flat);
        assert_eq!(pos.quantity, 0.0);
    }

    #[test]
    fn risk_thresholds_deserialize_with_defaults() {
        let t: RiskThresholds = serde_json::from_str("{}").unwrap();
        assert_eq!(t.min_balance, 0.0);
        assert_eq!(t.max_drawdown_pct, 100.0);

        let t: RiskThresholds =
            serde_json::from_str(r#"{"min_balance": 100.0, "max_position_size": 5.0}"#).unwrap();
        assert_eq!(t.min_balance, 100.0);
        assert_eq!(t.max_position_size, 5.0);
        assert_eq!(t.max_margin_ratio, 1.0);
    }
}
