// =============================================================================
// Position — weighted-average entry with realized/unrealized P&L
// =============================================================================
//
// Fill application in three shapes:
//   adding    — same side (or flat): entry becomes the weighted average
//   reducing  — opposite side, fill_qty <= qty: realize against entry
//   reversing — opposite side, fill_qty > qty: close everything, then open
//               the remainder at the fill price on the flipped side
//
// Fees always debit realized P&L, opening fills included, so a flat
// round-trip nets price P&L minus total fees paid.
//
// Unrealized P&L is never stored: it is recomputed from the current mark on
// every read.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Fill, PositionSide, Side};

/// Quantities below this are treated as flat.
const QTY_EPSILON: f64 = 1e-12;

/// What one fill did to the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillOutcome {
    /// Realized P&L delta from this fill (0 when purely adding).
    pub realized_delta: f64,
    /// The fill flipped the position side.
    pub reversed: bool,
    /// The position is flat after this fill.
    pub closed: bool,
}

/// A per-(account, symbol) position. `quantity` is an unsigned magnitude;
/// `side` carries the direction. `side == Flat <=> quantity == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
    /// Derived from the current mark at publish time, not maintained.
    #[serde(default)]
    pub unrealized_pnl: f64,
    /// Milliseconds since the UNIX epoch.
    pub last_updated_ms: i64,
}

impl Position {
    pub fn flat(account: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            symbol: symbol.into(),
            side: PositionSide::Flat,
            quantity: 0.0,
            avg_entry_price: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            last_updated_ms: Utc::now().timestamp_millis(),
        }
    }

    fn direction(&self) -> f64 {
        match self.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
            PositionSide::Flat => 0.0,
        }
    }

    fn side_for(fill_side: Side) -> PositionSide {
        match fill_side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }

    /// Apply one fill.
    pub fn apply_fill(&mut self, fill: &Fill) -> FillOutcome {
        let fill_side = Self::side_for(fill.side);
        self.last_updated_ms = fill.timestamp_ms;

        // Adding (or opening from flat): no price P&L, fee still debits.
        if self.side == PositionSide::Flat || self.side == fill_side {
            let new_qty = self.quantity + fill.quantity;
            self.avg_entry_price = (self.quantity * self.avg_entry_price
                + fill.quantity * fill.price)
                / new_qty;
            self.quantity = new_qty;
            self.side = fill_side;
            self.realized_pnl -= fill.fee;
            debug!(
                symbol = %self.symbol,
                side = %self.side,
                quantity = self.quantity,
                avg_entry_price = self.avg_entry_price,
                "position increased"
            );
            return FillOutcome {
                realized_delta: -fill.fee,
                reversed: false,
                closed: false,
            };
        }

        let sign = self.direction();

        // Reducing.
        if fill.quantity <= self.quantity + QTY_EPSILON {
            let closing_qty = fill.quantity.min(self.quantity);
            let realized_delta = sign * closing_qty * (fill.price - self.avg_entry_price) - fill.fee;
            self.realized_pnl += realized_delta;
            self.quantity -= closing_qty;

            let closed = self.quantity < QTY_EPSILON;
            if closed {
                self.quantity = 0.0;
                self.side = PositionSide::Flat;
                self.avg_entry_price = 0.0;
            }
            debug!(
                symbol = %self.symbol,
                realized_delta,
                remaining = self.quantity,
                closed,
                "position reduced"
            );
            return FillOutcome {
                realized_delta,
                reversed: false,
                closed,
            };
        }

        // Reversing: close the existing quantity, open the remainder on the
        // opposite side at the fill price.
        let realized_delta = sign * self.quantity * (fill.price - self.avg_entry_price) - fill.fee;
        self.realized_pnl += realized_delta;
        let remainder = fill.quantity - self.quantity;
        self.side = fill_side;
        self.quantity = remainder;
        self.avg_entry_price = fill.price;
        debug!(
            symbol = %self.symbol,
            realized_delta,
            new_side = %self.side,
            new_quantity = self.quantity,
            "position reversed"
        );
        FillOutcome {
            realized_delta,
            reversed: true,
            closed: false,
        }
    }

    /// Unrealized P&L against `mark`. Zero for flat positions.
    pub fn unrealized(&self, mark: f64) -> f64 {
        if self.side == PositionSide::Flat {
            return 0.0;
        }
        self.direction() * self.quantity * (mark - self.avg_entry_price)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fill(side: Side, quantity: f64, price: f64, fee: f64) -> Fill {
        Fill {
            order_id: 1,
            client_id: "ord".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            price,
            quantity,
            fee,
            fee_asset: "USDT".to_string(),
            exchange_trade_id: 0,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn open_partial_then_close_realizes_spread_minus_fees() {
        // BUY 2.0 via two 1.0 fills at 50000 (0.5 fee each), then SELL 2.0
        // at 50500 (1.0 fee): realized = 2*(50500-50000) - 2.0 = 998.
        let mut pos = Position::flat("primary", "BTCUSDT");

        let out = pos.apply_fill(&fill(Side::Buy, 1.0, 50_000.0, 0.5));
        assert!((out.realized_delta + 0.5).abs() < 1e-12);
        let out = pos.apply_fill(&fill(Side::Buy, 1.0, 50_000.0, 0.5));
        assert!((out.realized_delta + 0.5).abs() < 1e-12);

        assert_eq!(pos.side, PositionSide::Long);
        assert!((pos.quantity - 2.0).abs() < 1e-12);
        assert!((pos.avg_entry_price - 50_000.0).abs() < 1e-9);
        assert!((pos.realized_pnl + 1.0).abs() < 1e-9);

        let out = pos.apply_fill(&fill(Side::Sell, 2.0, 50_500.0, 1.0));
        assert!(out.closed);
        assert_eq!(pos.side, PositionSide::Flat);
        assert_eq!(pos.quantity, 0.0);
        assert!((out.realized_delta - 999.0).abs() < 1e-9);
        assert!((pos.realized_pnl - 998.0).abs() < 1e-9);
    }

    #[test]
    fn reversing_fill_flips_side_at_fill_price() {
        // LONG 1.0 @ 50000, SELL 1.5 @ 51000 fee 0:
        // realized += 1*(51000-50000) = 1000; SHORT 0.5 @ 51000.
        let mut pos = Position::flat("primary", "BTCUSDT");
        pos.apply_fill(&fill(Side::Buy, 1.0, 50_000.0, 0.0));

        let out = pos.apply_fill(&fill(Side::Sell, 1.5, 51_000.0, 0.0));
        assert!(out.reversed);
        assert!((out.realized_delta - 1_000.0).abs() < 1e-9);
        assert_eq!(pos.side, PositionSide::Short);
        assert!((pos.quantity - 0.5).abs() < 1e-12);
        assert!((pos.avg_entry_price - 51_000.0).abs() < 1e-9);
        assert!((pos.realized_pnl - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn adding_computes_weighted_average_entry() {
        let mut pos = Position::flat("primary", "BTCUSDT");
        pos.apply_fill(&fill(Side::Buy, 1.0, 50_000.0, 0.0));
        pos.apply_fill(&fill(Side::Buy, 3.0, 52_000.0, 0.0));

        assert!((pos.quantity - 4.0).abs() < 1e-12);
        assert!((pos.avg_entry_price - 51_500.0).abs() < 1e-9);
        assert_eq!(pos.realized_pnl, 0.0);
    }

    #[test]
    fn reducing_short_realizes_against_entry() {
        let mut pos = Position::flat("primary", "ETHUSDT");
        pos.apply_fill(&fill(Side::Sell, 2.0, 3_000.0, 0.0));
        assert_eq!(pos.side, PositionSide::Short);

        // Buy back half at a lower price: profit for a short.
        let out = pos.apply_fill(&fill(Side::Buy, 1.0, 2_900.0, 0.5));
        assert!((out.realized_delta - 99.5).abs() < 1e-9);
        assert_eq!(pos.side, PositionSide::Short);
        assert!((pos.quantity - 1.0).abs() < 1e-12);
        assert!((pos.avg_entry_price - 3_000.0).abs() < 1e-9);
    }

    #[test]
    fn flat_iff_zero_quantity() {
        let mut pos = Position::flat("primary", "BTCUSDT");
        assert_eq!(pos.side, PositionSide::Flat);
        assert_eq!(pos.quantity, 0.0);

        pos.apply_fill(&fill(Side::Buy, 1.0, 50_000.0, 0.0));
        assert_ne!(pos.side, PositionSide::Flat);

        pos.apply_fill(&fill(Side::Sell, 1.0, 50_100.0, 0.0));
        assert_eq!(pos.side, PositionSide::Flat);
        assert_eq!(pos.quantity, 0.0);
        assert_eq!(pos.avg_entry_price, 0.0);
    }

    #[test]
    fn unrealized_is_lazy_and_signed() {
        let mut pos = Position::flat("primary", "BTCUSDT");
        pos.apply_fill(&fill(Side::Buy, 2.0, 50_000.0, 0.0));
        assert!((pos.unrealized(50_100.0) - 200.0).abs() < 1e-9);
        assert!((pos.unrealized(49_900.0) + 200.0).abs() < 1e-9);

        let mut short = Position::flat("primary", "BTCUSDT");
        short.apply_fill(&fill(Side::Sell, 1.0, 50_000.0, 0.0));
        assert!((short.unrealized(49_000.0) - 1_000.0).abs() < 1e-9);

        let flat = Position::flat("primary", "BTCUSDT");
        assert_eq!(flat.unrealized(50_000.0), 0.0);
    }
}
