// =============================================================================
// Order State Machine — lifecycle tracking against exchange acknowledgements
// =============================================================================
//
// Life-cycle:
//   NEW -> SUBMITTED -> { PARTIALLY_FILLED } -> FILLED
//   NEW/SUBMITTED/PARTIALLY_FILLED -> CANCELLED | REJECTED
//
// `client_id` is the idempotency key: creating an order with a known
// client_id returns the existing record and never reaches the exchange
// again. Fills deduplicate on `exchange_trade_id` through a processed-id
// ledger, so redelivered exchange events have no observable effect.
//
// Thread-safety: every transition runs inside one write-lock critical
// section, which serializes transitions per order.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::exchange::user_stream::OrderUpdateEvent;
use crate::types::{Fill, OrderState, OrderType, Side, TimeInForce};

/// Inbound order submission, as received on `orders.requests.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderRequest {
    /// Caller-provided idempotency key; generated when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    pub quantity: f64,
    #[serde(default)]
    pub time_in_force: TimeInForce,
}

impl NewOrderRequest {
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.symbol.is_empty() {
            return Err(OrderError::Validation("symbol is empty".into()));
        }
        if self.quantity <= 0.0 {
            return Err(OrderError::Validation("quantity must be positive".into()));
        }
        match self.order_type {
            OrderType::Limit | OrderType::Stop => {
                if self.price.map(|p| p <= 0.0).unwrap_or(true) {
                    return Err(OrderError::Validation(format!(
                        "{} order requires a positive price",
                        self.order_type
                    )));
                }
            }
            OrderType::Market => {}
        }
        Ok(())
    }
}

/// A tracked order: immutable input fields plus mutable lifecycle fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    pub quantity: f64,
    pub time_in_force: TimeInForce,
    pub state: OrderState,
    #[serde(default)]
    pub exchange_order_id: Option<u64>,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(default)]
    pub avg_fill_price: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Milliseconds since the UNIX epoch.
    pub created_at_ms: i64,
    #[serde(default)]
    pub submitted_at_ms: Option<i64>,
    #[serde(default)]
    pub terminal_at_ms: Option<i64>,
}

/// Result of creating an order.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(OrderRecord),
    /// Idempotent resubmission: the original order, unchanged.
    Existing(OrderRecord),
}

/// Result of applying an exchange event.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied {
        record: OrderRecord,
        fill: Option<Fill>,
    },
    /// Already-seen trade id or no-op status: dropped after the state was
    /// first applied.
    Duplicate,
    /// Event arrived for an order in a terminal state.
    IgnoredTerminal,
    /// No local record matches the event.
    UnknownOrder,
}

/// Owns every order. Terminal orders are kept for history.
pub struct OrderStore {
    orders: RwLock<HashMap<String, OrderRecord>>,
    by_exchange_id: RwLock<HashMap<u64, String>>,
    /// Ledger of processed exchange trade ids (at-most-once fill effect).
    processed_trades: RwLock<HashSet<u64>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            by_exchange_id: RwLock::new(HashMap::new()),
            processed_trades: RwLock::new(HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Create a NEW order, or return the existing one when the client_id is
    /// already known (idempotent resubmission).
    pub fn create(&self, req: &NewOrderRequest) -> CreateOutcome {
        let client_id = req
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut orders = self.orders.write();
        if let Some(existing) = orders.get(&client_id) {
            debug!(client_id = %client_id, state = %existing.state, "duplicate client_id — returning existing order");
            return CreateOutcome::Existing(existing.clone());
        }

        let record = OrderRecord {
            client_id: client_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            price: req.price,
            quantity: req.quantity,
            time_in_force: req.time_in_force,
            state: OrderState::New,
            exchange_order_id: None,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            last_error: None,
            created_at_ms: Utc::now().timestamp_millis(),
            submitted_at_ms: None,
            terminal_at_ms: None,
        };

        info!(
            client_id = %client_id,
            symbol = %record.symbol,
            side = %record.side,
            order_type = %record.order_type,
            quantity = record.quantity,
            "order created"
        );

        orders.insert(client_id, record.clone());
        CreateOutcome::Created(record)
    }

    // -------------------------------------------------------------------------
    // Local transitions
    // -------------------------------------------------------------------------

    /// NEW -> SUBMITTED after a successful REST acknowledgement.
    pub fn mark_submitted(
        &self,
        client_id: &str,
        exchange_order_id: u64,
        ack_timestamp_ms: i64,
    ) -> Option<OrderRecord> {
        let mut orders = self.orders.write();
        let record = orders.get_mut(client_id)?;
        if record.state.is_terminal() {
            return Some(record.clone());
        }
        if record.state == OrderState::New {
            record.state = OrderState::Submitted;
        }
        record.exchange_order_id = Some(exchange_order_id);
        record.submitted_at_ms = Some(ack_timestamp_ms);
        self.by_exchange_id
            .write()
            .insert(exchange_order_id, client_id.to_string());

        info!(client_id, exchange_order_id, "order submitted");
        Some(record.clone())
    }

    /// Terminal rejection (submit failure or timeout probe miss).
    pub fn mark_rejected(&self, client_id: &str, reason: &str) -> Option<OrderRecord> {
        let mut orders = self.orders.write();
        let record = orders.get_mut(client_id)?;
        if record.state.is_terminal() {
            return Some(record.clone());
        }
        record.state = OrderState::Rejected;
        record.last_error = Some(reason.to_string());
        record.terminal_at_ms = Some(Utc::now().timestamp_millis());

        warn!(client_id, reason, "order rejected");
        Some(record.clone())
    }

    // -------------------------------------------------------------------------
    // Exchange events
    // -------------------------------------------------------------------------

    /// Apply one lifecycle event from the exchange. Events are keyed by
    /// `(exchange_order_id, exchange_trade_id)`; duplicates are dropped.
    pub fn apply_exchange_update(&self, ev: &OrderUpdateEvent) -> TransitionOutcome {
        let mut orders = self.orders.write();

        // Resolve the local record: by client id, else by exchange id.
        let client_id = if orders.contains_key(&ev.client_id) {
            ev.client_id.clone()
        } else {
            match self.by_exchange_id.read().get(&ev.exchange_order_id) {
                Some(id) => id.clone(),
                None => {
                    warn!(
                        client_id = %ev.client_id,
                        exchange_order_id = ev.exchange_order_id,
                        "event for unknown order"
                    );
                    return TransitionOutcome::UnknownOrder;
                }
            }
        };

        let record = match orders.get_mut(&client_id) {
            Some(r) => r,
            None => return TransitionOutcome::UnknownOrder,
        };

        if record.state.is_terminal() {
            debug!(client_id = %client_id, status = %ev.status, "event after terminal state ignored");
            return TransitionOutcome::IgnoredTerminal;
        }

        // A stream ack can land before the REST response; register the
        // exchange id either way.
        if record.exchange_order_id.is_none() {
            record.exchange_order_id = Some(ev.exchange_order_id);
            self.by_exchange_id
                .write()
                .insert(ev.exchange_order_id, client_id.clone());
        }

        match ev.status.as_str() {
            "NEW" => {
                if record.state == OrderState::New {
                    record.state = OrderState::Submitted;
                    record.submitted_at_ms = Some(ev.timestamp_ms);
                    TransitionOutcome::Applied {
                        record: record.clone(),
                        fill: None,
                    }
                } else {
                    TransitionOutcome::Duplicate
                }
            }
            "PARTIALLY_FILLED" | "FILLED" => {
                if ev.exchange_trade_id != 0 {
                    let mut seen = self.processed_trades.write();
                    if !seen.insert(ev.exchange_trade_id) {
                        debug!(
                            client_id = %client_id,
                            exchange_trade_id = ev.exchange_trade_id,
                            "duplicate fill dropped"
                        );
                        return TransitionOutcome::Duplicate;
                    }
                }

                // Exchange cumulative figures are authoritative; fall back
                // to a local weighted average when avg price is absent.
                record.filled_qty = ev.cumulative_qty.max(record.filled_qty);
                record.avg_fill_price = if ev.avg_price > 0.0 {
                    ev.avg_price
                } else if record.filled_qty > 0.0 {
                    let prior = record.avg_fill_price * (record.filled_qty - ev.last_fill_qty);
                    (prior + ev.last_fill_price * ev.last_fill_qty) / record.filled_qty
                } else {
                    0.0
                };

                let terminal = ev.status == "FILLED";
                record.state = if terminal {
                    record.terminal_at_ms = Some(ev.timestamp_ms);
                    OrderState::Filled
                } else {
                    OrderState::PartiallyFilled
                };

                let fill = (ev.last_fill_qty > 0.0).then(|| Fill {
                    order_id: ev.exchange_order_id,
                    client_id: client_id.clone(),
                    symbol: ev.symbol.clone(),
                    side: ev.side,
                    price: ev.last_fill_price,
                    quantity: ev.last_fill_qty,
                    fee: ev.fee,
                    fee_asset: ev.fee_asset.clone(),
                    exchange_trade_id: ev.exchange_trade_id,
                    timestamp_ms: ev.timestamp_ms,
                });

                info!(
                    client_id = %client_id,
                    state = %record.state,
                    filled_qty = record.filled_qty,
                    avg_fill_price = record.avg_fill_price,
                    "fill applied"
                );

                TransitionOutcome::Applied {
                    record: record.clone(),
                    fill,
                }
            }
            "CANCELED" | "EXPIRED" => {
                record.state = OrderState::Cancelled;
                record.terminal_at_ms = Some(ev.timestamp_ms);
                info!(client_id = %client_id, "order cancelled");
                TransitionOutcome::Applied {
                    record: record.clone(),
                    fill: None,
                }
            }
            "REJECTED" => {
                record.state = OrderState::Rejected;
                record.last_error = Some("rejected by exchange".into());
                record.terminal_at_ms = Some(ev.timestamp_ms);
                warn!(client_id = %client_id, "order rejected by exchange");
                TransitionOutcome::Applied {
                    record: record.clone(),
                    fill: None,
                }
            }
            other => {
                debug!(client_id = %client_id, status = other, "unhandled order status");
                TransitionOutcome::Duplicate
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, client_id: &str) -> Option<OrderRecord> {
        self.orders.read().get(client_id).cloned()
    }

    pub fn open_orders(&self) -> Vec<OrderRecord> {
        self.orders
            .read()
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect()
    }

    /// NEW orders with no acknowledgement for longer than `window_ms`
    /// (timeout-probe candidates).
    pub fn stuck_new_orders(&self, window_ms: i64, now_ms: i64) -> Vec<OrderRecord> {
        self.orders
            .read()
            .values()
            .filter(|r| r.state == OrderState::New && now_ms - r.created_at_ms > window_ms)
            .cloned()
            .collect()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStore")
            .field("orders", &self.orders.read().len())
            .field("processed_trades", &self.processed_trades.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn request(client_id: &str) -> NewOrderRequest {
        NewOrderRequest {
            client_id: Some(client_id.to_string()),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(50_000.0),
            quantity: 2.0,
            time_in_force: TimeInForce::Gtc,
        }
    }

    fn fill_event(
        client_id: &str,
        status: &str,
        last_qty: f64,
        last_price: f64,
        cum_qty: f64,
        avg: f64,
        trade_id: u64,
    ) -> OrderUpdateEvent {
        OrderUpdateEvent {
            symbol: "BTCUSDT".to_string(),
            client_id: client_id.to_string(),
            exchange_order_id: 9001,
            side: Side::Buy,
            status: status.to_string(),
            last_fill_qty: last_qty,
            last_fill_price: last_price,
            cumulative_qty: cum_qty,
            avg_price: avg,
            fee: 0.5,
            fee_asset: "USDT".to_string(),
            exchange_trade_id: trade_id,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn duplicate_client_id_returns_existing_order() {
        let store = OrderStore::new();
        let first = match store.create(&request("X")) {
            CreateOutcome::Created(r) => r,
            other => panic!("expected Created, got {other:?}"),
        };
        store.mark_submitted("X", 9001, 1);

        // Resubmission before terminal: same order back, no new record.
        match store.create(&request("X")) {
            CreateOutcome::Existing(r) => {
                assert_eq!(r.client_id, first.client_id);
                assert_eq!(r.state, OrderState::Submitted);
            }
            other => panic!("expected Existing, got {other:?}"),
        }
    }

    #[test]
    fn partial_then_full_fill_reaches_terminal_once() {
        let store = OrderStore::new();
        store.create(&request("X"));
        store.mark_submitted("X", 9001, 1);

        let outcome = store.apply_exchange_update(&fill_event(
            "X",
            "PARTIALLY_FILLED",
            1.0,
            50_000.0,
            1.0,
            50_000.0,
            101,
        ));
        match outcome {
            TransitionOutcome::Applied { record, fill } => {
                assert_eq!(record.state, OrderState::PartiallyFilled);
                assert!((record.filled_qty - 1.0).abs() < 1e-12);
                let fill = fill.expect("partial fill emits a Fill");
                assert_eq!(fill.exchange_trade_id, 101);
            }
            other => panic!("expected Applied, got {other:?}"),
        }

        let outcome = store.apply_exchange_update(&fill_event(
            "X",
            "FILLED",
            1.0,
            50_000.0,
            2.0,
            50_000.0,
            102,
        ));
        match outcome {
            TransitionOutcome::Applied { record, fill } => {
                assert_eq!(record.state, OrderState::Filled);
                assert!((record.filled_qty - 2.0).abs() < 1e-12);
                assert!((record.avg_fill_price - 50_000.0).abs() < 1e-9);
                assert!(record.terminal_at_ms.is_some());
                assert!(fill.is_some());
            }
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn redelivered_fill_is_dropped() {
        let store = OrderStore::new();
        store.create(&request("X"));
        store.mark_submitted("X", 9001, 1);

        let ev = fill_event("X", "PARTIALLY_FILLED", 1.0, 50_000.0, 1.0, 50_000.0, 101);
        assert!(matches!(
            store.apply_exchange_update(&ev),
            TransitionOutcome::Applied { .. }
        ));
        // Same exchange_trade_id again: no observable effect.
        assert!(matches!(
            store.apply_exchange_update(&ev),
            TransitionOutcome::Duplicate
        ));
        let record = store.get("X").unwrap();
        assert!((record.filled_qty - 1.0).abs() < 1e-12);
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let store = OrderStore::new();
        store.create(&request("X"));
        store.mark_submitted("X", 9001, 1);
        store.apply_exchange_update(&fill_event("X", "FILLED", 2.0, 50_000.0, 2.0, 50_000.0, 101));

        let late = fill_event("X", "PARTIALLY_FILLED", 0.5, 49_000.0, 2.5, 49_800.0, 102);
        assert!(matches!(
            store.apply_exchange_update(&late),
            TransitionOutcome::IgnoredTerminal
        ));
        let record = store.get("X").unwrap();
        assert_eq!(record.state, OrderState::Filled);
        assert!((record.filled_qty - 2.0).abs() < 1e-12);
    }

    #[test]
    fn cancel_ack_is_terminal() {
        let store = OrderStore::new();
        store.create(&request("X"));
        store.mark_submitted("X", 9001, 1);

        let mut ev = fill_event("X", "CANCELED", 0.0, 0.0, 0.0, 0.0, 0);
        ev.exchange_trade_id = 0;
        match store.apply_exchange_update(&ev) {
            TransitionOutcome::Applied { record, fill } => {
                assert_eq!(record.state, OrderState::Cancelled);
                assert!(fill.is_none());
            }
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn rejection_records_reason() {
        let store = OrderStore::new();
        store.create(&request("X"));
        let record = store.mark_rejected("X", "insufficient balance").unwrap();
        assert_eq!(record.state, OrderState::Rejected);
        assert_eq!(record.last_error.as_deref(), Some("insufficient balance"));
        // Idempotent: rejecting again changes nothing.
        let again = store.mark_rejected("X", "other").unwrap();
        assert_eq!(again.last_error.as_deref(), Some("insufficient balance"));
    }

    #[test]
    fn event_resolved_by_exchange_id_when_client_id_differs() {
        let store = OrderStore::new();
        store.create(&request("X"));
        store.mark_submitted("X", 9001, 1);

        let mut ev = fill_event("ignored", "FILLED", 2.0, 50_000.0, 2.0, 50_000.0, 103);
        ev.client_id = "something-else".to_string();
        assert!(matches!(
            store.apply_exchange_update(&ev),
            TransitionOutcome::Applied { .. }
        ));
    }

    #[test]
    fn stuck_new_orders_filters_by_age() {
        let store = OrderStore::new();
        store.create(&request("X"));
        let now = Utc::now().timestamp_millis();
        assert!(store.stuck_new_orders(60_000, now).is_empty());
        assert_eq!(store.stuck_new_orders(0, now + 1_000).len(), 1);

        store.mark_submitted("X", 9001, 1);
        assert!(store.stuck_new_orders(0, now + 1_000).is_empty());
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let mut req = request("X");
        req.quantity = 0.0;
        assert!(req.validate().is_err());

        let mut req = request("X");
        req.price = None;
        assert!(req.validate().is_err());

        let mut req = request("X");
        req.order_type = OrderType::Market;
        req.price = None;
        assert!(req.validate().is_ok());
    }
}
