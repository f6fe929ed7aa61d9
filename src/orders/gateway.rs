// =============================================================================
// Order Gateway — submission, retry, probe, and event fan-out
// =============================================================================
//
// Submissions retry retryable adapter failures with capped backoff and
// reject on anything terminal. Every state transition is published on
// `orders.updates.{SYM}`; every fill on `orders.fills.{SYM}`. NEW orders
// with no acknowledgement inside the ack window are probed against the
// exchange and rejected when unknown there.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{self, Bus};
use crate::cache::{self, Cache, ORDER_TTL_SECS};
use crate::error::OrderError;
use crate::exchange::client::ExchangeClient;
use crate::exchange::user_stream::OrderUpdateEvent;
use crate::orders::state_machine::{
    CreateOutcome, NewOrderRequest, OrderRecord, OrderStore, TransitionOutcome,
};
use crate::types::{Fill, OrderState};

/// Maximum submit attempts before the order is rejected locally.
const MAX_SUBMIT_ATTEMPTS: u32 = 4;
/// Initial delay between submit retries (doubles per attempt).
const SUBMIT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
/// NEW orders older than this are probed against the exchange.
const NEW_ACK_WINDOW_MS: i64 = 10_000;
/// Probe cadence.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Payload accepted on `orders.requests.cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub client_id: String,
}

/// Payload published on `orders.updates.{SYM}` for every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdatePayload {
    #[serde(default)]
    pub order_id: Option<u64>,
    pub client_id: String,
    pub state: OrderState,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&OrderRecord> for OrderUpdatePayload {
    fn from(record: &OrderRecord) -> Self {
        Self {
            order_id: record.exchange_order_id,
            client_id: record.client_id.clone(),
            state: record.state,
            filled_qty: record.filled_qty,
            avg_fill_price: record.avg_fill_price,
            error: record.last_error.clone(),
        }
    }
}

/// Ties the exchange client, the order store, and the bus together.
pub struct OrderGateway {
    client: Arc<ExchangeClient>,
    store: Arc<OrderStore>,
    bus: Arc<Bus>,
    cache: Arc<Cache>,
}

impl OrderGateway {
    pub fn new(
        client: Arc<ExchangeClient>,
        store: Arc<OrderStore>,
        bus: Arc<Bus>,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            client,
            store,
            bus,
            cache,
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit an order. A duplicate `client_id` returns the original order
    /// without touching the exchange. Terminal submit failures reject the
    /// order locally; the returned record carries the final state.
    pub async fn submit(&self, req: NewOrderRequest) -> Result<OrderRecord, OrderError> {
        req.validate()?;

        let record = match self.store.create(&req) {
            CreateOutcome::Existing(existing) => return Ok(existing),
            CreateOutcome::Created(record) => record,
        };
        self.publish_record(&record).await;

        let mut backoff = SUBMIT_BACKOFF_INITIAL;
        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            match self
                .client
                .submit_order(
                    &record.symbol,
                    record.side,
                    record.order_type,
                    record.quantity,
                    record.price,
                    record.time_in_force,
                    &record.client_id,
                )
                .await
            {
                Ok(ack) => {
                    let updated = self
                        .store
                        .mark_submitted(&record.client_id, ack.exchange_order_id, ack.ack_timestamp_ms)
                        .unwrap_or(record);
                    self.publish_record(&updated).await;
                    return Ok(updated);
                }
                Err(e) if e.is_retryable() && attempt < MAX_SUBMIT_ATTEMPTS => {
                    warn!(
                        client_id = %record.client_id,
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "submit failed — retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    let rejected = self
                        .store
                        .mark_rejected(&record.client_id, &e.to_string())
                        .unwrap_or(record);
                    self.publish_record(&rejected).await;
                    return Ok(rejected);
                }
            }
        }

        // Attempt cap exhausted without a terminal error.
        let rejected = self
            .store
            .mark_rejected(&record.client_id, "submit retries exhausted")
            .unwrap_or(record);
        self.publish_record(&rejected).await;
        Ok(rejected)
    }

    /// Request cancellation. The terminal CANCELLED transition arrives via
    /// the user stream, not here.
    pub async fn cancel(&self, client_id: &str) -> Result<(), OrderError> {
        let record = self
            .store
            .get(client_id)
            .ok_or_else(|| OrderError::UnknownOrder(client_id.to_string()))?;

        if record.state.is_terminal() {
            return Err(OrderError::Terminal {
                client_id: client_id.to_string(),
                state: record.state.to_string(),
            });
        }

        let exchange_order_id = record.exchange_order_id.ok_or(OrderError::NotSubmitted)?;
        self.client
            .cancel_order(&record.symbol, exchange_order_id)
            .await?;
        Ok(())
    }

    pub fn get(&self, client_id: &str) -> Option<OrderRecord> {
        self.store.get(client_id)
    }

    // -------------------------------------------------------------------------
    // Exchange events
    // -------------------------------------------------------------------------

    /// Apply one user-stream order event and fan out the result.
    pub async fn handle_event(&self, ev: &OrderUpdateEvent) {
        match self.store.apply_exchange_update(ev) {
            TransitionOutcome::Applied { record, fill } => {
                self.publish_record(&record).await;
                if let Some(fill) = fill {
                    self.publish_fill(&fill).await;
                }
            }
            TransitionOutcome::Duplicate => {
                debug!(client_id = %ev.client_id, "duplicate exchange event dropped");
            }
            TransitionOutcome::IgnoredTerminal => {
                debug!(client_id = %ev.client_id, "event after terminal state ignored");
            }
            TransitionOutcome::UnknownOrder => {
                warn!(
                    client_id = %ev.client_id,
                    exchange_order_id = ev.exchange_order_id,
                    "exchange event for untracked order"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Timeout probe
    // -------------------------------------------------------------------------

    /// Probe NEW orders older than the ack window. Orders unknown at the
    /// exchange are treated as never submitted and rejected. SUBMITTED
    /// orders are left alone regardless of age: only an explicit cancel or
    /// an exchange event moves them.
    pub async fn probe_stuck_orders(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        for record in self.store.stuck_new_orders(NEW_ACK_WINDOW_MS, now_ms) {
            match self
                .client
                .query_order(&record.symbol, &record.client_id)
                .await
            {
                Ok(None) => {
                    info!(
                        client_id = %record.client_id,
                        "no exchange record inside ack window — rejecting"
                    );
                    if let Some(rejected) = self
                        .store
                        .mark_rejected(&record.client_id, "no acknowledgement within ack window")
                    {
                        self.publish_record(&rejected).await;
                    }
                }
                Ok(Some(view)) => {
                    // The submit response was lost but the order is live.
                    info!(
                        client_id = %record.client_id,
                        exchange_order_id = view.exchange_order_id,
                        status = %view.status,
                        "probe recovered a live order"
                    );
                    if let Some(updated) = self.store.mark_submitted(
                        &record.client_id,
                        view.exchange_order_id,
                        now_ms,
                    ) {
                        self.publish_record(&updated).await;
                    }
                }
                Err(e) => {
                    warn!(client_id = %record.client_id, error = %e, "order probe failed — skipping");
                }
            }
        }
    }

    /// Named periodic task: probe loop tied to service shutdown.
    pub async fn run_probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => self.probe_stuck_orders().await,
                _ = shutdown.changed() => return,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bus request consumers
    // -------------------------------------------------------------------------

    /// Consume `orders.requests.cancel` requests from the bus.
    pub async fn run_cancel_consumer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sub = match self
            .bus
            .subscribe(bus::ORDER_CANCEL_SUBJECT.to_string())
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "cancel request subscription failed");
                return;
            }
        };
        info!(subject = bus::ORDER_CANCEL_SUBJECT, "cancel request consumer started");

        loop {
            let msg = tokio::select! {
                msg = sub.next() => match msg {
                    Some(m) => m,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            let req: CancelRequest = match serde_json::from_slice(&msg.payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "undecodable cancel request dropped");
                    continue;
                }
            };

            if let Err(e) = self.cancel(&req.client_id).await {
                warn!(client_id = %req.client_id, error = %e, "cancel request failed");
            }
        }
    }

    /// Consume `orders.requests.create` submissions from the bus.
    pub async fn run_request_consumer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sub = match self
            .bus
            .subscribe(bus::ORDER_REQUESTS_SUBJECT.to_string())
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "order request subscription failed");
                return;
            }
        };
        info!(subject = bus::ORDER_REQUESTS_SUBJECT, "order request consumer started");

        loop {
            let msg = tokio::select! {
                msg = sub.next() => match msg {
                    Some(m) => m,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            let req: NewOrderRequest = match serde_json::from_slice(&msg.payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "undecodable order request dropped");
                    continue;
                }
            };

            match self.submit(req).await {
                Ok(record) => {
                    debug!(client_id = %record.client_id, state = %record.state, "bus order processed");
                }
                Err(e) => warn!(error = %e, "bus order rejected"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    async fn publish_record(&self, record: &OrderRecord) {
        let payload = OrderUpdatePayload::from(record);
        self.bus
            .publish_json(bus::order_updates_subject(&record.symbol), &payload)
            .await;
        self.cache
            .put_json(
                &cache::order_key(&record.client_id),
                record,
                Some(ORDER_TTL_SECS),
            )
            .await;
    }

    async fn publish_fill(&self, fill: &Fill) {
        self.bus
            .publish_json(bus::order_fills_subject(&fill.symbol), fill)
            .await;
    }
}

impl std::fmt::Debug for OrderGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderGateway")
            .field("store", &self.store)
            .finish()
    }
}
