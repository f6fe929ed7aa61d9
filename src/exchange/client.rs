// =============================================================================
// Exchange REST client — HMAC-SHA256 signed requests with server-time sync
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every signed call
// carries a timestamp adjusted by the cached server-time offset minus a
// safety margin, plus a recvWindow tolerance. A "timestamp out of range"
// rejection triggers one re-sync and a single retry.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::error::ExchangeError;
use crate::exchange::rate_limit::RequestBudget;
use crate::health::{ComponentHealth, HealthRegistry, COMPONENT_EXCHANGE_REST};
use crate::settings::Settings;
use crate::types::{Balance, OrderType, Side, TimeInForce};

type HmacSha256 = Hmac<Sha256>;

/// Tolerance sent with every signed request (milliseconds).
const RECV_WINDOW_MS: u64 = 10_000;
/// Subtracted from the synced timestamp so a slightly fast local clock
/// never lands ahead of the exchange.
const TIME_SAFETY_MARGIN_MS: i64 = 1_500;

/// Acknowledgement returned by a successful order submission.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: u64,
    pub ack_timestamp_ms: i64,
}

/// Authoritative account state fetched over REST.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
    pub balances: Vec<Balance>,
    pub positions: Vec<ExchangePosition>,
}

/// One position row from the exchange account endpoint. `quantity` is
/// signed: positive long, negative short.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// Full-depth REST snapshot for one symbol.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Exchange-reported status of one order (timeout probe path).
#[derive(Debug, Clone)]
pub struct OrderStatusView {
    pub exchange_order_id: u64,
    pub status: String,
    pub executed_qty: f64,
    pub avg_price: f64,
}

/// REST API client with HMAC-SHA256 request signing.
pub struct ExchangeClient {
    secret: String,
    rest_url: String,
    http: reqwest::Client,
    /// Cached `server_time - local_time` in milliseconds.
    time_offset_ms: AtomicI64,
    /// Set when the exchange returns a geo/legal block; the WS path keeps
    /// running and downstream consumers tolerate missing snapshots.
    rest_blocked: AtomicBool,
    budget: RequestBudget,
    health: Arc<HealthRegistry>,
}

impl ExchangeClient {
    pub fn new(settings: &Settings, health: Arc<HealthRegistry>) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&settings.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(rest_url = %settings.rest_url, "ExchangeClient initialised");

        Self {
            secret: settings.api_secret.clone(),
            rest_url: settings.rest_url.clone(),
            http,
            time_offset_ms: AtomicI64::new(0),
            rest_blocked: AtomicBool::new(false),
            budget: RequestBudget::new(),
            health,
        }
    }

    // -------------------------------------------------------------------------
    // Signing & time sync
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_time_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Timestamp to embed in a signed request: local clock corrected by the
    /// cached offset, pulled back by the safety margin.
    fn signed_timestamp(&self) -> i64 {
        Self::local_time_ms() + self.time_offset_ms.load(Ordering::Relaxed)
            - TIME_SAFETY_MARGIN_MS
    }

    /// GET /fapi/v1/time and refresh the cached offset.
    #[instrument(skip(self), name = "exchange::sync_server_time")]
    pub async fn sync_server_time(&self) -> Result<(), ExchangeError> {
        let server = self.server_time().await?;
        let offset = server - Self::local_time_ms();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        info!(offset_ms = offset, "server time offset refreshed");
        Ok(())
    }

    /// GET /fapi/v1/time.
    pub async fn server_time(&self) -> Result<i64, ExchangeError> {
        let body = self.public_call("/fapi/v1/time", "", 1).await?;
        body["serverTime"]
            .as_i64()
            .ok_or_else(|| ExchangeError::Malformed("serverTime missing".into()))
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.signed_timestamp();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Whether REST is currently geo/legally blocked.
    pub fn is_rest_blocked(&self) -> bool {
        self.rest_blocked.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn public_call(
        &self,
        path: &str,
        params: &str,
        weight: u32,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.raw_call(Method::GET, path, params.to_string(), weight).await
    }

    /// Execute one signed call. A timestamp-skew rejection triggers a
    /// server-time re-sync and a single retry.
    async fn signed_call(
        &self,
        method: Method,
        path: &str,
        params: &str,
        weight: u32,
    ) -> Result<serde_json::Value, ExchangeError> {
        match self
            .raw_call(method.clone(), path, self.signed_query(params), weight)
            .await
        {
            Err(ExchangeError::TimestampSkew) => {
                warn!(path, "timestamp skew — re-syncing server time and retrying once");
                self.sync_server_time().await?;
                self.raw_call(method, path, self.signed_query(params), weight)
                    .await
            }
            other => other,
        }
    }

    async fn raw_call(
        &self,
        method: Method,
        path: &str,
        query: String,
        weight: u32,
    ) -> Result<serde_json::Value, ExchangeError> {
        if !self.budget.can_spend(weight) {
            return Err(ExchangeError::Transport(
                "local request-weight budget exhausted".into(),
            ));
        }

        let url = if query.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, query)
        };

        let resp = self.http.request(method, &url).send().await?;
        self.budget.update_from_headers(resp.headers());

        let status = resp.status();

        // Geo/legal block: REST degrades, WS keeps running.
        if status.as_u16() == 451 || status.as_u16() == 403 {
            self.rest_blocked.store(true, Ordering::Relaxed);
            self.health
                .set(COMPONENT_EXCHANGE_REST, ComponentHealth::Degraded);
            return Err(ExchangeError::RestBlocked {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;

        if !status.is_success() {
            let code = body["code"].as_i64().unwrap_or(status.as_u16() as i64);
            let message = body["msg"]
                .as_str()
                .unwrap_or("unknown exchange error")
                .to_string();
            let err = ExchangeError::from_api_code(code, message);
            if matches!(err, ExchangeError::Auth(_)) {
                self.health
                    .set(COMPONENT_EXCHANGE_REST, ComponentHealth::Unhealthy);
            }
            return Err(err);
        }

        self.rest_blocked.store(false, Ordering::Relaxed);
        self.health
            .set(COMPONENT_EXCHANGE_REST, ComponentHealth::Healthy);
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/account (signed) — authoritative balances + positions.
    #[instrument(skip(self), name = "exchange::fetch_account")]
    pub async fn fetch_account(&self) -> Result<AccountSnapshot, ExchangeError> {
        let body = self
            .signed_call(Method::GET, "/fapi/v2/account", "", 5)
            .await?;

        let total_wallet_balance = parse_str_f64(&body["totalWalletBalance"]).unwrap_or(0.0);
        let available_balance = parse_str_f64(&body["availableBalance"]).unwrap_or(0.0);

        let mut balances = Vec::new();
        if let Some(assets) = body["assets"].as_array() {
            for a in assets {
                let asset = a["asset"].as_str().unwrap_or("").to_string();
                let wallet = parse_str_f64(&a["walletBalance"]).unwrap_or(0.0);
                let free = parse_str_f64(&a["availableBalance"]).unwrap_or(0.0);
                if wallet != 0.0 || free != 0.0 {
                    balances.push(Balance {
                        asset,
                        free,
                        locked: (wallet - free).max(0.0),
                    });
                }
            }
        }

        let mut positions = Vec::new();
        if let Some(raw) = body["positions"].as_array() {
            for p in raw {
                let quantity = parse_str_f64(&p["positionAmt"]).unwrap_or(0.0);
                if quantity == 0.0 {
                    continue;
                }
                positions.push(ExchangePosition {
                    symbol: p["symbol"].as_str().unwrap_or("").to_string(),
                    quantity,
                    entry_price: parse_str_f64(&p["entryPrice"]).unwrap_or(0.0),
                    unrealized_pnl: parse_str_f64(&p["unrealizedProfit"]).unwrap_or(0.0),
                });
            }
        }

        debug!(
            balances = balances.len(),
            positions = positions.len(),
            "account snapshot fetched"
        );

        Ok(AccountSnapshot {
            total_wallet_balance,
            available_balance,
            balances,
            positions,
        })
    }

    /// GET /fapi/v2/balance (signed).
    #[instrument(skip(self), name = "exchange::fetch_balances")]
    pub async fn fetch_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let body = self
            .signed_call(Method::GET, "/fapi/v2/balance", "", 5)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("balance response is not an array".into()))?;

        let mut balances = Vec::with_capacity(rows.len());
        for row in rows {
            let wallet = parse_str_f64(&row["balance"]).unwrap_or(0.0);
            let free = parse_str_f64(&row["availableBalance"]).unwrap_or(0.0);
            balances.push(Balance {
                asset: row["asset"].as_str().unwrap_or("").to_string(),
                free,
                locked: (wallet - free).max(0.0),
            });
        }
        Ok(balances)
    }

    /// GET /fapi/v2/positionRisk (signed).
    #[instrument(skip(self), name = "exchange::fetch_position_risk")]
    pub async fn fetch_position_risk(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let body = self
            .signed_call(Method::GET, "/fapi/v2/positionRisk", "", 5)
            .await?;
        let rows = body.as_array().ok_or_else(|| {
            ExchangeError::Malformed("positionRisk response is not an array".into())
        })?;

        Ok(rows
            .iter()
            .filter_map(|p| {
                let quantity = parse_str_f64(&p["positionAmt"])?;
                if quantity == 0.0 {
                    return None;
                }
                Some(ExchangePosition {
                    symbol: p["symbol"].as_str()?.to_string(),
                    quantity,
                    entry_price: parse_str_f64(&p["entryPrice"]).unwrap_or(0.0),
                    unrealized_pnl: parse_str_f64(&p["unRealizedProfit"]).unwrap_or(0.0),
                })
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — submit a new order. `client_id` rides
    /// as `newClientOrderId` so the exchange enforces idempotency too.
    #[instrument(skip(self, price), name = "exchange::submit_order")]
    pub async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        time_in_force: TimeInForce,
        client_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        if !self.budget.can_place_order() {
            return Err(ExchangeError::Transport("order-rate cap reached".into()));
        }

        let mut params = format!(
            "symbol={symbol}&side={side}&type={order_type}&quantity={quantity}&newClientOrderId={client_id}"
        );
        match order_type {
            OrderType::Limit => {
                let p = price.ok_or_else(|| {
                    ExchangeError::Malformed("limit order without price".into())
                })?;
                params.push_str(&format!("&price={p}&timeInForce={time_in_force}"));
            }
            OrderType::Stop => {
                let p = price.ok_or_else(|| {
                    ExchangeError::Malformed("stop order without trigger price".into())
                })?;
                params.push_str(&format!("&stopPrice={p}"));
            }
            OrderType::Market => {}
        }

        self.budget.record_order_sent();
        let body = self
            .signed_call(Method::POST, "/fapi/v1/order", &params, 1)
            .await?;

        let exchange_order_id = body["orderId"]
            .as_u64()
            .ok_or_else(|| ExchangeError::Malformed("orderId missing from ack".into()))?;
        let ack_timestamp_ms = body["updateTime"]
            .as_i64()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        debug!(symbol, %side, exchange_order_id, "order submitted");
        Ok(OrderAck {
            exchange_order_id,
            ack_timestamp_ms,
        })
    }

    /// DELETE /fapi/v1/order (signed).
    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: u64,
    ) -> Result<(), ExchangeError> {
        let params = format!("symbol={symbol}&orderId={exchange_order_id}");
        self.signed_call(Method::DELETE, "/fapi/v1/order", &params, 1)
            .await?;
        debug!(symbol, exchange_order_id, "order cancelled");
        Ok(())
    }

    /// GET /fapi/v1/order (signed) by client id. `Ok(None)` means the
    /// exchange has no record of the order.
    #[instrument(skip(self), name = "exchange::query_order")]
    pub async fn query_order(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> Result<Option<OrderStatusView>, ExchangeError> {
        let params = format!("symbol={symbol}&origClientOrderId={client_id}");
        match self
            .signed_call(Method::GET, "/fapi/v1/order", &params, 1)
            .await
        {
            Ok(body) => Ok(Some(OrderStatusView {
                exchange_order_id: body["orderId"].as_u64().unwrap_or(0),
                status: body["status"].as_str().unwrap_or("").to_string(),
                executed_qty: parse_str_f64(&body["executedQty"]).unwrap_or(0.0),
                avg_price: parse_str_f64(&body["avgPrice"]).unwrap_or(0.0),
            })),
            // -2013: order does not exist.
            Err(ExchangeError::Api { code: -2013, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/depth (public) — full snapshot used to seed a book when
    /// REST is reachable. Books also self-baseline from the stream, so a
    /// failure here only delays convergence.
    #[instrument(skip(self), name = "exchange::fetch_snapshot")]
    pub async fn fetch_snapshot(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<DepthSnapshot, ExchangeError> {
        let params = format!("symbol={symbol}&limit={limit}");
        let body = self.public_call("/fapi/v1/depth", &params, 5).await?;

        let last_update_id = body["lastUpdateId"]
            .as_u64()
            .ok_or_else(|| ExchangeError::Malformed("lastUpdateId missing".into()))?;

        Ok(DepthSnapshot {
            symbol: symbol.to_string(),
            last_update_id,
            bids: parse_levels(&body["bids"])?,
            asks: parse_levels(&body["asks"])?,
        })
    }

    // -------------------------------------------------------------------------
    // User-data stream keys
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/listenKey — open a user-data stream.
    pub async fn start_listen_key(&self) -> Result<String, ExchangeError> {
        let body = self
            .raw_call(Method::POST, "/fapi/v1/listenKey", String::new(), 1)
            .await?;
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Malformed("listenKey missing".into()))
    }

    /// PUT /fapi/v1/listenKey — keep the user-data stream alive.
    pub async fn keepalive_listen_key(&self) -> Result<(), ExchangeError> {
        self.raw_call(Method::PUT, "/fapi/v1/listenKey", String::new(), 1)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("secret", &"<redacted>")
            .field("rest_url", &self.rest_url)
            .field("rest_blocked", &self.is_rest_blocked())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse().ok()
    } else {
        val.as_f64()
    }
}

fn parse_levels(val: &serde_json::Value) -> Result<Vec<(Decimal, Decimal)>, ExchangeError> {
    let rows = val
        .as_array()
        .ok_or_else(|| ExchangeError::Malformed("depth side is not an array".into()))?;

    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let price = row
            .get(0)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::Malformed("bad level price".into()))?;
        let qty = row
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::Malformed("bad level quantity".into()))?;
        levels.push((price, qty));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_numeric_values() {
        assert_eq!(parse_str_f64(&serde_json::json!("50000.5")), Some(50000.5));
        assert_eq!(parse_str_f64(&serde_json::json!(42.0)), Some(42.0));
        assert_eq!(parse_str_f64(&serde_json::json!(null)), None);
    }

    #[test]
    fn parses_depth_levels() {
        let raw = serde_json::json!([["50000.00", "1.5"], ["49999.50", "0.2"]]);
        let levels = parse_levels(&raw).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].0.to_string(), "50000.00");
        assert_eq!(levels[1].1.to_string(), "0.2");
    }

    #[test]
    fn rejects_malformed_levels() {
        let raw = serde_json::json!([["not-a-price", "1.5"]]);
        assert!(parse_levels(&raw).is_err());
    }
}
