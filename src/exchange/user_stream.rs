// =============================================================================
// User-data WebSocket session — order lifecycle and account events
// =============================================================================
//
// Listen-key flow: POST to open, keep-alive PUT every 30 minutes, reconnect
// with the same backoff policy as the market stream. Order events feed the
// order state machine; account events feed the account monitor.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::exchange::client::{ExchangeClient, ExchangePosition};
use crate::types::{Balance, Side};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Exchange expires idle listen keys after 60 minutes; refresh at half.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// One order lifecycle event from the exchange.
#[derive(Debug, Clone)]
pub struct OrderUpdateEvent {
    pub symbol: String,
    pub client_id: String,
    pub exchange_order_id: u64,
    pub side: Side,
    /// Exchange order status string (NEW, PARTIALLY_FILLED, FILLED,
    /// CANCELED, REJECTED, EXPIRED).
    pub status: String,
    pub last_fill_qty: f64,
    pub last_fill_price: f64,
    pub cumulative_qty: f64,
    pub avg_price: f64,
    pub fee: f64,
    pub fee_asset: String,
    /// Zero when the event carries no execution.
    pub exchange_trade_id: u64,
    pub timestamp_ms: i64,
}

/// Decoded event from the user-data stream.
#[derive(Debug, Clone)]
pub enum AccountEvent {
    OrderUpdate(OrderUpdateEvent),
    BalanceSnapshot(Vec<Balance>),
    PositionSnapshot(Vec<ExchangePosition>),
}

/// Supervisor: keep a user-data session alive forever.
pub async fn run_user_stream(
    client: Arc<ExchangeClient>,
    ws_url: String,
    tx: mpsc::Sender<AccountEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let listen_key = match client.start_listen_key().await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, backoff_secs = backoff.as_secs(), "listen key unavailable");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };

        match run_session(&client, &ws_url, &listen_key, &tx, &mut shutdown).await {
            Ok(true) => return, // shutdown
            Ok(false) => {
                backoff = BACKOFF_INITIAL;
                warn!("user stream disconnected — reconnecting");
            }
            Err(e) => {
                error!(error = %e, "user stream session failed");
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Returns `Ok(true)` on shutdown, `Ok(false)` on disconnect.
async fn run_session(
    client: &Arc<ExchangeClient>,
    ws_url: &str,
    listen_key: &str,
    tx: &mpsc::Sender<AccountEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let url = format!("{ws_url}/ws/{listen_key}");
    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .context("user stream connect failed")?;
    info!("user stream connected");

    let (mut write, mut read) = ws_stream.split();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(true);
            }
            _ = keepalive.tick() => {
                if let Err(e) = client.keepalive_listen_key().await {
                    warn!(error = %e, "listen key keepalive failed");
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    for event in parse_user_message(&text) {
                        if tx.send(event).await.is_err() {
                            return Ok(true);
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return Ok(false);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "user stream closed by exchange");
                    return Ok(false);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "user stream read error");
                    return Ok(false);
                }
                None => return Ok(false),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Message decoding
// ---------------------------------------------------------------------------

fn parse_user_message(text: &str) -> Vec<AccountEvent> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "undecodable user message skipped");
            return Vec::new();
        }
    };

    match root["e"].as_str() {
        Some("ORDER_TRADE_UPDATE") => parse_order_update(&root)
            .map(|ev| vec![AccountEvent::OrderUpdate(ev)])
            .unwrap_or_default(),
        Some("ACCOUNT_UPDATE") => parse_account_update(&root),
        Some("listenKeyExpired") => {
            warn!("listen key expired — session will reconnect");
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn parse_order_update(root: &serde_json::Value) -> Option<OrderUpdateEvent> {
    let o = &root["o"];
    Some(OrderUpdateEvent {
        symbol: o["s"].as_str()?.to_string(),
        client_id: o["c"].as_str()?.to_string(),
        exchange_order_id: o["i"].as_u64()?,
        side: o["S"].as_str()?.parse().ok()?,
        status: o["X"].as_str()?.to_string(),
        last_fill_qty: str_f64(&o["l"]),
        last_fill_price: str_f64(&o["L"]),
        cumulative_qty: str_f64(&o["z"]),
        avg_price: str_f64(&o["ap"]),
        fee: str_f64(&o["n"]),
        fee_asset: o["N"].as_str().unwrap_or("").to_string(),
        exchange_trade_id: o["t"].as_u64().unwrap_or(0),
        timestamp_ms: root["E"].as_i64().unwrap_or(0),
    })
}

fn parse_account_update(root: &serde_json::Value) -> Vec<AccountEvent> {
    let a = &root["a"];
    let mut events = Vec::new();

    if let Some(rows) = a["B"].as_array() {
        let balances: Vec<Balance> = rows
            .iter()
            .filter_map(|b| {
                Some(Balance {
                    asset: b["a"].as_str()?.to_string(),
                    free: str_f64(&b["cw"]),
                    locked: (str_f64(&b["wb"]) - str_f64(&b["cw"])).max(0.0),
                })
            })
            .collect();
        if !balances.is_empty() {
            events.push(AccountEvent::BalanceSnapshot(balances));
        }
    }

    if let Some(rows) = a["P"].as_array() {
        let positions: Vec<ExchangePosition> = rows
            .iter()
            .filter_map(|p| {
                Some(ExchangePosition {
                    symbol: p["s"].as_str()?.to_string(),
                    quantity: str_f64(&p["pa"]),
                    entry_price: str_f64(&p["ep"]),
                    unrealized_pnl: str_f64(&p["up"]),
                })
            })
            .collect();
        if !positions.is_empty() {
            events.push(AccountEvent::PositionSnapshot(positions));
        }
    }

    events
}

fn str_f64(val: &serde_json::Value) -> f64 {
    val.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| val.as_f64())
        .unwrap_or(0.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_order_trade_update() {
        let text = r#"{"e":"ORDER_TRADE_UPDATE","E":1700000001000,"o":{
            "s":"BTCUSDT","c":"ord-1","S":"BUY","X":"PARTIALLY_FILLED","i":8886774,
            "l":"1.0","L":"50000","z":"1.0","ap":"50000","n":"0.5","N":"USDT","t":77}}"#;
        let events = parse_user_message(text);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AccountEvent::OrderUpdate(ev) => {
                assert_eq!(ev.client_id, "ord-1");
                assert_eq!(ev.exchange_order_id, 8886774);
                assert_eq!(ev.side, Side::Buy);
                assert_eq!(ev.status, "PARTIALLY_FILLED");
                assert!((ev.last_fill_qty - 1.0).abs() < 1e-12);
                assert!((ev.fee - 0.5).abs() < 1e-12);
                assert_eq!(ev.exchange_trade_id, 77);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_account_update_into_balances_and_positions() {
        let text = r#"{"e":"ACCOUNT_UPDATE","E":1700000002000,"a":{
            "B":[{"a":"USDT","wb":"1000.0","cw":"900.0"}],
            "P":[{"s":"BTCUSDT","pa":"0.5","ep":"50000","up":"12.5"}]}}"#;
        let events = parse_user_message(text);
        assert_eq!(events.len(), 2);
        match &events[0] {
            AccountEvent::BalanceSnapshot(balances) => {
                assert_eq!(balances[0].asset, "USDT");
                assert!((balances[0].free - 900.0).abs() < 1e-12);
                assert!((balances[0].locked - 100.0).abs() < 1e-12);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[1] {
            AccountEvent::PositionSnapshot(positions) => {
                assert_eq!(positions[0].symbol, "BTCUSDT");
                assert!((positions[0].quantity - 0.5).abs() < 1e-12);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn ignores_unrelated_events() {
        assert!(parse_user_message(r#"{"e":"MARGIN_CALL"}"#).is_empty());
        assert!(parse_user_message("garbage").is_empty());
    }
}
