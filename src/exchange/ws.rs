// =============================================================================
// Market-data WebSocket session — combined depth/trade/ticker streams
// =============================================================================
//
// One socket per logical session. Reconnects with exponential backoff
// (1 s doubling to a 60 s cap, reset after a live session) and invokes the
// disconnect hook so every dependent order book is invalidated before the
// next session re-baselines it.
// =============================================================================

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::orderbook::DepthUpdate;
use crate::types::{Side, Trade};

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Application-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// 24 h rolling statistics from the ticker stream.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TickerStats {
    pub symbol: String,
    pub last_price: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub price_change_pct: f64,
}

/// Decoded event from the market stream.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Depth(DepthUpdate),
    Trade(Trade),
    Ticker(TickerStats),
}

/// Count of messages that failed to decode (monotonic, process-wide).
pub static MALFORMED_MESSAGES: AtomicU64 = AtomicU64::new(0);

fn combined_stream_url(ws_url: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .flat_map(|s| {
            let lower = s.to_lowercase();
            [
                format!("{lower}@depth@100ms"),
                format!("{lower}@aggTrade"),
                format!("{lower}@ticker"),
            ]
        })
        .collect();
    format!("{}/stream?streams={}", ws_url, streams.join("/"))
}

/// Supervisor: run market-data sessions forever, reconnecting with backoff.
/// `on_disconnect` fires every time a session ends so dependent state can be
/// invalidated before the next session delivers fresh baselines.
pub async fn run_market_stream(
    ws_url: String,
    symbols: Vec<String>,
    tx: mpsc::Sender<MarketEvent>,
    on_disconnect: impl Fn() + Send + Sync,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = combined_stream_url(&ws_url, &symbols);
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match run_session(&url, &tx, &mut shutdown).await {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::Disconnected { delivered }) => {
                on_disconnect();
                if delivered > 0 {
                    backoff = BACKOFF_INITIAL;
                }
                warn!(delivered, backoff_secs = backoff.as_secs(), "market stream disconnected");
            }
            Err(e) => {
                on_disconnect();
                error!(error = %e, backoff_secs = backoff.as_secs(), "market stream session failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected { delivered: u64 },
}

async fn run_session(
    url: &str,
    tx: &mpsc::Sender<MarketEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd> {
    info!(url, "connecting market stream");
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("market stream connect failed")?;
    info!("market stream connected");

    let (mut write, mut read) = ws_stream.split();
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut delivered: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
            _ = ping_timer.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    warn!(error = %e, "market stream ping failed");
                    return Ok(SessionEnd::Disconnected { delivered });
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match parse_market_message(&text) {
                        Some(event) => {
                            delivered += 1;
                            // Ingestor applies at arrival rate; a full queue
                            // means shutdown is racing us.
                            if tx.send(event).await.is_err() {
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        None => {
                            MALFORMED_MESSAGES.fetch_add(1, Ordering::Relaxed);
                            debug!("undecodable market message skipped");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        warn!(error = %e, "pong send failed");
                        return Ok(SessionEnd::Disconnected { delivered });
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "market stream closed by exchange");
                    return Ok(SessionEnd::Disconnected { delivered });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "market stream read error");
                    return Ok(SessionEnd::Disconnected { delivered });
                }
                None => {
                    warn!("market stream ended");
                    return Ok(SessionEnd::Disconnected { delivered });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Message decoding
// ---------------------------------------------------------------------------

/// Decode one combined-stream message. Returns `None` for anything that is
/// not a depth, trade, or ticker event.
fn parse_market_message(text: &str) -> Option<MarketEvent> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    // Combined streams wrap payloads in {stream, data}.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    match data["e"].as_str()? {
        "depthUpdate" => Some(MarketEvent::Depth(DepthUpdate {
            symbol: data["s"].as_str()?.to_string(),
            first_update_id: data["U"].as_u64()?,
            last_update_id: data["u"].as_u64()?,
            bids: parse_side(&data["b"])?,
            asks: parse_side(&data["a"])?,
            timestamp_ms: data["E"].as_i64().unwrap_or(0),
        })),
        "aggTrade" => Some(MarketEvent::Trade(Trade {
            symbol: data["s"].as_str()?.to_string(),
            trade_id: data["a"].as_u64()?,
            price: Decimal::from_str(data["p"].as_str()?).ok()?,
            quantity: Decimal::from_str(data["q"].as_str()?).ok()?,
            timestamp_ms: data["T"].as_i64()?,
            // m == true: buyer is the maker.
            maker_side: if data["m"].as_bool()? {
                Side::Buy
            } else {
                Side::Sell
            },
        })),
        "24hrTicker" => Some(MarketEvent::Ticker(TickerStats {
            symbol: data["s"].as_str()?.to_string(),
            last_price: Decimal::from_str(data["c"].as_str()?).ok()?,
            high_24h: Decimal::from_str(data["h"].as_str()?).ok()?,
            low_24h: Decimal::from_str(data["l"].as_str()?).ok()?,
            volume_24h: Decimal::from_str(data["v"].as_str()?).ok()?,
            price_change_pct: data["P"].as_str()?.parse().ok()?,
        })),
        _ => None,
    }
}

fn parse_side(val: &serde_json::Value) -> Option<Vec<(Decimal, Decimal)>> {
    let rows = val.as_array()?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let price = Decimal::from_str(row.get(0)?.as_str()?).ok()?;
        let qty = Decimal::from_str(row.get(1)?.as_str()?).ok()?;
        levels.push((price, qty));
    }
    Some(levels)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn decodes_depth_update() {
        let text = r#"{"stream":"btcusdt@depth@100ms","data":{
            "e":"depthUpdate","E":1700000000123,"s":"BTCUSDT",
            "U":100,"u":102,
            "b":[["50000.00","1.5"],["49999.00","0"]],
            "a":[["50001.00","2.0"]]}}"#;
        match parse_market_message(text) {
            Some(MarketEvent::Depth(d)) => {
                assert_eq!(d.symbol, "BTCUSDT");
                assert_eq!(d.first_update_id, 100);
                assert_eq!(d.last_update_id, 102);
                assert_eq!(d.bids[0], (dec!(50000.00), dec!(1.5)));
                assert_eq!(d.bids[1].1, Decimal::ZERO);
                assert_eq!(d.asks.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_agg_trade() {
        let text = r#"{"e":"aggTrade","s":"ETHUSDT","a":42,"p":"3000.10","q":"0.25","T":1700000000456,"m":true}"#;
        match parse_market_message(text) {
            Some(MarketEvent::Trade(t)) => {
                assert_eq!(t.symbol, "ETHUSDT");
                assert_eq!(t.trade_id, 42);
                assert_eq!(t.price, dec!(3000.10));
                assert_eq!(t.maker_side, Side::Buy);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_ticker() {
        let text = r#"{"e":"24hrTicker","s":"BTCUSDT","c":"50000","h":"51000","l":"49000","v":"1234.5","P":"1.25"}"#;
        match parse_market_message(text) {
            Some(MarketEvent::Ticker(t)) => {
                assert_eq!(t.last_price, dec!(50000));
                assert!((t.price_change_pct - 1.25).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn skips_unknown_and_malformed_messages() {
        assert!(parse_market_message("{\"e\":\"kline\"}").is_none());
        assert!(parse_market_message("not json").is_none());
    }

    #[test]
    fn combined_url_lists_every_stream() {
        let url = combined_stream_url("wss://fstream.binance.com", &["BTCUSDT".to_string()]);
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@depth@100ms/btcusdt@aggTrade/btcusdt@ticker"
        );
    }
}
