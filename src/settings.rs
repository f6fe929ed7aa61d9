// =============================================================================
// Process settings — environment-variable bootstrap
// =============================================================================
//
// Settings cover only what the process needs before the configuration store
// is reachable: credentials, endpoints, and the symbol universe. Everything
// tunable at runtime lives in the config service instead.
// =============================================================================

use anyhow::{Context, Result};
use tracing::info;

const MAINNET_REST: &str = "https://fapi.binance.com";
const MAINNET_WS: &str = "wss://fstream.binance.com";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com";

/// Immutable process configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: String,
    pub api_secret: String,
    pub rest_url: String,
    pub ws_url: String,
    pub database_url: String,
    pub redis_url: String,
    pub nats_url: String,
    pub account_id: String,
    pub symbols: Vec<String>,
    pub reconcile_interval_secs: u64,
}

impl Settings {
    /// Resolve settings from the environment. `EXCHANGE_API_KEY`,
    /// `EXCHANGE_SECRET` and `DATABASE_URL` are required; everything else
    /// has a default. `EXCHANGE_TESTNET=1` flips the exchange endpoints.
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("EXCHANGE_API_KEY").context("EXCHANGE_API_KEY is not set")?;
        let api_secret =
            std::env::var("EXCHANGE_SECRET").context("EXCHANGE_SECRET is not set")?;
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;

        let testnet = std::env::var("EXCHANGE_TESTNET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let (default_rest, default_ws) = if testnet {
            (TESTNET_REST, TESTNET_WS)
        } else {
            (MAINNET_REST, MAINNET_WS)
        };

        let rest_url =
            std::env::var("EXCHANGE_REST_URL").unwrap_or_else(|_| default_rest.to_string());
        let ws_url =
            std::env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| default_ws.to_string());
        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());
        let account_id =
            std::env::var("ACCOUNT_ID").unwrap_or_else(|_| "primary".to_string());

        let symbols: Vec<String> = std::env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let reconcile_interval_secs = std::env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        info!(
            testnet,
            rest_url = %rest_url,
            symbols = ?symbols,
            reconcile_interval_secs,
            "settings resolved"
        );

        Ok(Self {
            api_key,
            api_secret,
            rest_url,
            ws_url,
            database_url,
            redis_url,
            nats_url,
            account_id,
            symbols,
            reconcile_interval_secs,
        })
    }
}

impl std::fmt::Display for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials intentionally omitted.
        write!(
            f,
            "Settings {{ rest_url: {}, ws_url: {}, symbols: {:?} }}",
            self.rest_url, self.ws_url, self.symbols
        )
    }
}
