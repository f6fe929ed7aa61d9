// =============================================================================
// Cache — Redis fallback read path with short TTLs
// =============================================================================
//
// The cache is authoritative for nothing: writes are fire-and-forget and
// readers must tolerate misses. Key layout and TTLs follow the platform
// conventions (market_data:{SYM} 5 min, order:{id} 24 h).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

pub const MARKET_DATA_TTL_SECS: usize = 300;
pub const ORDER_TTL_SECS: usize = 86_400;

/// Redis-backed cache client. `ConnectionManager` multiplexes and
/// reconnects internally, so the wrapper is cheaply cloneable per call.
pub struct Cache {
    conn: ConnectionManager,
    write_errors: AtomicU64,
}

impl Cache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid cache url {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to cache at {url}"))?;
        info!(url, "cache connected");
        Ok(Self {
            conn,
            write_errors: AtomicU64::new(0),
        })
    }

    /// Store `value` as JSON under `key`, optionally with a TTL.
    /// Fire-and-forget: failures are counted, never propagated.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: Option<usize>) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                debug!(key, error = %e, "cache payload serialization failed");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = match ttl_secs {
            Some(ttl) => conn.set_ex(key, payload, ttl as u64).await,
            None => conn.set(key, payload).await,
        };

        if let Err(e) = result {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            debug!(key, error = %e, "cache write failed");
        }
    }

    /// Fetch and decode a JSON value. Misses and decode failures both
    /// return `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.ok().flatten();
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    pub async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.del(key).await;
        if let Err(e) = result {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            debug!(key, error = %e, "cache delete failed");
        }
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("write_errors", &self.write_errors())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Key builders
// ---------------------------------------------------------------------------

pub fn market_data_key(symbol: &str) -> String {
    format!("market_data:{symbol}")
}

pub fn order_key(client_id: &str) -> String {
    format!("order:{client_id}")
}

pub fn position_key(account: &str, symbol: &str) -> String {
    format!("position:{account}:{symbol}")
}

pub fn balance_key(account: &str, asset: &str) -> String {
    format!("balance:{account}:{asset}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(market_data_key("BTCUSDT"), "market_data:BTCUSDT");
        assert_eq!(order_key("ord-1"), "order:ord-1");
        assert_eq!(position_key("primary", "BTCUSDT"), "position:primary:BTCUSDT");
        assert_eq!(balance_key("primary", "USDT"), "balance:primary:USDT");
    }
}
