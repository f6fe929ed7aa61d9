// =============================================================================
// Message bus — NATS fan-out shared by every service
// =============================================================================
//
// Publishes are fire-and-forget: failures increment a counter and are logged
// at debug level so a slow or absent bus never blocks a producer.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

/// Thin wrapper over the NATS client with JSON payload helpers.
pub struct Bus {
    client: async_nats::Client,
    publish_errors: AtomicU64,
}

impl Bus {
    /// Connect to the bus at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to bus at {url}"))?;
        info!(url, "bus connected");
        Ok(Self {
            client,
            publish_errors: AtomicU64::new(0),
        })
    }

    /// Publish `payload` as JSON on `subject`. Fire-and-forget: serialization
    /// or publish failures are counted, never propagated.
    pub async fn publish_json<T: Serialize>(&self, subject: String, payload: &T) {
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                self.publish_errors.fetch_add(1, Ordering::Relaxed);
                debug!(subject = %subject, error = %e, "bus payload serialization failed");
                return;
            }
        };

        if let Err(e) = self.client.publish(subject.clone(), bytes.into()).await {
            self.publish_errors.fetch_add(1, Ordering::Relaxed);
            debug!(subject = %subject, error = %e, "bus publish failed");
        }
    }

    /// Subscribe to `subject` (wildcards allowed).
    pub async fn subscribe(&self, subject: String) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))
    }

    /// Total publishes dropped since startup.
    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("publish_errors", &self.publish_errors())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subject builders — the platform subject layout in one place
// ---------------------------------------------------------------------------

pub fn orderbook_subject(symbol: &str) -> String {
    format!("orderbook:{symbol}")
}

pub fn trades_subject(symbol: &str) -> String {
    format!("trades:{symbol}")
}

pub fn order_updates_subject(symbol: &str) -> String {
    format!("orders.updates.{symbol}")
}

pub fn order_fills_subject(symbol: &str) -> String {
    format!("orders.fills.{symbol}")
}

pub const ORDER_REQUESTS_SUBJECT: &str = "orders.requests.create";
pub const ORDER_CANCEL_SUBJECT: &str = "orders.requests.cancel";
pub const POSITION_UPDATE_SUBJECT: &str = "account.position.update";
pub const BALANCE_UPDATE_SUBJECT: &str = "account.balance.update";
pub const FILLS_WILDCARD: &str = "orders.fills.*";
pub const CONFIG_UPDATES_WILDCARD: &str = "config.updates.*";

pub fn alerts_subject(alert_type: &str) -> String {
    format!("alerts.{alert_type}")
}

pub fn config_updates_subject(config_type: &str) -> String {
    format!("config.updates.{config_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_layout() {
        assert_eq!(orderbook_subject("BTCUSDT"), "orderbook:BTCUSDT");
        assert_eq!(trades_subject("ETHUSDT"), "trades:ETHUSDT");
        assert_eq!(order_updates_subject("BTCUSDT"), "orders.updates.BTCUSDT");
        assert_eq!(order_fills_subject("BTCUSDT"), "orders.fills.BTCUSDT");
        assert_eq!(alerts_subject("balance_drift"), "alerts.balance_drift");
        assert_eq!(config_updates_subject("risk_limit"), "config.updates.risk_limit");
    }
}
