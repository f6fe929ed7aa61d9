// =============================================================================
// Config watcher — applies committed configuration to running components
// =============================================================================
//
// The update bus is at-most-once, so the watcher layers a poll on top of
// the subscription: the store is read at startup and on a slow timer, and
// every bus event is applied on arrival. Risk limits feed the account
// monitor directly; other types are logged for their consumers.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::account::monitor::{AccountMonitor, RiskThresholds};
use crate::bus::{self, Bus};
use crate::config::model::{ConfigType, ConfigUpdateEvent, ListFilter};
use crate::config::store::ConfigStore;

/// Poll cadence compensating for dropped bus deliveries.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Run the config watcher until shutdown.
pub async fn run_config_watcher(
    bus: Arc<Bus>,
    store: Arc<ConfigStore>,
    monitor: Arc<AccountMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Startup reconcile before any subscription traffic.
    poll_store(&store, &monitor).await;

    let mut sub = match bus.subscribe(bus::CONFIG_UPDATES_WILDCARD.to_string()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "config update subscription failed — polling only");
            run_poll_only(&store, &monitor, &mut shutdown).await;
            return;
        }
    };
    info!(subject = bus::CONFIG_UPDATES_WILDCARD, "config watcher started");

    let mut poll_timer = tokio::time::interval(POLL_INTERVAL);
    poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    poll_timer.tick().await; // immediate first tick already covered above

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = poll_timer.tick() => poll_store(&store, &monitor).await,
            msg = sub.next() => match msg {
                Some(msg) => {
                    match serde_json::from_slice::<ConfigUpdateEvent>(&msg.payload) {
                        Ok(event) => apply_event(&monitor, &event),
                        Err(e) => warn!(error = %e, "undecodable config event dropped"),
                    }
                }
                None => {
                    warn!("config subscription closed — polling only");
                    run_poll_only(&store, &monitor, &mut shutdown).await;
                    return;
                }
            }
        }
    }
}

async fn run_poll_only(
    store: &Arc<ConfigStore>,
    monitor: &Arc<AccountMonitor>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut poll_timer = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = poll_timer.tick() => poll_store(store, monitor).await,
        }
    }
}

/// Load every active risk_limit config and apply the thresholds.
async fn poll_store(store: &Arc<ConfigStore>, monitor: &Arc<AccountMonitor>) {
    let filter = ListFilter {
        config_type: Some(ConfigType::RiskLimit),
        active: Some(true),
        ..Default::default()
    };
    match store.list(&filter).await {
        Ok(configs) => {
            for config in configs {
                match serde_json::from_value::<RiskThresholds>(config.value.clone()) {
                    Ok(thresholds) => monitor.set_risk_thresholds(thresholds),
                    Err(e) => warn!(key = %config.key, error = %e, "risk_limit config unusable"),
                }
            }
        }
        Err(e) => warn!(error = %e, "config poll failed — keeping current settings"),
    }
}

fn apply_event(monitor: &Arc<AccountMonitor>, event: &ConfigUpdateEvent) {
    debug!(
        key = %event.key,
        config_type = %event.config_type,
        version = event.version,
        action = %event.action,
        "config update received"
    );

    match event.config_type {
        ConfigType::RiskLimit => {
            match serde_json::from_value::<RiskThresholds>(event.value.clone()) {
                Ok(thresholds) => monitor.set_risk_thresholds(thresholds),
                Err(e) => warn!(key = %event.key, error = %e, "risk_limit update unusable"),
            }
        }
        // Symbol universe and system tuning are picked up at the next
        // restart; the event is logged so operators can see it landed.
        ConfigType::TradingPair | ConfigType::System | ConfigType::Strategy => {
            info!(
                key = %event.key,
                config_type = %event.config_type,
                version = event.version,
                "config update acknowledged"
            );
        }
    }
}
