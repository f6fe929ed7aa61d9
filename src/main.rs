// =============================================================================
// Borealis — real-time trading data plane
// =============================================================================
//
// Four cooperating services behind one bus and one cache:
//   market-data ingestion (sequenced order books, trade prints),
//   order execution gateway (lifecycle against exchange acks),
//   account monitor (positions, balances, P&L, reconciliation),
//   configuration service (versioned store + update bus).
// =============================================================================

mod account;
mod bus;
mod cache;
mod config;
mod error;
mod exchange;
mod health;
mod market_data;
mod orders;
mod publisher;
mod settings;
mod types;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::account::monitor::{run_fill_consumer, AccountMonitor};
use crate::account::reconciler::run_reconciler;
use crate::account::recorder::run_recorder;
use crate::bus::Bus;
use crate::cache::Cache;
use crate::config::bus::run_config_watcher;
use crate::config::store::ConfigStore;
use crate::exchange::client::ExchangeClient;
use crate::exchange::user_stream::{run_user_stream, AccountEvent};
use crate::exchange::ws::run_market_stream;
use crate::health::{ComponentHealth, HealthRegistry, COMPONENT_EXCHANGE_WS};
use crate::market_data::{run_ingestor, MarkPrices, OrderBookManager};
use crate::orders::gateway::OrderGateway;
use crate::orders::state_machine::OrderStore;
use crate::publisher::Publisher;
use crate::settings::Settings;

/// Periodic server-time re-sync cadence.
const TIME_SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Bounded event-channel depth between stream sessions and consumers.
const EVENT_CHANNEL_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Borealis data plane starting");

    let settings = Settings::from_env()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let health = Arc::new(HealthRegistry::new());
    let bus = Arc::new(Bus::connect(&settings.nats_url).await?);
    let cache = Arc::new(Cache::connect(&settings.redis_url).await?);

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&settings.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("database ready");

    // ── 3. Exchange adapter ──────────────────────────────────────────────
    let client = Arc::new(ExchangeClient::new(&settings, health.clone()));
    if let Err(e) = client.sync_server_time().await {
        warn!(error = %e, "initial server-time sync failed — continuing with local clock");
    }

    // ── 4. Market data ───────────────────────────────────────────────────
    let books = Arc::new(OrderBookManager::new());
    for symbol in &settings.symbols {
        books.subscribe(symbol);
    }
    let marks = Arc::new(MarkPrices::new());
    let publisher = Arc::new(Publisher::new(bus.clone(), cache.clone()));

    // Warm the quote cache from REST snapshots. Best-effort: a blocked or
    // failing REST path only means consumers wait for the stream baseline.
    {
        let client = client.clone();
        let publisher = publisher.clone();
        let symbols = settings.symbols.clone();
        tokio::spawn(async move {
            for symbol in symbols {
                match client.fetch_snapshot(&symbol, 100).await {
                    Ok(snapshot) => {
                        let book = snapshot_to_book(&snapshot);
                        publisher.publish_book(&book).await;
                        publisher.update_quote(&symbol, Some(&book), None, None).await;
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "initial snapshot unavailable — stream will baseline");
                    }
                }
            }
        });
    }

    let (market_tx, market_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    {
        let ws_url = settings.ws_url.clone();
        let symbols = settings.symbols.clone();
        let books = books.clone();
        let health = health.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let on_disconnect = move || {
                // Every dependent book re-baselines from the next delta.
                books.invalidate_all();
                health.set(COMPONENT_EXCHANGE_WS, ComponentHealth::Degraded);
            };
            run_market_stream(ws_url, symbols, market_tx, on_disconnect, shutdown).await;
        });
    }
    tokio::spawn(run_ingestor(
        market_rx,
        books.clone(),
        publisher.clone(),
        marks.clone(),
        health.clone(),
        shutdown_rx.clone(),
    ));
    info!(symbols = ?settings.symbols, "market data pipeline launched");

    // ── 5. Order execution gateway ───────────────────────────────────────
    let order_store = Arc::new(OrderStore::new());
    let gateway = Arc::new(OrderGateway::new(
        client.clone(),
        order_store.clone(),
        bus.clone(),
        cache.clone(),
    ));
    tokio::spawn(gateway.clone().run_request_consumer(shutdown_rx.clone()));
    tokio::spawn(gateway.clone().run_cancel_consumer(shutdown_rx.clone()));
    tokio::spawn(gateway.clone().run_probe_loop(shutdown_rx.clone()));

    // ── 6. Account monitor ───────────────────────────────────────────────
    let monitor = Arc::new(AccountMonitor::new(
        settings.account_id.clone(),
        marks.clone(),
        bus.clone(),
        cache.clone(),
    ));
    tokio::spawn(run_fill_consumer(
        monitor.clone(),
        bus.clone(),
        shutdown_rx.clone(),
    ));

    // ── 7. User-data stream → gateway + monitor ──────────────────────────
    let (account_tx, mut account_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    tokio::spawn(run_user_stream(
        client.clone(),
        settings.ws_url.clone(),
        account_tx,
        shutdown_rx.clone(),
    ));
    {
        let gateway = gateway.clone();
        let monitor = monitor.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = account_rx.recv() => match event {
                        Some(e) => e,
                        None => return,
                    },
                    _ = shutdown.changed() => return,
                };
                match event {
                    AccountEvent::OrderUpdate(ev) => gateway.handle_event(&ev).await,
                    AccountEvent::BalanceSnapshot(balances) => {
                        monitor.apply_balance_snapshot(balances).await
                    }
                    AccountEvent::PositionSnapshot(positions) => {
                        monitor.apply_position_snapshot(positions).await
                    }
                }
            }
        });
    }

    // ── 8. Reconciler ────────────────────────────────────────────────────
    tokio::spawn(run_reconciler(
        client.clone(),
        monitor.clone(),
        bus.clone(),
        Duration::from_secs(settings.reconcile_interval_secs),
        shutdown_rx.clone(),
    ));

    // ── 9. Server-time re-sync loop ──────────────────────────────────────
    {
        let client = client.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIME_SYNC_INTERVAL);
            interval.tick().await; // initial sync already done at startup
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = client.sync_server_time().await {
                            warn!(error = %e, "server-time re-sync failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // ── 10. Recorder (fills, alerts, P&L time series) ────────────────────
    tokio::spawn(run_recorder(
        pool.clone(),
        bus.clone(),
        monitor.clone(),
        marks.clone(),
        shutdown_rx.clone(),
    ));

    // ── 11. Configuration service ────────────────────────────────────────
    let config_store = Arc::new(ConfigStore::new(pool, Some(bus.clone())));
    tokio::spawn(run_config_watcher(
        bus.clone(),
        config_store.clone(),
        monitor.clone(),
        shutdown_rx.clone(),
    ));

    info!(health = %health.composite(), "all subsystems running — ctrl-c to stop");

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping tasks");
    if shutdown_tx.send(true).is_err() {
        error!("shutdown channel closed early");
    }
    // Give stream sessions a moment to send close frames.
    tokio::time::sleep(Duration::from_millis(250)).await;

    info!("Borealis shut down complete");
    Ok(())
}

/// Top 20 levels of a REST depth snapshot as a publishable book snapshot.
fn snapshot_to_book(snapshot: &exchange::client::DepthSnapshot) -> market_data::BookSnapshot {
    let levels = |side: &[(rust_decimal::Decimal, rust_decimal::Decimal)]| {
        side.iter()
            .take(20)
            .map(|&(price, quantity)| types::PriceLevel { price, quantity })
            .collect()
    };
    market_data::BookSnapshot {
        symbol: snapshot.symbol.clone(),
        bids: levels(&snapshot.bids),
        asks: levels(&snapshot.asks),
        last_update_id: snapshot.last_update_id,
        timestamp_us: chrono::Utc::now().timestamp_micros(),
    }
}
