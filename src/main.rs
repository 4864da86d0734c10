use anyhow::Context;
use clap::Parser;
use perpbot::api::{CandleFeed, DeltaClient, OrderGateway, PaperExchange, PriceSource, RemotePositionSource};
use perpbot::config::{AppConfig, EngineParams, Mode, StoreConfig};
use perpbot::db::PostgresStore;
use perpbot::events::{ChannelSink, DomainEvent, EventSink};
use perpbot::execution::{CandleBuffer, ExchangeReconciler, PositionLedger, SltpMonitor, StrategyRunner};
use perpbot::scheduler::{CycleOutcome, Scheduler};
use perpbot::store::{MemoryStore, PositionStore};
use perpbot::strategy::{EmaCrossoverEngine, TrendBreakoutEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Perpetual futures signal and position engine")]
struct Cli {
    /// Configuration file (defaults to config/default.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured trading mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Run every loop for a single cycle and exit
    #[arg(long)]
    once: bool,
}

/// Collaborators shared by every loop
struct Wiring {
    feed: Arc<dyn CandleFeed>,
    prices: Arc<dyn PriceSource>,
    gateway: Arc<dyn OrderGateway>,
    events: Arc<dyn EventSink>,
    ledger: Arc<PositionLedger>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
        config.validate()?;
    }

    tracing::info!("🚀 perpbot starting in {:?} mode", config.mode);
    log_configuration(&config);

    let (sink, events_rx) = ChannelSink::new(config.event_buffer);
    let event_drain = tokio::spawn(drain_events(events_rx));

    let wiring = build_wiring(&config, Arc::new(sink)).await?;
    wiring.ledger.restore().await?;

    let scheduler = build_scheduler(&config, &wiring)?;
    if scheduler.job_names().len() == 1 {
        tracing::warn!("No strategies configured; only the SL/TP monitor will run");
    }

    if cli.once {
        for (name, outcome) in scheduler.run_once_all().await {
            match outcome {
                CycleOutcome::Completed => tracing::info!("✓ {}", name),
                other => tracing::warn!("✗ {}: {:?}", name, other),
            }
        }
    } else {
        let handles = scheduler.spawn();
        tracing::info!("✅ {} loops spawned: {}", handles.len(), scheduler.job_names().join(", "));
        tracing::info!("\nPress Ctrl+C to stop...\n");

        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");

        scheduler.shutdown_handle().shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Loop exited abnormally: {}", e);
            }
        }
    }

    // Let queued events reach the log before exiting
    drop(scheduler);
    drop(wiring);
    if tokio::time::timeout(Duration::from_secs(2), event_drain).await.is_err() {
        tracing::warn!("Event drain did not finish in time");
    }

    tracing::info!("👋 perpbot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("perpbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_configuration(config: &AppConfig) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Exchange: {}", config.exchange.base_url);
    tracing::info!("  Credentials: {}", if config.exchange.has_credentials() { "set" } else { "none" });
    tracing::info!("  Candle window: {}", config.candle_window);
    tracing::info!("  SL/TP monitor: every {}s", config.monitor.interval_secs);
    for strategy in &config.strategies {
        tracing::info!(
            "    - {} ({:?}) every {}s on {}: {}",
            strategy.id,
            strategy.kind,
            strategy.interval_secs,
            strategy.resolution,
            strategy.symbols.join(", ")
        );
    }
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn PositionStore>> {
    Ok(match &config.store {
        StoreConfig::Memory => {
            tracing::info!("Using in-memory position store (positions are lost on restart)");
            Arc::new(MemoryStore::new())
        }
        StoreConfig::Postgres { url, max_connections } => {
            let store = PostgresStore::new(url, *max_connections)
                .await
                .map_err(|e| anyhow::anyhow!("failed to open Postgres store: {}", e))?;
            Arc::new(store)
        }
    })
}

async fn build_wiring(config: &AppConfig, events: Arc<dyn EventSink>) -> anyhow::Result<Wiring> {
    let delta = Arc::new(
        DeltaClient::new(
            &config.exchange.base_url,
            config.exchange.api_key.clone(),
            config.exchange.api_secret.clone(),
            Duration::from_secs(config.exchange.request_timeout_secs),
            config.exchange.requests_per_second,
        )
        .map_err(|e| anyhow::anyhow!("failed to build exchange client: {}", e))?,
    );

    let remote: Arc<dyn RemotePositionSource>;
    let gateway: Arc<dyn OrderGateway>;
    match config.mode {
        Mode::Paper => {
            let paper = Arc::new(PaperExchange::new(config.asset_map.clone()));
            remote = paper.clone();
            gateway = paper;
        }
        Mode::Live => {
            remote = delta.clone();
            gateway = delta.clone();
        }
    }
    let prices: Arc<dyn PriceSource> = delta.clone();

    let reconciler = Arc::new(ExchangeReconciler::new(
        remote,
        config.asset_map.clone(),
        Duration::from_secs(config.exchange.remote_check_timeout_secs),
    ));
    let ledger = Arc::new(PositionLedger::new(
        build_store(config).await?,
        reconciler,
        prices.clone(),
        events.clone(),
        config.ledger.settings(),
    ));

    Ok(Wiring {
        feed: delta,
        prices,
        gateway,
        events,
        ledger,
    })
}

fn build_scheduler(config: &AppConfig, wiring: &Wiring) -> anyhow::Result<Scheduler> {
    let mut scheduler = Scheduler::new();

    for strategy in &config.strategies {
        let settings = strategy.runner_settings(config.candle_window);
        let buffer = CandleBuffer::new(config.candle_window);
        let id = strategy.strategy_id();

        match strategy.engine_params()? {
            EngineParams::TrendBreakout(params) => scheduler.add(Arc::new(StrategyRunner::new(
                TrendBreakoutEngine::new(id, params),
                settings,
                wiring.feed.clone(),
                buffer,
                wiring.ledger.clone(),
                wiring.gateway.clone(),
                wiring.events.clone(),
            ))),
            EngineParams::EmaCrossover(params) => scheduler.add(Arc::new(StrategyRunner::new(
                EmaCrossoverEngine::new(id, params),
                settings,
                wiring.feed.clone(),
                buffer,
                wiring.ledger.clone(),
                wiring.gateway.clone(),
                wiring.events.clone(),
            ))),
        }
    }

    scheduler.add(Arc::new(SltpMonitor::new(
        wiring.ledger.clone(),
        wiring.prices.clone(),
        wiring.gateway.clone(),
        wiring.events.clone(),
        config.monitor.settings(),
    )));

    Ok(scheduler)
}

/// Render domain events as one JSON log line each
async fn drain_events(mut rx: mpsc::Receiver<DomainEvent>) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => tracing::info!(target: "perpbot::events", "{}", line),
            Err(e) => tracing::warn!("Failed to serialize {} event: {}", event.kind(), e),
        }
    }
}
