//! Engine entry point.
//!
//! Wires the unified engine (WebSocket ingest, tick routing, paper
//! execution) and the streaming imbalance executor over one SQLite store,
//! then runs until interrupted. Exit code 0 on clean shutdown, 1 on a fatal
//! engine or configuration error.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oddsbot::db::Db;
use oddsbot::engine::executor::PaperExecutor;
use oddsbot::engine::positions::PositionStore;
use oddsbot::engine::router::{MarketCache, TickRouter};
use oddsbot::engine::runner::UnifiedEngine;
use oddsbot::engine::state::StateManager;
use oddsbot::engine::strategy::Strategy;
use oddsbot::exchange::orders::OrderClient;
use oddsbot::exchange::rest::MarketDataClient;
use oddsbot::executor::live::LiveExecutor;
use oddsbot::executor::safety::{SafetyChecker, SafetyLimits};
use oddsbot::models::Config;
use oddsbot::strategies::{
    Bo3LongshotStrategy, FavoriteHedgeStrategy, MapLongshotStrategy, ScalpStrategy,
    SwingRebalanceStrategy,
};
use oddsbot::streaming::config::load_streaming_config;
use oddsbot::streaming::runner::StreamingRunner;

#[derive(Parser, Debug)]
#[command(name = "oddsbot", about = "Binary prediction-market trading engine")]
struct Cli {
    /// SQLite database path (overrides DATABASE_PATH).
    #[arg(long)]
    database: Option<String>,

    /// strategies.yaml path (overrides STRATEGIES_CONFIG).
    #[arg(long)]
    strategies_config: Option<String>,

    /// Disable the streaming imbalance executor.
    #[arg(long)]
    no_streaming: bool,

    /// Disable the polled strategy engine (streaming only).
    #[arg(long)]
    no_engine: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oddsbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal engine error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("load configuration")?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(path) = cli.strategies_config {
        config.strategies_config_path = path;
    }

    info!(db = %config.database_path, "oddsbot starting");
    let db = Db::open(&config.database_path).context("open database")?;

    let state = StateManager::new(db.clone());
    let positions = PositionStore::new(db.clone(), state.clone());
    let market_data = Arc::new(MarketDataClient::new());
    let markets: MarketCache = Arc::new(RwLock::new(HashMap::new()));

    let streaming_config =
        load_streaming_config(Path::new(&config.strategies_config_path))
            .context("load strategies config")?;

    // Live trading pieces exist only when credentials are present.
    let order_client = OrderClient::from_env().map(Arc::new);
    let live_executor = order_client.as_ref().map(|client| {
        let limits = SafetyLimits {
            max_signal_age_seconds: streaming_config.max_signal_age_seconds,
            max_price_deviation: streaming_config.max_price_deviation,
            max_spread: streaming_config.max_spread,
            max_exit_spread: streaming_config.max_exit_spread,
            max_fee_rate_bps: streaming_config.max_fee_rate_bps,
            ..SafetyLimits::default()
        };
        Arc::new(LiveExecutor::new(
            db.clone(),
            positions.clone(),
            client.clone(),
            market_data.clone(),
            SafetyChecker::new(db.clone(), limits),
        ))
    });

    if streaming_config.live && live_executor.is_none() {
        anyhow::bail!("live mode configured but exchange credentials are missing");
    }

    // The exchange wallet is authoritative for live fills: import anything
    // placed outside this process before trading.
    if let Some(live) = &live_executor {
        match live.reconcile_wallet_positions().await {
            Ok(0) => {}
            Ok(count) => info!(count = %count, "imported wallet positions at startup"),
            Err(e) => warn!(error = %e, "wallet reconciliation failed at startup"),
        }
    }

    let mut tasks = Vec::new();

    if !cli.no_streaming && streaming_config.enabled {
        let safety_limits = SafetyLimits {
            max_position_usd: streaming_config
                .fixed_size_usd
                .max(SafetyLimits::default().max_position_usd),
            max_signal_age_seconds: streaming_config.max_signal_age_seconds,
            max_price_deviation: streaming_config.max_price_deviation,
            max_spread: streaming_config.max_spread,
            max_exit_spread: streaming_config.max_exit_spread,
            max_fee_rate_bps: streaming_config.max_fee_rate_bps,
            ..SafetyLimits::default()
        };
        let runner = StreamingRunner::new(
            streaming_config,
            config.websocket_url.clone(),
            db.clone(),
            positions.clone(),
            SafetyChecker::new(db.clone(), safety_limits),
            live_executor.clone(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!(error = %e, "streaming runner exited");
            }
        }));
    }

    let engine_task = if !cli.no_engine {
        let mut router = TickRouter::new(
            db.clone(),
            state.clone(),
            positions.clone(),
            PaperExecutor::new(positions.clone()),
            markets.clone(),
        );
        for strategy in build_strategies(&config.strategy_whitelist) {
            router.register_strategy(strategy);
        }

        let engine = UnifiedEngine::new(
            config.websocket_url.clone(),
            db.clone(),
            markets,
            positions.clone(),
            market_data,
        );
        Some(tokio::spawn(async move { engine.run(router).await }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("shutdown signal received");

    if let Some(task) = engine_task {
        task.abort();
        let _ = task.await;
    }
    for task in tasks {
        task.abort();
        let _ = task.await;
    }

    info!("oddsbot stopped cleanly");
    Ok(())
}

/// Instantiate the reference strategy set, optionally restricted to a
/// whitelist of names from STRATEGY_WHITELIST.
fn build_strategies(whitelist: &[String]) -> Vec<Box<dyn Strategy>> {
    let all: Vec<Box<dyn Strategy>> = vec![
        Box::new(ScalpStrategy::new()),
        Box::new(FavoriteHedgeStrategy::new()),
        Box::new(SwingRebalanceStrategy::new()),
        Box::new(MapLongshotStrategy::new()),
        Box::new(Bo3LongshotStrategy::new()),
    ];
    if whitelist.is_empty() {
        return all;
    }
    all.into_iter()
        .filter(|s| whitelist.iter().any(|w| w == s.name()))
        .collect()
}
