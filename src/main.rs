// Price battle service: wagering ledger, FIFO matching and on-chain funds flows
// Runs the HTTP API plus the battle sweeper and deposit scanner

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use battle_service::{
    api,
    battle::BattleSweeper,
    chain_client::{eth::EthRpcChainClient, ChainClient},
    clock::{Clock, SystemClock},
    config::Config,
    deposit::DepositScanner,
    metrics,
    oracle::{HttpPriceOracle, PriceOracle},
    storage, AppState,
};

const LOCK_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    // Regular stdout + file logging
    std::fs::create_dir_all(&config.log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "battle-service.log");
    let (non_blocking_file, _guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer().with_writer(non_blocking_file).with_ansi(false);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)     // For console output
        .with(file_layer)       // For file output
        .init();

    std::mem::forget(_guard);
    run_with_services(config).await
}

async fn run_with_services(config: Config) -> anyhow::Result<()> {
    info!("Starting price battle service");

    if config.platform_address.is_empty() {
        warn!("PLATFORM_ADDRESS is not set; every deposit will be rejected as misaddressed");
    }
    if config.admin_token.is_none() {
        warn!("ADMIN_TOKEN is not set; admin withdrawal endpoints are disabled");
    }
    if config.session_secret.is_none() {
        warn!("SESSION_SECRET is not set; sessions will not survive a restart");
    }

    let config = Arc::new(config);
    let metrics_handle = metrics::install_recorder()?;

    // Automatically chooses PostgreSQL or in-memory
    let database = storage::create_database(&config).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let oracle: Arc<dyn PriceOracle> = Arc::new(HttpPriceOracle::new(&config, clock.clone())?);
    let chain: Arc<dyn ChainClient> = Arc::new(EthRpcChainClient::new(&config)?);

    let app_state = AppState::build(
        config.clone(),
        database,
        oracle,
        chain,
        clock.clone(),
        Some(metrics_handle),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = BattleSweeper::new(app_state.battles.clone(), config.battle_sweep_interval());
    let sweeper_task = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let scanner = DepositScanner::new(
        app_state.deposits.clone(),
        clock,
        config.deposit_scan_interval(),
        config.deposit_max_pending_age(),
    );
    let scanner_task = tokio::spawn(scanner.run(shutdown_rx.clone()));

    let prune_state = app_state.clone();
    let mut prune_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LOCK_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = prune_state.prune_locks();
                    if pruned > 0 {
                        debug!("Pruned {} idle locks", pruned);
                    }
                }
                _ = prune_shutdown.changed() => break,
            }
        }
    });

    let app = api::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Battle service listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background workers");
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper_task.await {
        error!("Battle sweeper task failed: {}", e);
    }
    if let Err(e) = scanner_task.await {
        error!("Deposit scanner task failed: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, keep serving
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
