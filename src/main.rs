use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod api;
mod betting;
mod config;
mod db;
mod feeds;
mod ledger;
mod sim;

use api::AppState;
use betting::paper_trade::{load_history, replay, ReplaySettings};
use betting::pipeline::{ForecastProviders, ForecastSettings};
use betting::ForecastEngine;
use config::Config;
use db::Database;
use feeds::{start_results_monitor, AggregatorClient, ResultsProvider, ResultsPushConfig, ResultsPushProvider};
use ledger::Ledger;
use sim::SimulationEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let simulator = Arc::new(SimulationEngine::new(config.simulation_config())?);

    if let Some(path) = &config.paper_trade {
        info!("Paper-trade replay of {}", path);
        let history = load_history(path)?;
        let settings = ReplaySettings {
            evaluator: config.evaluator_config(),
            sizing: config.sizing_config(),
            seed: config.seed,
            initial_bankroll: config.initial_balance,
        };
        let report = tokio::task::spawn_blocking(move || replay(history, &simulator, &settings)).await??;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // Open database and rebuild the ledger from it
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);
    let ledger = Arc::new(Ledger::restore(
        Arc::new(db.clone()),
        db.load_wallets()?,
        db.load_bets()?,
        db.load_games()?,
    ));

    let house_wallet = match db.find_wallet_by_owner(&config.house_wallet)? {
        Some(id) => id,
        None => {
            let wallet = ledger.open_wallet(&config.house_wallet, config.initial_balance, Utc::now())?;
            info!("Opened house wallet '{}' with {}", wallet.owner, wallet.balance);
            wallet.id
        }
    };

    let aggregator = Arc::new(AggregatorClient::new(
        &config.aggregator_url,
        config.aggregator_api_key.clone(),
    )?);

    // REST results are polled; the optional WebSocket feed pushes them.
    let mut results_providers: Vec<Arc<dyn ResultsProvider>> = vec![aggregator.clone()];
    if let Some(url) = &config.results_ws_url {
        results_providers.push(Arc::new(ResultsPushProvider::new(ResultsPushConfig {
            name: "results-ws".into(),
            url: url.clone(),
            subscribe_message: Some(r#"{"action":"subscribe","channel":"results"}"#.into()),
            ping_interval_secs: 30,
        })));
    }
    info!("Configured {} results provider(s)", results_providers.len());

    let engine = Arc::new(ForecastEngine::new(
        ForecastProviders {
            stats: aggregator.clone(),
            odds: aggregator.clone(),
            schedule: aggregator,
        },
        simulator,
        db.clone(),
        Arc::clone(&ledger),
        house_wallet,
        ForecastSettings {
            evaluator: config.evaluator_config(),
            sizing: config.sizing_config(),
            seed: config.seed,
            lookahead: chrono::Duration::hours(config.lookahead_hours),
            simulation_timeout: Duration::from_secs(config.simulation_timeout_secs),
        },
    ));

    // Catch up on finals whose settlement did not complete before the restart
    let caught_up = engine.retry_settlements();
    if caught_up > 0 {
        info!("Catch-up settled {} bet(s)", caught_up);
    }

    // Forecast loop
    let cycle_engine = Arc::clone(&engine);
    let pipeline_interval = Duration::from_secs(config.pipeline_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pipeline_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = cycle_engine.run_cycle(Utc::now()).await {
                error!("Forecast cycle failed: {:#}", e);
            }
        }
    });

    // Settlement loop; failed settlements are retried on their own interval
    let settle_engine = Arc::clone(&engine);
    let mut results = start_results_monitor(results_providers, Duration::from_secs(config.results_poll_secs));
    let mut retry = tokio::time::interval(Duration::from_secs(config.settlement_retry_secs));
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                delivered = results.recv() => {
                    let Some(game) = delivered else {
                        warn!("Results monitor stopped");
                        break;
                    };
                    if let Err(e) = settle_engine.on_final_result(&game) {
                        error!("Settlement of game {} failed; will retry: {:#}", game.id, e);
                    }
                }
                _ = retry.tick() => {
                    settle_engine.retry_settlements();
                }
            }
        }
    });

    let app = api::router(AppState {
        db,
        ledger,
        published: engine.published(),
    });
    let addr: SocketAddr = config.api_addr.parse().context("invalid api_addr")?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_engine = Arc::clone(&engine);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown_engine.cancel_running();
        })
        .await?;

    Ok(())
}
