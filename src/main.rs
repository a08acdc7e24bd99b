use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cryptofleet::agents::InertDecisionAgent;
use cryptofleet::analysis::MarketPhaseAnalyzer;
use cryptofleet::config::Settings;
use cryptofleet::engine::{AutonomousApi, AutonomousSupervisor, BotManager, Services};
use cryptofleet::exchange::{BinanceClient, ExchangeApi};
use cryptofleet::storage::Database;
use cryptofleet::strategies::{strategy_for, Strategy};
use cryptofleet::types::{StrategyKind, Symbol, TimeFrame};
use cryptofleet::web::{self, AppState};

#[derive(Parser)]
#[command(name = "cryptofleet")]
#[command(version = "0.1.0")]
#[command(about = "Autonomous multi-bot cryptocurrency trading platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the platform: bot manager, autonomous supervisor and dashboard API
    Serve {
        /// Dashboard API port (overrides WEB_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show the current price of a symbol
    Prices {
        /// Trading symbol, e.g. BTCUSDT
        symbol: String,
    },
    /// One-shot strategy and market-phase analysis
    Analyze {
        /// Trading symbol, e.g. BTCUSDT
        symbol: String,
        /// Strategy to run
        #[arg(short, long, default_value = "combined")]
        strategy: String,
        /// Kline interval
        #[arg(short, long, default_value = "5m")]
        timeframe: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port } => serve(port).await,
        Commands::Prices { symbol } => show_price(&symbol).await,
        Commands::Analyze { symbol, strategy, timeframe } => {
            analyze(&symbol, &strategy, &timeframe).await
        }
    }
}

async fn serve(port: Option<u16>) -> Result<()> {
    let settings = Settings::from_env()?;
    let port = port.unwrap_or(settings.web_port);

    if !settings.has_credentials() {
        warn!("No exchange credentials configured; bots cannot place orders");
    }

    let exchange: Arc<dyn ExchangeApi> = Arc::new(BinanceClient::new(
        settings.api_key.clone(),
        settings.api_secret.clone(),
        settings.use_testnet,
    ));
    let db = Arc::new(Database::new(&settings.database_url).await?);
    let services = Services::new(exchange, db, settings);
    let manager = BotManager::new(Arc::clone(&services));

    // The LLM wrappers attach through the HTTP tool endpoint; without
    // them the supervisor loops run against an inert decision agent.
    let supervisor =
        AutonomousSupervisor::new(Arc::clone(&manager), Arc::new(InertDecisionAgent), None);
    supervisor.start().await;

    let state = AppState {
        manager: Arc::clone(&manager),
        autonomous: Arc::new(AutonomousApi::new(Arc::clone(&supervisor), Arc::clone(&manager))),
    };

    let server = tokio::spawn(web::serve(state, port));

    info!("cryptofleet is up; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    supervisor.stop().await;
    manager.shutdown().await;
    server.abort();
    Ok(())
}

async fn show_price(symbol: &str) -> Result<()> {
    let symbol = Symbol::parse(symbol).ok_or_else(|| anyhow!("invalid symbol '{symbol}'"))?;
    let client = BinanceClient::public_only();
    let price = client.price(&symbol).await?;
    println!("{symbol}: {price}");
    Ok(())
}

async fn analyze(symbol: &str, strategy: &str, timeframe: &str) -> Result<()> {
    let symbol = Symbol::parse(symbol).ok_or_else(|| anyhow!("invalid symbol '{symbol}'"))?;
    let kind = StrategyKind::parse(strategy)
        .ok_or_else(|| anyhow!("unknown strategy '{strategy}'"))?;
    let timeframe = TimeFrame::parse(timeframe)
        .ok_or_else(|| anyhow!("invalid timeframe '{timeframe}'"))?;

    let client = BinanceClient::public_only();
    let candles = client.klines(&symbol, timeframe, 100).await?;

    let signal = strategy_for(kind).analyze(&candles);
    let phase = MarketPhaseAnalyzer::new().analyze(&candles, 20);

    println!("=== {symbol} ({timeframe}) ===");
    println!("Signal: {} (confidence {:.2})", signal.signal, signal.confidence);
    println!("Reason: {}", signal.reason);
    println!("Market phase: {} (confidence {:.2})", phase.phase, phase.confidence);
    println!("{}", phase.description);
    Ok(())
}
