//! Spot Trader - autonomous spot-trading agent
//!
//! `run` (the default) starts the orchestrator against Binance:
//! 1. Loads settings from `config/` and `TRADER__*` environment variables
//! 2. Warms up bar history and subscribes to kline streams
//! 3. Gates entries on sentiment, regime, governance and price integrity
//! 4. Manages open positions until shutdown (Ctrl-C or the STOP file)
//!
//! `optimize` grid-searches signal parameters over recent history.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spot_trader::{
    BinanceClient, CoinbaseVenue, Components, Credentials, ExchangeClient, HeadlineSource,
    HttpCompletionClient, NoHeadlines, Settings, SimulatedBacktest, StaticHeadlines,
    StrategyOptimizer, TextCompletion, TradingMode, TradingOrchestrator,
};

#[derive(Parser)]
#[command(name = "spot-trader", version, about = "Autonomous crypto spot-trading agent")]
struct Cli {
    /// Directory holding default.toml and <TRADER_ENV>.toml
    #[arg(long, env = "TRADER_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop (default)
    Run,
    /// Grid-search signal parameters on historical bars
    Optimize {
        /// Symbol whose history is replayed
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,

        /// Number of bars to fetch
        #[arg(long, default_value_t = 1000)]
        bars: usize,

        /// Parameter grid, e.g. `--param lookback=10,20,30`
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Vec<f64>)>,

        /// Rows to print
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

fn parse_param(raw: &str) -> Result<(String, Vec<f64>), String> {
    let (name, values) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=V1,V2,... got '{}'", raw))?;
    let values = values
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("{}: {}", v, e)))
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() {
        return Err(format!("no values for {}", name));
    }
    Ok((name.trim().to_string(), values))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config_dir)
        .with_context(|| format!("failed to load settings from {}", cli.config_dir.display()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Optimize {
            symbol,
            bars,
            params,
            top,
        } => optimize(settings, &symbol, bars, params, top).await,
    }
}

async fn run(settings: Settings) -> Result<()> {
    info!("Starting Spot Trader...");
    info!(
        "Mode: {:?}, symbols: {:?}, data: {}",
        settings.mode,
        settings.symbols,
        settings.data_dir.display()
    );

    let credentials = Credentials::from_env();
    if settings.mode == TradingMode::Live && credentials.is_none() {
        bail!("live mode requires BINANCE_API_KEY and BINANCE_API_SECRET");
    }

    let exchange: Arc<dyn ExchangeClient> =
        Arc::new(BinanceClient::new(&settings.exchange, credentials)?);
    let venue = Arc::new(CoinbaseVenue::new(&settings.oracle)?);

    let llm: Option<Arc<dyn TextCompletion>> = if settings.llm.enabled {
        info!("LLM gateway: {}", settings.llm.gateway_url);
        Some(Arc::new(HttpCompletionClient::new(&settings.llm)?))
    } else {
        None
    };

    let headlines: Arc<dyn HeadlineSource> = match &settings.analysis.headlines_file {
        Some(path) => Arc::new(StaticHeadlines::new(path)),
        None => {
            warn!("No headlines file configured, sentiment stays neutral");
            Arc::new(NoHeadlines)
        }
    };

    let components = Components::build(settings, exchange, venue, llm, headlines).await?;
    let orchestrator = TradingOrchestrator::new(components);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator.run(shutdown_rx).await
}

async fn optimize(
    settings: Settings,
    symbol: &str,
    bars: usize,
    params: Vec<(String, Vec<f64>)>,
    top: usize,
) -> Result<()> {
    let mut space: BTreeMap<String, Vec<f64>> = params.into_iter().collect();
    if space.is_empty() {
        space.insert("lookback".to_string(), vec![10.0, 20.0, 30.0]);
        space.insert("atr_mult".to_string(), vec![1.5, 2.0, 3.0]);
    }

    let exchange = BinanceClient::new(&settings.exchange, None)?;
    let history = exchange
        .get_klines(symbol, &settings.kline_interval, bars)
        .await
        .with_context(|| format!("failed to fetch {} history", symbol))?;
    info!("Optimizing over {} {} bars of {}", history.len(), settings.kline_interval, symbol);

    let runner = SimulatedBacktest::new(
        history,
        settings.ledger.genesis_amount,
        settings.strategy.clone(),
        settings.risk.clone(),
    );
    let reports = StrategyOptimizer::new(runner).run(&space);

    println!(
        "{:<48} {:>8} {:>8} {:>8} {:>7} {:>12}",
        "params", "PF", "win%", "maxDD%", "trades", "net"
    );
    for report in reports.iter().take(top) {
        let params = report
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<48} {:>8.3} {:>8.1} {:>8.2} {:>7} {:>12.2}",
            params,
            report.profit_factor,
            report.win_rate * 100.0,
            report.max_drawdown * 100.0,
            report.trades,
            report.net_pnl
        );
    }

    if let Some(best) = reports.first() {
        let capital = settings.ledger.genesis_amount.to_f64().unwrap_or(0.0);
        info!(
            "Best: PF {:.3}, net {:.2} on {:.2} starting capital",
            best.profit_factor, best.net_pnl, capital
        );
    }
    Ok(())
}
