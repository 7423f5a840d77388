//! Backtest Runner
//!
//! Submits one backtest against the configured price store, waits for it to
//! finish and prints the result.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use backtester::{
    BacktestRequest, BacktestService, HistoricalDataProvider, HttpMarketData, MemoryRunStore,
    PgPriceStore, PgRunStore, RunOptions, RunStatus, RunStore, TradingWeek, ValuationPolicy,
    WinRateMethod,
};
use chrono::NaiveDate;
use clap::Parser;
use egx_core::api::MarketDataClient;
use egx_core::config::Config;
use egx_core::db::{self, PriceRepository};
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "backtest-runner")]
#[command(about = "Run a strategy backtest over EGX daily prices", long_about = None)]
struct Cli {
    /// Strategy id (momentum_rsi, mean_reversion, breakout, buy_and_hold)
    #[arg(long)]
    strategy: String,

    /// Comma-separated tickers, e.g. COMI,ETEL,SWDY
    #[arg(long, value_delimiter = ',', required = true)]
    symbols: Vec<String>,

    /// First day of the backtest (YYYY-MM-DD)
    #[arg(long)]
    start: NaiveDate,

    /// Last day of the backtest (YYYY-MM-DD)
    #[arg(long)]
    end: NaiveDate,

    /// Starting cash in EGP
    #[arg(long, default_value = "100000")]
    capital: Decimal,

    /// Strategy parameters as a JSON object
    #[arg(long)]
    params: Option<String>,

    /// Commission rate per trade; defaults to the configured rate
    #[arg(long)]
    commission: Option<Decimal>,

    /// Mark held symbols without a bar at their last close
    #[arg(long)]
    carry_forward: bool,

    /// Use the Sunday to Thursday trading week
    #[arg(long)]
    egx_week: bool,

    /// Count wins by FIFO lot matching instead of sell count
    #[arg(long)]
    lot_matched: bool,

    /// Configuration file; environment variables are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Apply database migrations before running
    #[arg(long)]
    migrate: bool,

    /// Keep the run in memory instead of the backtests table
    #[arg(long)]
    no_persist: bool,

    /// Print the full run as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn request(&self) -> Result<BacktestRequest> {
        let parameters = match &self.params {
            Some(raw) => serde_json::from_str(raw).context("--params must be a JSON object")?,
            None => serde_json::Value::Null,
        };

        Ok(BacktestRequest {
            strategy: self.strategy.clone(),
            symbols: self.symbols.clone(),
            start_date: self.start,
            end_date: self.end,
            initial_capital: self.capital,
            parameters,
            commission_rate: self.commission,
            options: RunOptions {
                valuation: if self.carry_forward {
                    ValuationPolicy::CarryForward
                } else {
                    ValuationPolicy::ZeroIfMissing
                },
                trading_week: if self.egx_week {
                    TradingWeek::SundayToThursday
                } else {
                    TradingWeek::MondayToFriday
                },
                win_rate_method: if self.lot_matched {
                    WinRateMethod::LotMatched
                } else {
                    WinRateMethod::SellCount
                },
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "backtest_runner=info,backtester=info,egx_core=warn,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let request = cli.request()?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let pool = db::create_pool(&config.database).await?;
    if cli.migrate {
        db::run_migrations(&pool).await?;
    }

    let prices = PgPriceStore::new(PriceRepository::new(pool.clone()));
    let mut provider = HistoricalDataProvider::new(Arc::new(prices));
    match MarketDataClient::from_config(&config.market_data)? {
        Some(client) => provider = provider.with_fallback(Arc::new(HttpMarketData::new(client))),
        None => warn!("MARKET_DATA_API_URL not set, running without market data fallback"),
    }

    let store: Arc<dyn RunStore> = if cli.no_persist {
        Arc::new(MemoryRunStore::new())
    } else {
        Arc::new(PgRunStore::new(pool))
    };

    let default_commission = Decimal::try_from(config.backtest.commission_rate)
        .context("backtest.commission_rate is not representable as a decimal")?;
    let service = BacktestService::new(store, provider, default_commission);

    let user_id = Uuid::new_v4();
    let id = service.create_backtest(user_id, request).await?;
    info!(backtest_id = %id, "Backtest started");

    let status = service.wait_for_completion(id).await?;
    let run = service.get_backtest_results(id, user_id).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else if let Some(metrics) = &run.metrics {
        println!("Backtest {} ({}) {}", run.id, run.strategy, status);
        println!("  Final value:       {}", metrics.final_value.round_dp(2));
        println!("  Total return:      {:.2}%", metrics.total_return);
        match metrics.annualized_return {
            Some(rate) => println!("  Annualized return: {:.2}%", rate * 100.0),
            None => println!("  Annualized return: n/a"),
        }
        println!("  Max drawdown:      {:.2}%", metrics.max_drawdown);
        println!("  Sharpe ratio:      {:.3}", metrics.sharpe_ratio);
        println!(
            "  Trades:            {} ({} winning, {} losing)",
            metrics.total_trades, metrics.winning_trades, metrics.losing_trades
        );
        println!("  Commission paid:   {}", metrics.total_commission.round_dp(2));
    }

    if status == RunStatus::Failed {
        bail!(
            "backtest failed: {}",
            run.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(())
}
