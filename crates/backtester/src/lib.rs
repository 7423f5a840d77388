//! Backtester
//!
//! Day-by-day strategy simulation over EGX daily price history.
//!
//! # Features
//!
//! - **Strategies**: RSI momentum, mean reversion, breakout and buy-and-hold
//! - **Portfolio Ledger**: Whole-share trades with commission, pure state transitions
//! - **Historical Data**: Price store first, external chart API as fallback
//! - **Metrics**: Returns, drawdown, Sharpe/Sortino and lot-matched win statistics
//! - **Backtest Service**: Background jobs with status channels and cancellation
//!
//! # Example
//!
//! ```ignore
//! use backtester::{
//!     BacktestRequest, BacktestService, HistoricalDataProvider, PgPriceStore, PgRunStore,
//! };
//!
//! let prices = PgPriceStore::new(PriceRepository::new(pool.clone()));
//! let data = HistoricalDataProvider::new(Arc::new(prices));
//! let service = BacktestService::new(Arc::new(PgRunStore::new(pool)), data, Decimal::new(1, 3));
//!
//! let id = service.create_backtest(user_id, request).await?;
//! service.wait_for_completion(id).await?;
//! let run = service.get_backtest_results(id, user_id).await?;
//! println!("Return: {:.2}%", run.metrics.unwrap().total_return);
//! ```

pub mod data_store;
pub mod error;
pub mod indicators;
pub mod metrics;
pub mod portfolio;
pub mod run;
pub mod run_store;
pub mod service;
pub mod simulator;
pub mod strategy;

// Re-exports
pub use data_store::{
    HistoricalDataProvider, HttpMarketData, MarketData, MarketDataSource, PgPriceStore,
    StaticMarketData,
};
pub use error::{BacktestError, Result};
pub use metrics::{BacktestMetrics, RealizedStats, WinRateMethod};
pub use portfolio::{
    DailyValuation, HoldingSnapshot, PortfolioState, Rejection, Trade, TradeContext, TradeOutcome,
    TradeSide,
};
pub use run::{
    BacktestRequest, BacktestResults, BacktestRun, BacktestSummary, Page, RunOptions, RunStatus,
};
pub use run_store::{MemoryRunStore, PgRunStore, RunStore};
pub use service::BacktestService;
pub use simulator::{
    generate_trading_dates, CancelToken, SimulationOutcome, SimulationStatus, Simulator,
    SimulatorConfig, TradingWeek, ValuationPolicy,
};
pub use strategy::{
    BreakoutParams, BuyAndHoldParams, DayContext, MeanReversionParams, MomentumRsiParams, Signal,
    Strategy, StrategyDefaults, StrategyKind,
};
