//! Day-by-day replay of a strategy over historical bars.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data_store::MarketData;
use crate::metrics::{self, BacktestMetrics, WinRateMethod};
use crate::portfolio::{DailyValuation, PortfolioState, Trade, TradeContext, TradeOutcome};
use crate::strategy::{DayContext, Strategy};

/// How a held symbol without a bar on the valuation day is priced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationPolicy {
    /// The holding contributes nothing that day.
    #[default]
    ZeroIfMissing,
    /// The holding is marked at its last known close.
    CarryForward,
}

/// Which weekdays count as trading days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingWeek {
    #[default]
    MondayToFriday,
    /// The EGX session week.
    SundayToThursday,
}

impl TradingWeek {
    pub fn is_trading_day(&self, weekday: Weekday) -> bool {
        match self {
            TradingWeek::MondayToFriday => !matches!(weekday, Weekday::Sat | Weekday::Sun),
            TradingWeek::SundayToThursday => !matches!(weekday, Weekday::Fri | Weekday::Sat),
        }
    }
}

/// Every date in `[start, end]` that falls on a trading weekday.
pub fn generate_trading_dates(
    start: NaiveDate,
    end: NaiveDate,
    week: TradingWeek,
) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| week.is_trading_day(d.weekday()))
        .collect()
}

/// Configuration for a single simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub initial_capital: Decimal,
    /// Fraction of notional charged per trade (0.001 = 0.1%).
    pub commission_rate: Decimal,
    pub valuation: ValuationPolicy,
    pub trading_week: TradingWeek,
    pub win_rate_method: WinRateMethod,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::new(10000, 0),
            commission_rate: Decimal::new(1, 3), // 0.1%
            valuation: ValuationPolicy::default(),
            trading_week: TradingWeek::default(),
            win_rate_method: WinRateMethod::default(),
        }
    }
}

/// Cooperative cancellation flag, checked between trading days.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How the day loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationStatus {
    Completed,
    Cancelled,
    Failed(String),
}

/// Everything a simulation produced, partial when it did not complete.
#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub status: SimulationStatus,
    pub trades: Vec<Trade>,
    pub valuations: Vec<DailyValuation>,
    pub metrics: BacktestMetrics,
    pub days_processed: usize,
}

pub struct Simulator {
    strategy: Strategy,
    config: SimulatorConfig,
}

impl Simulator {
    pub fn new(strategy: Strategy, config: SimulatorConfig) -> Self {
        Self { strategy, config }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Replay `[start, end]` one trading day at a time.
    ///
    /// Days are strictly sequential. Within a day, signals are applied in
    /// symbol order and the valuation is recorded after the last trade.
    pub fn run(
        &self,
        data: &MarketData,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancelToken,
    ) -> SimulationOutcome {
        let dates = generate_trading_dates(start, end, self.config.trading_week);
        info!(
            strategy = %self.strategy.kind(),
            symbols = data.symbol_count(),
            trading_days = dates.len(),
            "Starting simulation"
        );

        let mut state = PortfolioState::new(self.config.initial_capital);
        let mut status = SimulationStatus::Completed;
        let mut days_processed = 0;

        for (day_index, date) in dates.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                info!(date = %date, days_processed, "Simulation cancelled");
                status = SimulationStatus::Cancelled;
                break;
            }

            let history = data.history_until(date);
            let day = DayContext {
                date,
                day_index,
                run_start: start,
                trading_week: self.config.trading_week,
            };
            let signals = self.strategy.generate(&day, &history);
            let marks = self.marks(data, date);
            let ctx = TradeContext {
                date,
                commission_rate: self.config.commission_rate,
                marks: &marks,
            };

            for signal in &signals {
                let (next, outcome) = state.apply(signal, &ctx);
                state = next;
                if let TradeOutcome::Rejected(reason) = outcome {
                    debug!(
                        symbol = %signal.symbol,
                        date = %date,
                        reason = ?reason,
                        "Signal rejected"
                    );
                }
            }

            if state.cash() < Decimal::ZERO {
                let message = format!("cash went negative on {}: {}", date, state.cash());
                warn!(date = %date, "Ledger invariant broken, stopping simulation");
                status = SimulationStatus::Failed(message);
                break;
            }

            state = state.record_valuation(date, &marks);
            days_processed += 1;
        }

        let (trades, valuations) = state.into_parts();
        let metrics = metrics::compute(
            self.config.initial_capital,
            &valuations,
            &trades,
            self.config.win_rate_method,
        );

        info!(
            strategy = %self.strategy.kind(),
            status = ?status,
            trades = trades.len(),
            total_return = metrics.total_return,
            sharpe = metrics.sharpe_ratio,
            "Simulation finished"
        );

        SimulationOutcome {
            status,
            trades,
            valuations,
            metrics,
            days_processed,
        }
    }

    fn marks(&self, data: &MarketData, date: NaiveDate) -> BTreeMap<String, Decimal> {
        data.symbols()
            .filter_map(|symbol| {
                let price = match self.config.valuation {
                    ValuationPolicy::ZeroIfMissing => data.close_on(symbol, date),
                    ValuationPolicy::CarryForward => data.last_close_through(symbol, date),
                };
                price.map(|p| (symbol.to_string(), p))
            })
            .collect()
    }
}
