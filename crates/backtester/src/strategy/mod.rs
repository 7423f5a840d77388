//! Trading strategies and the signals they emit.
//!
//! Strategies form a closed set. Each variant carries its typed parameters
//! and evaluates one symbol at a time; [`Strategy::generate`] fans a trading
//! day out over all symbols in parallel and returns the signals in symbol
//! order so that the ledger applies them deterministically.

mod breakout;
mod buy_and_hold;
mod mean_reversion;
mod momentum_rsi;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use egx_core::types::Bar;
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BacktestError, Result};
use crate::indicators::IndicatorError;
use crate::portfolio::TradeSide;
use crate::simulator::TradingWeek;

pub use breakout::BreakoutParams;
pub use buy_and_hold::BuyAndHoldParams;
pub use mean_reversion::MeanReversionParams;
pub use momentum_rsi::MomentumRsiParams;

/// A request to trade, produced and consumed within one simulated day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: TradeSide,
    /// Reference price the trade fills at.
    pub price: Decimal,
    pub reason: String,
    pub confidence: f64,
    /// Explicit share count; `None` lets the ledger size the trade.
    pub quantity: Option<u64>,
}

/// Longest indicator window a strategy accepts.
pub const MAX_LOOKBACK: usize = 10_000;

/// Per-symbol bars visible on a trading day (dates up to and including it).
pub type PriceHistory<'a> = BTreeMap<&'a str, &'a [Bar]>;

/// Position of the current day within the run.
#[derive(Debug, Clone, Copy)]
pub struct DayContext {
    pub date: NaiveDate,
    /// Zero on the first trading day of the run.
    pub day_index: usize,
    /// First calendar day of the run.
    pub run_start: NaiveDate,
    pub trading_week: TradingWeek,
}

impl DayContext {
    /// Whether today is the first trading day of the run on which `bars` has a bar.
    pub fn is_first_session_in_run(&self, bars: &[Bar]) -> bool {
        let earlier = &bars[..bars.len().saturating_sub(1)];
        !earlier
            .iter()
            .rev()
            .take_while(|bar| bar.date >= self.run_start)
            .any(|bar| self.trading_week.is_trading_day(bar.date.weekday()))
    }
}

/// Evaluation of a single symbol for a single day.
trait SymbolRule {
    fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
        day: &DayContext,
    ) -> std::result::Result<Option<Signal>, IndicatorError>;
}

/// Strategy identifiers accepted at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MomentumRsi,
    MeanReversion,
    Breakout,
    BuyAndHold,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::MomentumRsi,
        StrategyKind::MeanReversion,
        StrategyKind::Breakout,
        StrategyKind::BuyAndHold,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            StrategyKind::MomentumRsi => "momentum_rsi",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Breakout => "breakout",
            StrategyKind::BuyAndHold => "buy_and_hold",
        }
    }

    fn registry() -> &'static HashMap<&'static str, StrategyKind> {
        static REGISTRY: OnceLock<HashMap<&'static str, StrategyKind>> = OnceLock::new();
        REGISTRY.get_or_init(|| Self::ALL.iter().map(|k| (k.id(), *k)).collect())
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for StrategyKind {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self> {
        Self::registry().get(s.trim()).copied().ok_or_else(|| {
            let known: Vec<_> = Self::ALL.iter().map(|k| k.id()).collect();
            BacktestError::config(format!(
                "unknown strategy '{}', expected one of: {}",
                s,
                known.join(", ")
            ))
        })
    }
}

/// Run-level values some strategies derive their defaults from.
#[derive(Debug, Clone, Copy)]
pub struct StrategyDefaults {
    pub initial_capital: f64,
    pub symbol_count: usize,
    pub commission_rate: f64,
}

/// A configured strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    MomentumRsi(MomentumRsiParams),
    MeanReversion(MeanReversionParams),
    Breakout(BreakoutParams),
    BuyAndHold(BuyAndHoldParams),
}

fn parse_params<P: DeserializeOwned + Default>(
    kind: StrategyKind,
    raw: &serde_json::Value,
) -> Result<P> {
    if raw.is_null() {
        return Ok(P::default());
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| BacktestError::config(format!("invalid {} parameters: {}", kind, e)))
}

impl Strategy {
    /// Build and validate a strategy from its id and raw JSON parameters.
    pub fn from_config(
        kind: StrategyKind,
        raw: &serde_json::Value,
        defaults: &StrategyDefaults,
    ) -> Result<Self> {
        let strategy = match kind {
            StrategyKind::MomentumRsi => Strategy::MomentumRsi(parse_params(kind, raw)?),
            StrategyKind::MeanReversion => Strategy::MeanReversion(parse_params(kind, raw)?),
            StrategyKind::Breakout => Strategy::Breakout(parse_params(kind, raw)?),
            StrategyKind::BuyAndHold => {
                let params: BuyAndHoldParams = parse_params(kind, raw)?;
                Strategy::BuyAndHold(params.resolve(defaults))
            }
        };

        strategy
            .validate()
            .map_err(|msg| BacktestError::config(format!("invalid {} parameters: {}", kind, msg)))?;
        Ok(strategy)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::MomentumRsi(_) => StrategyKind::MomentumRsi,
            Strategy::MeanReversion(_) => StrategyKind::MeanReversion,
            Strategy::Breakout(_) => StrategyKind::Breakout,
            Strategy::BuyAndHold(_) => StrategyKind::BuyAndHold,
        }
    }

    /// Resolved parameters, defaults included.
    pub fn parameters(&self) -> serde_json::Value {
        let value = match self {
            Strategy::MomentumRsi(p) => serde_json::to_value(p),
            Strategy::MeanReversion(p) => serde_json::to_value(p),
            Strategy::Breakout(p) => serde_json::to_value(p),
            Strategy::BuyAndHold(p) => serde_json::to_value(p),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Strategy::MomentumRsi(p) => p.validate(),
            Strategy::MeanReversion(p) => p.validate(),
            Strategy::Breakout(p) => p.validate(),
            Strategy::BuyAndHold(p) => p.validate(),
        }
    }

    fn rule(&self) -> &(dyn SymbolRule + Sync) {
        match self {
            Strategy::MomentumRsi(p) => p,
            Strategy::MeanReversion(p) => p,
            Strategy::Breakout(p) => p,
            Strategy::BuyAndHold(p) => p,
        }
    }

    /// Evaluate one symbol. A symbol without a bar for `day.date` yields nothing.
    pub fn evaluate_symbol(
        &self,
        symbol: &str,
        bars: &[Bar],
        day: &DayContext,
    ) -> Result<Option<Signal>> {
        let today = match bars.last() {
            Some(last) if last.date == day.date => last,
            _ => return Ok(None),
        };
        today.validate(symbol).map_err(|e| BacktestError::Signal {
            symbol: symbol.to_string(),
            message: e.to_string(),
        })?;

        match self.rule().evaluate(symbol, bars, day) {
            Ok(signal) => Ok(signal),
            // Short history is the expected warm-up condition.
            Err(IndicatorError::InsufficientData { .. }) => Ok(None),
            Err(e) => Err(BacktestError::Signal {
                symbol: symbol.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Signals for one trading day, ordered by symbol.
    ///
    /// Symbols are evaluated in parallel. A symbol whose evaluation fails is
    /// logged and skipped for the day.
    pub fn generate(&self, day: &DayContext, history: &PriceHistory<'_>) -> Vec<Signal> {
        let entries: Vec<(&str, &[Bar])> = history.iter().map(|(s, b)| (*s, *b)).collect();

        entries
            .par_iter()
            .filter_map(|(symbol, bars)| match self.evaluate_symbol(symbol, bars, day) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        date = %day.date,
                        day_index = day.day_index,
                        strategy = %self.kind(),
                        error = %e,
                        "Skipping symbol for the day"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Closing prices of the last `n` bars as floats.
fn trailing_closes(bars: &[Bar], n: usize) -> Vec<f64> {
    bars[bars.len().saturating_sub(n)..]
        .iter()
        .map(Bar::close_f64)
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .checked_add_days(chrono::Days::new(n))
            .unwrap()
    }

    /// Consecutive calendar-day bars with the given closes and unit volume.
    pub fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let price = Decimal::try_from(*c).unwrap();
                Bar::flat(day(i as u64), price, Decimal::ONE)
            })
            .collect()
    }

    pub fn context_for(bars: &[Bar], day_index: usize) -> DayContext {
        DayContext {
            date: bars.last().unwrap().date,
            day_index,
            run_start: bars.first().unwrap().date,
            trading_week: TradingWeek::default(),
        }
    }
}
