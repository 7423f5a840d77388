//! Backtest run records and submission requests.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use egx_core::types::normalize_symbol;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BacktestError, Result};
use crate::metrics::{BacktestMetrics, WinRateMethod};
use crate::portfolio::{DailyValuation, Trade};
use crate::simulator::{SimulatorConfig, TradingWeek, ValuationPolicy};
use crate::strategy::{Strategy, StrategyDefaults, StrategyKind};

/// Longest error message exposed to callers.
const MAX_ERROR_MESSAGE_LEN: usize = 200;

/// Lifecycle of a run: `pending -> running -> completed | failed | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(BacktestError::Persistence(format!("unknown run status '{}'", other))),
        }
    }
}

/// Simulation knobs a caller may override per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub valuation: ValuationPolicy,
    pub trading_week: TradingWeek,
    pub win_rate_method: WinRateMethod,
}

/// A backtest submission as received from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRequest {
    pub strategy: String,
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub commission_rate: Option<Decimal>,
    #[serde(default)]
    pub options: RunOptions,
}

/// A request that passed validation, with its strategy resolved.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub strategy: Strategy,
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    pub commission_rate: Decimal,
    pub options: RunOptions,
}

impl BacktestRequest {
    /// Check the request against `today` and resolve its strategy.
    pub fn validate(
        &self,
        today: NaiveDate,
        default_commission: Decimal,
    ) -> Result<ValidatedRequest> {
        if self.start_date >= self.end_date {
            return Err(BacktestError::config(format!(
                "start date {} must be before end date {}",
                self.start_date, self.end_date
            )));
        }
        if self.end_date > today {
            return Err(BacktestError::config(format!(
                "end date {} is in the future",
                self.end_date
            )));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::config("initial capital must be positive"));
        }

        let mut symbols: Vec<String> = Vec::with_capacity(self.symbols.len());
        for symbol in self.symbols.iter().map(|s| normalize_symbol(s)) {
            if !symbol.is_empty() && !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        if symbols.is_empty() {
            return Err(BacktestError::config("at least one symbol is required"));
        }

        let commission_rate = self.commission_rate.unwrap_or(default_commission);
        if commission_rate < Decimal::ZERO || commission_rate >= Decimal::ONE {
            return Err(BacktestError::config(format!(
                "commission rate must be in [0, 1), got {}",
                commission_rate
            )));
        }

        let kind: StrategyKind = self.strategy.parse()?;
        let defaults = StrategyDefaults {
            initial_capital: self.initial_capital.to_f64().unwrap_or(0.0),
            symbol_count: symbols.len(),
            commission_rate: commission_rate.to_f64().unwrap_or(0.0),
        };
        let strategy = Strategy::from_config(kind, &self.parameters, &defaults)?;

        Ok(ValidatedRequest {
            strategy,
            symbols,
            start_date: self.start_date,
            end_date: self.end_date,
            initial_capital: self.initial_capital,
            commission_rate,
            options: self.options,
        })
    }
}

impl ValidatedRequest {
    pub fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            initial_capital: self.initial_capital,
            commission_rate: self.commission_rate,
            valuation: self.options.valuation,
            trading_week: self.options.trading_week,
            win_rate_method: self.options.win_rate_method,
        }
    }
}

/// Trade log and valuation series of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResults {
    pub trades: Vec<Trade>,
    pub valuations: Vec<DailyValuation>,
    pub excluded_symbols: Vec<String>,
    pub days_processed: usize,
}

/// A persisted backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRun {
    pub id: Uuid,
    pub user_id: Uuid,
    pub strategy: StrategyKind,
    /// Resolved strategy parameters, defaults included.
    pub parameters: serde_json::Value,
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    pub commission_rate: Decimal,
    pub options: RunOptions,
    pub status: RunStatus,
    pub metrics: Option<BacktestMetrics>,
    pub results: Option<BacktestResults>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BacktestRun {
    /// A new `pending` run.
    pub fn new(user_id: Uuid, request: &ValidatedRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            strategy: request.strategy.kind(),
            parameters: request.strategy.parameters(),
            symbols: request.symbols.clone(),
            start_date: request.start_date,
            end_date: request.end_date,
            initial_capital: request.initial_capital,
            commission_rate: request.commission_rate,
            options: request.options,
            status: RunStatus::Pending,
            metrics: None,
            results: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn summary(&self) -> BacktestSummary {
        BacktestSummary {
            id: self.id,
            strategy: self.strategy,
            symbols: self.symbols.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            initial_capital: self.initial_capital,
            status: self.status,
            total_return: self.metrics.as_ref().map(|m| m.total_return),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Terminal state written in one batch when a job ends.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub metrics: Option<BacktestMetrics>,
    pub results: Option<BacktestResults>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Listing entry without the trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSummary {
    pub id: Uuid,
    pub strategy: StrategyKind,
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    pub status: RunStatus,
    pub total_return: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One page of results, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// One-based.
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn offset(page: u32, limit: u32) -> u64 {
        u64::from(page.max(1) - 1) * u64::from(limit)
    }
}

/// Reduce an internal error message to something safe to show a user:
/// first line only, connection strings redacted, bounded length.
pub fn sanitize_error_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();

    let redacted: Vec<String> = first_line
        .split_whitespace()
        .map(|word| {
            if word.contains("://") {
                "[redacted]".to_string()
            } else {
                word.to_string()
            }
        })
        .collect();
    let cleaned = redacted.join(" ");

    if cleaned.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return cleaned;
    }
    let truncated: String = cleaned.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
    format!("{}...", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn request() -> BacktestRequest {
        BacktestRequest {
            strategy: "momentum_rsi".to_string(),
            symbols: vec!["comi.ca".to_string(), "ETEL".to_string(), "COMI".to_string()],
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            initial_capital: Decimal::from(100_000),
            parameters: json!({"rsiPeriod": 10}),
            commission_rate: None,
            options: RunOptions::default(),
        }
    }

    #[test]
    fn test_validate_normalizes_symbols() {
        let validated = request().validate(today(), Decimal::new(1, 3)).unwrap();
        assert_eq!(validated.symbols, vec!["COMI", "ETEL"]);
        assert_eq!(validated.commission_rate, Decimal::new(1, 3));
        assert_eq!(validated.strategy.kind(), StrategyKind::MomentumRsi);
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let default_commission = Decimal::new(1, 3);

        let mut inverted = request();
        inverted.end_date = inverted.start_date;
        assert!(inverted.validate(today(), default_commission).unwrap_err().is_configuration());

        let mut future = request();
        future.end_date = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        assert!(future.validate(today(), default_commission).is_err());

        let mut no_symbols = request();
        no_symbols.symbols = vec!["  ".to_string()];
        assert!(no_symbols.validate(today(), default_commission).is_err());

        let mut broke = request();
        broke.initial_capital = Decimal::ZERO;
        assert!(broke.validate(today(), default_commission).is_err());

        let mut unknown = request();
        unknown.strategy = "martingale".to_string();
        assert!(unknown.validate(today(), default_commission).is_err());

        let mut commission = request();
        commission.commission_rate = Some(Decimal::ONE);
        assert!(commission.validate(today(), default_commission).is_err());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: BacktestRequest = serde_json::from_value(json!({
            "strategy": "breakout",
            "symbols": ["SWDY"],
            "startDate": "2024-01-01",
            "endDate": "2024-02-01",
            "initialCapital": 50000,
            "options": {"tradingWeek": "sunday_to_thursday"}
        }))
        .unwrap();

        assert!(request.parameters.is_null());
        assert_eq!(request.options.trading_week, TradingWeek::SundayToThursday);
        assert_eq!(request.options.valuation, ValuationPolicy::ZeroIfMissing);
    }

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_sanitize_error_message() {
        let message = "Persistence error: error connecting to postgres://egx:secret@db/egx\n\
                       caused by: timeout";
        assert_eq!(
            sanitize_error_message(message),
            "Persistence error: error connecting to [redacted]"
        );

        let long = "x".repeat(500);
        let sanitized = sanitize_error_message(&long);
        assert_eq!(sanitized.len(), MAX_ERROR_MESSAGE_LEN + 3);
        assert!(sanitized.ends_with("..."));
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(Page::<BacktestSummary>::offset(1, 20), 0);
        assert_eq!(Page::<BacktestSummary>::offset(3, 20), 40);
        assert_eq!(Page::<BacktestSummary>::offset(0, 20), 0);
    }
}
