//! Error types for backtest submission and execution.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BacktestError {
    /// Invalid run configuration, reported synchronously at submission.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No requested symbol produced historical data.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// A single symbol's indicator calculation failed for one day.
    #[error("Signal error for {symbol}: {message}")]
    Signal { symbol: String, message: String },

    /// Run store read or write failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("backtest {0} not found or access denied")]
    NotFound(Uuid),

    /// The day loop could not continue.
    #[error("Simulation error: {0}")]
    Simulation(String),

    #[error(transparent)]
    Core(#[from] egx_core::Error),
}

impl BacktestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<sqlx::Error> for BacktestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for BacktestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, BacktestError>;
