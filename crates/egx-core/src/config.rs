//! Configuration management for the EGX dashboard services.

use crate::{Error, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub backtest: BacktestSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// External market data source used when the price store has no rows.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// Base URL of a Yahoo-chart compatible endpoint. `None` disables the fallback.
    pub api_url: Option<String>,
    /// Suffix appended to EGX tickers for the external source.
    #[serde(default = "default_symbol_suffix")]
    pub symbol_suffix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_symbol_suffix() -> String {
    ".CA".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            symbol_suffix: default_symbol_suffix(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Defaults applied to backtest submissions.
#[derive(Debug, Clone, Deserialize)]
pub struct BacktestSettings {
    /// Commission charged on trade notional (0.001 = 0.1%).
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
}

fn default_commission_rate() -> f64 {
    0.001
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| Error::Config {
                    message: "DATABASE_URL environment variable not set".to_string(),
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_max_connections),
            },
            market_data: MarketDataConfig {
                api_url: env::var("MARKET_DATA_API_URL").ok(),
                symbol_suffix: env::var("MARKET_DATA_SYMBOL_SUFFIX")
                    .unwrap_or_else(|_| default_symbol_suffix()),
                timeout_secs: env::var("MARKET_DATA_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_timeout_secs),
            },
            backtest: BacktestSettings {
                commission_rate: env::var("BACKTEST_COMMISSION_RATE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_commission_rate),
            },
        })
    }

    /// Load configuration from a file, overridden by `EGX_`-prefixed
    /// environment variables (`EGX_DATABASE__URL`, ...).
    #[allow(clippy::result_large_err)]
    pub fn from_file(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("EGX").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    #[allow(clippy::result_large_err)]
    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.backtest.commission_rate) {
            return Err(Error::Config {
                message: format!(
                    "backtest.commission_rate must be in [0, 1), got {}",
                    self.backtest.commission_rate
                ),
            });
        }
        Ok(())
    }

    /// Load configuration for testing (with defaults).
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/egx_test".to_string(),
                max_connections: 2,
            },
            market_data: MarketDataConfig::default(),
            backtest: BacktestSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::test_config();
        assert_eq!(config.market_data.symbol_suffix, ".CA");
        assert!(config.market_data.api_url.is_none());
        assert_eq!(config.backtest.commission_rate, 0.001);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_commission() {
        let mut config = Config::test_config();
        config.backtest.commission_rate = 1.5;
        assert!(config.validate().is_err());
    }
}
