use egx_core::types::Bar;
use serde::{Deserialize, Serialize};

use super::{trailing_closes, DayContext, Signal, SymbolRule, MAX_LOOKBACK};
use crate::indicators::{rolling_mean_std, IndicatorError};
use crate::portfolio::TradeSide;

/// Fade closes that stray more than `deviation_threshold` standard
/// deviations from the trailing mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeanReversionParams {
    pub lookback_period: usize,
    pub deviation_threshold: f64,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        Self {
            lookback_period: 20,
            deviation_threshold: 2.0,
        }
    }
}

impl MeanReversionParams {
    pub(super) fn validate(&self) -> Result<(), String> {
        if !(2..=MAX_LOOKBACK).contains(&self.lookback_period) {
            return Err(format!("lookbackPeriod must be between 2 and {}", MAX_LOOKBACK));
        }
        if !(self.deviation_threshold > 0.0 && self.deviation_threshold.is_finite()) {
            return Err("deviationThreshold must be positive".to_string());
        }
        Ok(())
    }
}

impl SymbolRule for MeanReversionParams {
    fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
        _day: &DayContext,
    ) -> Result<Option<Signal>, IndicatorError> {
        if bars.len() < self.lookback_period {
            return Err(IndicatorError::InsufficientData {
                required: self.lookback_period,
                available: bars.len(),
            });
        }
        // The window includes today's close.
        let closes = trailing_closes(bars, self.lookback_period);
        let (mean, std_dev) = rolling_mean_std(&closes, self.lookback_period)?[0];
        let current = closes[closes.len() - 1];

        // Flat windows carry rounding noise rather than a real deviation.
        if std_dev <= 1e-12 * mean.abs().max(1.0) {
            return Ok(None);
        }

        let z = (current - mean) / std_dev;
        let Some(today) = bars.last() else {
            return Ok(None);
        };

        let action = if z < -self.deviation_threshold {
            TradeSide::Buy
        } else if z > self.deviation_threshold {
            TradeSide::Sell
        } else {
            return Ok(None);
        };

        Ok(Some(Signal {
            symbol: symbol.to_string(),
            action,
            price: today.close,
            reason: format!(
                "close {:.2} is {:.2} standard deviations from the {}-day mean {:.2}",
                current, z, self.lookback_period, mean
            ),
            confidence: z.abs() / self.deviation_threshold,
            quantity: None,
        }))
    }
}
