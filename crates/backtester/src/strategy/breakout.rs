use egx_core::types::Bar;
use serde::{Deserialize, Serialize};

use super::{DayContext, Signal, SymbolRule, MAX_LOOKBACK};
use crate::indicators::{highest, lowest, sma, IndicatorError};
use crate::portfolio::TradeSide;

/// Break size, relative to the broken level, that maps to full confidence.
const FULL_CONFIDENCE_BREAK: f64 = 0.05;

/// Trade closes outside the prior range when volume confirms the move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakoutParams {
    pub lookback_period: usize,
    pub volume_multiplier: f64,
}

impl Default for BreakoutParams {
    fn default() -> Self {
        Self {
            lookback_period: 20,
            volume_multiplier: 1.5,
        }
    }
}

impl BreakoutParams {
    pub(super) fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_LOOKBACK).contains(&self.lookback_period) {
            return Err(format!("lookbackPeriod must be between 1 and {}", MAX_LOOKBACK));
        }
        if !(self.volume_multiplier >= 0.0 && self.volume_multiplier.is_finite()) {
            return Err("volumeMultiplier must be non-negative".to_string());
        }
        Ok(())
    }
}

impl SymbolRule for BreakoutParams {
    fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
        _day: &DayContext,
    ) -> Result<Option<Signal>, IndicatorError> {
        let required = self.lookback_period.saturating_add(1);
        if bars.len() < required {
            return Err(IndicatorError::InsufficientData {
                required,
                available: bars.len(),
            });
        }
        let (prior, today) = bars.split_at(bars.len() - 1);
        let today = &today[0];
        let prior = &prior[prior.len() - self.lookback_period..];

        let highs: Vec<f64> = prior.iter().map(Bar::high_f64).collect();
        let lows: Vec<f64> = prior.iter().map(Bar::low_f64).collect();
        let volumes: Vec<f64> = prior.iter().map(Bar::volume_f64).collect();

        let range_high = highest(&highs)?;
        let range_low = lowest(&lows)?;
        let avg_volume = sma(&volumes, self.lookback_period)?[0];

        let close = today.close_f64();
        let volume = today.volume_f64();
        if !close.is_finite() || !volume.is_finite() {
            return Err(IndicatorError::NonFinite { index: bars.len() - 1 });
        }

        if volume <= avg_volume * self.volume_multiplier {
            return Ok(None);
        }

        let (action, level, reason) = if close > range_high {
            (
                TradeSide::Buy,
                range_high,
                format!(
                    "close {:.2} broke above {}-day high {:.2}",
                    close, self.lookback_period, range_high
                ),
            )
        } else if close < range_low {
            (
                TradeSide::Sell,
                range_low,
                format!(
                    "close {:.2} broke below {}-day low {:.2}",
                    close, self.lookback_period, range_low
                ),
            )
        } else {
            return Ok(None);
        };

        let break_size = (close - level).abs() / level;
        Ok(Some(Signal {
            symbol: symbol.to_string(),
            action,
            price: today.close,
            reason,
            confidence: (break_size / FULL_CONFIDENCE_BREAK).clamp(0.0, 1.0),
            quantity: None,
        }))
    }
}
