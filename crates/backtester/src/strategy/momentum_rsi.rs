use egx_core::types::Bar;
use serde::{Deserialize, Serialize};

use super::{trailing_closes, DayContext, Signal, SymbolRule, MAX_LOOKBACK};
use crate::indicators::{rsi, IndicatorError};
use crate::portfolio::TradeSide;

/// Buy oversold, sell overbought, by RSI over the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MomentumRsiParams {
    pub rsi_period: usize,
    pub oversold_level: f64,
    pub overbought_level: f64,
}

impl Default for MomentumRsiParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            oversold_level: 30.0,
            overbought_level: 70.0,
        }
    }
}

impl MomentumRsiParams {
    pub(super) fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_LOOKBACK).contains(&self.rsi_period) {
            return Err(format!("rsiPeriod must be between 1 and {}", MAX_LOOKBACK));
        }
        if !(self.oversold_level > 0.0
            && self.oversold_level < self.overbought_level
            && self.overbought_level < 100.0)
        {
            return Err(format!(
                "expected 0 < oversoldLevel < overboughtLevel < 100, got {} and {}",
                self.oversold_level, self.overbought_level
            ));
        }
        Ok(())
    }
}

impl SymbolRule for MomentumRsiParams {
    fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
        _day: &DayContext,
    ) -> Result<Option<Signal>, IndicatorError> {
        // rsi_period prior observations plus today
        let closes = trailing_closes(bars, self.rsi_period.saturating_add(1));
        let value = rsi(&closes, self.rsi_period)?;
        let Some(today) = bars.last() else {
            return Ok(None);
        };

        let signal = if value < self.oversold_level {
            Some(Signal {
                symbol: symbol.to_string(),
                action: TradeSide::Buy,
                price: today.close,
                reason: format!("RSI {:.2} below oversold level {}", value, self.oversold_level),
                confidence: (self.oversold_level - value) / self.oversold_level,
                quantity: None,
            })
        } else if value > self.overbought_level {
            Some(Signal {
                symbol: symbol.to_string(),
                action: TradeSide::Sell,
                price: today.close,
                reason: format!(
                    "RSI {:.2} above overbought level {}",
                    value, self.overbought_level
                ),
                confidence: (value - self.overbought_level) / (100.0 - self.overbought_level),
                quantity: None,
            })
        } else {
            None
        };

        Ok(signal)
    }
}
