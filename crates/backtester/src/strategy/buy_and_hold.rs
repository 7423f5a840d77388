use egx_core::types::Bar;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use super::{DayContext, Signal, StrategyDefaults, SymbolRule};
use crate::indicators::IndicatorError;
use crate::portfolio::TradeSide;

/// Buy a fixed amount of every symbol on its first trading day in the run and hold.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuyAndHoldParams {
    /// Cash to put into each symbol. When unset, capital is split evenly
    /// with room left for commission.
    pub investment_per_symbol: Option<f64>,
}

impl BuyAndHoldParams {
    pub(super) fn resolve(self, defaults: &StrategyDefaults) -> Self {
        if self.investment_per_symbol.is_some() {
            return self;
        }
        let symbols = defaults.symbol_count.max(1) as f64;
        Self {
            investment_per_symbol: Some(
                defaults.initial_capital / symbols / (1.0 + defaults.commission_rate),
            ),
        }
    }

    pub(super) fn validate(&self) -> Result<(), String> {
        match self.investment_per_symbol {
            Some(v) if v > 0.0 && v.is_finite() => Ok(()),
            Some(v) => Err(format!("investmentPerSymbol must be positive, got {}", v)),
            None => Err("investmentPerSymbol is required".to_string()),
        }
    }
}

impl SymbolRule for BuyAndHoldParams {
    fn evaluate(
        &self,
        symbol: &str,
        bars: &[Bar],
        day: &DayContext,
    ) -> Result<Option<Signal>, IndicatorError> {
        if !day.is_first_session_in_run(bars) {
            return Ok(None);
        }
        let (Some(today), Some(investment)) = (bars.last(), self.investment_per_symbol) else {
            return Ok(None);
        };

        let open = today.open.to_f64().unwrap_or(f64::NAN);
        if !open.is_finite() {
            return Err(IndicatorError::NonFinite { index: bars.len() - 1 });
        }
        let quantity = (investment / open).floor();
        if quantity < 1.0 {
            return Ok(None);
        }

        Ok(Some(Signal {
            symbol: symbol.to_string(),
            action: TradeSide::Buy,
            price: today.open,
            reason: format!("initial allocation of {:.2}", investment),
            confidence: 1.0,
            quantity: Some(quantity as u64),
        }))
    }
}
