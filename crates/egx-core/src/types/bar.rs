//! Daily price bar types for EGX-listed equities.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One trading day of open/high/low/close/volume data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn new(
        date: NaiveDate,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A bar where open, high, low and close are all `price`.
    pub fn flat(date: NaiveDate, price: Decimal, volume: Decimal) -> Self {
        Self::new(date, price, price, price, price, volume)
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(f64::NAN)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(f64::NAN)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(f64::NAN)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(f64::NAN)
    }

    /// Check the bar is internally consistent.
    ///
    /// Prices must be positive, the high must bound the open and close from
    /// above and the low from below, and volume cannot be negative.
    pub fn validate(&self, symbol: &str) -> Result<()> {
        let invalid = |message: String| Error::InvalidBar {
            symbol: symbol.to_string(),
            message,
        };

        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err(invalid(format!("non-positive price on {}", self.date)));
        }
        if self.high < self.low {
            return Err(invalid(format!(
                "high {} below low {} on {}",
                self.high, self.low, self.date
            )));
        }
        if self.open > self.high
            || self.close > self.high
            || self.open < self.low
            || self.close < self.low
        {
            return Err(invalid(format!("open/close outside high-low range on {}", self.date)));
        }
        if self.volume < Decimal::ZERO {
            return Err(invalid(format!("negative volume on {}", self.date)));
        }
        Ok(())
    }
}

/// Sort bars ascending by date and keep only the last bar seen for a date.
pub fn normalize_series(mut bars: Vec<Bar>) -> Vec<Bar> {
    // Stable sort keeps arrival order within a date, so the later duplicate wins.
    bars.sort_by_key(|b| b.date);
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.date == bar.date => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}

/// Canonical ticker form: trimmed, upper-case, without the `.CA` exchange suffix.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_ascii_uppercase();
    upper
        .strip_suffix(".CA")
        .map(str::to_string)
        .unwrap_or(upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_flat_bar_is_valid() {
        let bar = Bar::flat(day(4), Decimal::new(1250, 2), Decimal::new(1000, 0));
        assert!(bar.validate("COMI").is_ok());
        assert_eq!(bar.close_f64(), 12.5);
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let bar = Bar::new(
            day(4),
            Decimal::new(10, 0),
            Decimal::new(9, 0),
            Decimal::new(11, 0),
            Decimal::new(10, 0),
            Decimal::ZERO,
        );
        let err = bar.validate("COMI").unwrap_err();
        assert!(err.to_string().contains("COMI"));
    }

    #[test]
    fn test_validate_rejects_non_positive_price() {
        let bar = Bar::flat(day(4), Decimal::ZERO, Decimal::ONE);
        assert!(bar.validate("HRHO").is_err());
    }

    #[test]
    fn test_normalize_series_sorts_and_dedups() {
        let bars = vec![
            Bar::flat(day(6), Decimal::new(3, 0), Decimal::ONE),
            Bar::flat(day(4), Decimal::new(1, 0), Decimal::ONE),
            Bar::flat(day(6), Decimal::new(4, 0), Decimal::ONE),
            Bar::flat(day(5), Decimal::new(2, 0), Decimal::ONE),
        ];

        let series = normalize_series(bars);
        let dates: Vec<_> = series.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![day(4), day(5), day(6)]);
        assert_eq!(series[2].close, Decimal::new(4, 0));
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol(" comi.ca "), "COMI");
        assert_eq!(normalize_symbol("ETEL"), "ETEL");
    }
}
