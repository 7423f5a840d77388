//! Technical indicators over daily price series.
//!
//! All functions are pure and operate on the tail of the input: callers pass
//! the history up to and including the day being evaluated.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndicatorError {
    #[error("need at least {required} observations, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("non-finite value at index {index}")]
    NonFinite { index: usize },

    #[error("period must be positive")]
    ZeroPeriod,
}

pub type Result<T> = std::result::Result<T, IndicatorError>;

fn check_finite(values: &[f64]) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(IndicatorError::NonFinite { index }),
        None => Ok(()),
    }
}

fn require(values: &[f64], required: usize) -> Result<()> {
    if values.len() < required {
        return Err(IndicatorError::InsufficientData {
            required,
            available: values.len(),
        });
    }
    Ok(())
}

/// Arithmetic mean.
pub fn mean(values: &[f64]) -> Result<f64> {
    require(values, 1)?;
    check_finite(values)?;
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> Result<(f64, f64)> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Ok((m, variance.sqrt()))
}

pub fn highest(values: &[f64]) -> Result<f64> {
    require(values, 1)?;
    check_finite(values)?;
    Ok(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn lowest(values: &[f64]) -> Result<f64> {
    require(values, 1)?;
    check_finite(values)?;
    Ok(values.iter().copied().fold(f64::INFINITY, f64::min))
}

/// Trailing simple moving average.
///
/// Element `i` of the output is the mean of `values[i..i + period]`, so the
/// output has `values.len() - period + 1` entries.
pub fn sma(values: &[f64], period: usize) -> Result<Vec<f64>> {
    if period == 0 {
        return Err(IndicatorError::ZeroPeriod);
    }
    require(values, period)?;
    check_finite(values)?;

    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut window_sum: f64 = values[..period].iter().sum();
    out.push(window_sum / period as f64);
    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        out.push(window_sum / period as f64);
    }
    Ok(out)
}

/// Rolling mean and population standard deviation over `window` observations.
pub fn rolling_mean_std(values: &[f64], window: usize) -> Result<Vec<(f64, f64)>> {
    if window == 0 {
        return Err(IndicatorError::ZeroPeriod);
    }
    require(values, window)?;
    values.windows(window).map(mean_std).collect()
}

/// Relative Strength Index over the last `period` price changes.
///
/// Uses simple averages of gains and losses. A window with losses but no
/// gains reads 0, gains but no losses reads 100, and no movement at all
/// reads a neutral 50.
pub fn rsi(closes: &[f64], period: usize) -> Result<f64> {
    if period == 0 {
        return Err(IndicatorError::ZeroPeriod);
    }
    let required = period.checked_add(1).ok_or(IndicatorError::InsufficientData {
        required: usize::MAX,
        available: closes.len(),
    })?;
    require(closes, required)?;
    let window = &closes[closes.len() - required..];
    check_finite(window)?;

    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return Ok(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    Ok(100.0 - 100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_mean_std_population() {
        let (m, s) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!(approx(m, 5.0));
        assert!(approx(s, 2.0));
    }

    #[test]
    fn test_sma() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3).unwrap();
        assert_eq!(out.len(), 3);
        assert!(approx(out[0], 2.0));
        assert!(approx(out[2], 4.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert_eq!(
            sma(&[1.0, 2.0], 3),
            Err(IndicatorError::InsufficientData {
                required: 3,
                available: 2
            })
        );
        assert_eq!(sma(&[1.0], 0), Err(IndicatorError::ZeroPeriod));
    }

    #[test]
    fn test_rolling_mean_std() {
        let out = rolling_mean_std(&[1.0, 3.0, 5.0, 7.0], 2).unwrap();
        assert_eq!(out.len(), 3);
        assert!(approx(out[0].0, 2.0));
        assert!(approx(out[0].1, 1.0));
        assert!(approx(out[2].0, 6.0));
    }

    #[test]
    fn test_rsi_extremes() {
        let falling: Vec<f64> = (0..15).map(|i| 100.0 - i as f64).collect();
        assert!(approx(rsi(&falling, 14).unwrap(), 0.0));

        let rising: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        assert!(approx(rsi(&rising, 14).unwrap(), 100.0));

        let flat = vec![50.0; 15];
        assert!(approx(rsi(&flat, 14).unwrap(), 50.0));
    }

    #[test]
    fn test_rsi_mixed_moves() {
        // gains: 2 + 2 = 4, losses: 1 + 1 = 2 over 4 changes
        // rs = 1.0 / 0.5 = 2, rsi = 100 - 100/3
        let closes = [10.0, 12.0, 11.0, 13.0, 12.0];
        assert!(approx(rsi(&closes, 4).unwrap(), 100.0 - 100.0 / 3.0));
    }

    #[test]
    fn test_rsi_uses_trailing_window_only() {
        // An early crash outside the window must not affect the reading
        let mut closes = vec![100.0, 10.0];
        closes.extend((0..5).map(|i| 20.0 + i as f64));
        assert!(approx(rsi(&closes, 4).unwrap(), 100.0));
    }

    #[test]
    fn test_rsi_period_at_usize_max() {
        assert_eq!(
            rsi(&[1.0, 2.0, 3.0], usize::MAX),
            Err(IndicatorError::InsufficientData {
                required: usize::MAX,
                available: 3
            })
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        assert_eq!(
            rsi(&[1.0, f64::NAN, 2.0], 2),
            Err(IndicatorError::NonFinite { index: 1 })
        );
        assert!(highest(&[1.0, f64::INFINITY]).is_err());
    }

    #[test]
    fn test_highest_lowest() {
        assert!(approx(highest(&[3.0, 9.0, 1.0]).unwrap(), 9.0));
        assert!(approx(lowest(&[3.0, 9.0, 1.0]).unwrap(), 1.0));
    }
}
