//! Performance metrics derived from a finished (or partial) simulation.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::portfolio::{DailyValuation, Trade, TradeSide};

/// How the headline win/loss figures are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinRateMethod {
    /// Every sell counts as a win and every other trade as a loss.
    #[default]
    SellCount,
    /// Sells matched FIFO against earlier buys; a sell wins when its
    /// realized P&L, net of commission on both legs, is positive.
    LotMatched,
}

/// Realized results of FIFO lot matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealizedStats {
    pub closed_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub realized_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    /// Gross profit over gross loss; `None` when nothing was lost.
    pub profit_factor: Option<f64>,
}

/// Summary statistics for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestMetrics {
    pub initial_capital: Decimal,
    pub final_value: Decimal,
    pub final_cash: Decimal,
    /// Percent.
    pub total_return: f64,
    /// Fraction per year. `None` when compounding overflows an `f64`.
    pub annualized_return: Option<f64>,
    /// Percent, peak to trough.
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub win_rate_method: WinRateMethod,
    pub total_commission: Decimal,
    pub trading_days: usize,
    pub realized: RealizedStats,
}

impl BacktestMetrics {
    pub fn is_profitable(&self) -> bool {
        self.final_value > self.initial_capital
    }
}

/// Compute metrics over a valuation series and trade log.
///
/// An empty valuation series is treated as a run that never left cash.
pub fn compute(
    initial_capital: Decimal,
    valuations: &[DailyValuation],
    trades: &[Trade],
    method: WinRateMethod,
) -> BacktestMetrics {
    let final_value = valuations
        .last()
        .map(|v| v.total_value)
        .unwrap_or(initial_capital);
    let final_cash = valuations
        .last()
        .map(|v| v.cash)
        .unwrap_or(initial_capital);

    let total_return = if initial_capital > Decimal::ZERO {
        ((final_value - initial_capital) / initial_capital * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    } else {
        0.0
    };

    let annualized_return = annualized_return(initial_capital, final_value, valuations);
    let max_drawdown = max_drawdown(valuations);
    let returns = daily_returns(valuations);
    let (sharpe_ratio, sortino_ratio) = risk_ratios(&returns);

    let realized = lot_matched_stats(trades);
    let total_trades = trades.len();
    let (winning_trades, losing_trades, win_rate) = match method {
        WinRateMethod::SellCount => {
            let sells = trades.iter().filter(|t| t.side == TradeSide::Sell).count();
            let rate = if total_trades > 0 {
                sells as f64 / total_trades as f64
            } else {
                0.0
            };
            (sells, total_trades - sells, rate)
        }
        WinRateMethod::LotMatched => (realized.wins, realized.losses, realized.win_rate),
    };

    BacktestMetrics {
        initial_capital,
        final_value,
        final_cash,
        total_return,
        annualized_return,
        max_drawdown,
        sharpe_ratio,
        sortino_ratio,
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        win_rate_method: method,
        total_commission: trades.iter().map(|t| t.commission).sum(),
        trading_days: valuations.len(),
        realized,
    }
}

fn annualized_return(
    initial: Decimal,
    final_value: Decimal,
    valuations: &[DailyValuation],
) -> Option<f64> {
    let (Some(first), Some(last)) = (valuations.first(), valuations.last()) else {
        return Some(0.0);
    };
    if initial <= Decimal::ZERO {
        return Some(0.0);
    }
    let days = (last.date - first.date).num_days().max(1) as f64;
    let growth = (final_value / initial).to_f64().unwrap_or(1.0);
    if growth <= 0.0 {
        return Some(-1.0);
    }
    Some(growth.powf(365.0 / days) - 1.0).filter(|r| r.is_finite())
}

/// Largest decline from a running peak, in percent.
pub fn max_drawdown(valuations: &[DailyValuation]) -> f64 {
    let Some(first) = valuations.first() else {
        return 0.0;
    };

    let mut peak = first.total_value;
    let mut max_drawdown: f64 = 0.0;

    for valuation in valuations {
        if valuation.total_value > peak {
            peak = valuation.total_value;
        }
        if peak > Decimal::ZERO {
            let drawdown = ((peak - valuation.total_value) / peak * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0);
            max_drawdown = max_drawdown.max(drawdown);
        }
    }

    max_drawdown
}

/// Day-over-day returns of total value. A zero prior value yields a zero return.
pub fn daily_returns(valuations: &[DailyValuation]) -> Vec<f64> {
    valuations
        .windows(2)
        .map(|w| {
            let prev = w[0].total_value;
            let curr = w[1].total_value;
            if prev == Decimal::ZERO {
                0.0
            } else {
                ((curr - prev) / prev).to_f64().unwrap_or(0.0)
            }
        })
        .collect()
}

/// Sharpe and Sortino ratios of daily returns, risk-free rate zero, not annualized.
fn risk_ratios(returns: &[f64]) -> (f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0);
    }

    let mean_return = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| (r - mean_return).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let std_dev = variance.sqrt();

    let sharpe = if std_dev > 0.0 { mean_return / std_dev } else { 0.0 };

    let downside: Vec<f64> = returns.iter().filter(|&&r| r < 0.0).map(|&r| r * r).collect();
    let downside_dev = if downside.is_empty() {
        0.0
    } else {
        (downside.iter().sum::<f64>() / downside.len() as f64).sqrt()
    };
    let sortino = if downside_dev > 0.0 {
        mean_return / downside_dev
    } else {
        0.0
    };

    (sharpe, sortino)
}

struct Lot {
    shares: u64,
    /// Remaining cost basis including the buy commission.
    cost: Decimal,
}

/// Match sells against earlier buys of the same symbol, oldest lot first.
pub fn lot_matched_stats(trades: &[Trade]) -> RealizedStats {
    let mut lots: BTreeMap<&str, VecDeque<Lot>> = BTreeMap::new();
    let mut stats = RealizedStats::default();

    for trade in trades {
        match trade.side {
            TradeSide::Buy => {
                lots.entry(trade.symbol.as_str()).or_default().push_back(Lot {
                    shares: trade.quantity,
                    cost: trade.notional() + trade.commission,
                });
            }
            TradeSide::Sell => {
                let queue = lots.entry(trade.symbol.as_str()).or_default();
                let mut remaining = trade.quantity;
                let mut cost = Decimal::ZERO;

                while remaining > 0 {
                    let Some(lot) = queue.front_mut() else { break };
                    let take = remaining.min(lot.shares);
                    let portion = lot.cost * Decimal::from(take) / Decimal::from(lot.shares);
                    cost += portion;
                    lot.cost -= portion;
                    lot.shares -= take;
                    remaining -= take;
                    if lot.shares == 0 {
                        queue.pop_front();
                    }
                }

                let pnl = trade.notional() - trade.commission - cost;
                stats.closed_trades += 1;
                stats.realized_pnl += pnl;
                if pnl > Decimal::ZERO {
                    stats.wins += 1;
                    stats.gross_profit += pnl;
                } else {
                    stats.losses += 1;
                    stats.gross_loss += -pnl;
                }
            }
        }
    }

    if stats.closed_trades > 0 {
        stats.win_rate = stats.wins as f64 / stats.closed_trades as f64;
    }
    if stats.gross_loss > Decimal::ZERO {
        stats.profit_factor = (stats.gross_profit / stats.gross_loss).to_f64();
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn valuations(values: &[i64]) -> Vec<DailyValuation> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| DailyValuation {
                date: date(1, 1 + i as u32),
                total_value: Decimal::from(*v),
                cash: Decimal::from(*v),
                holdings: BTreeMap::new(),
            })
            .collect()
    }

    fn trade(symbol: &str, side: TradeSide, quantity: u64, price: i64, commission: i64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            side,
            quantity,
            price: Decimal::from(price),
            date: date(1, 2),
            reason: "test".to_string(),
            commission: Decimal::from(commission),
            portfolio_value: Decimal::ZERO,
        }
    }

    #[test]
    fn test_empty_run() {
        let metrics = compute(Decimal::from(10000), &[], &[], WinRateMethod::SellCount);
        assert_eq!(metrics.final_value, Decimal::from(10000));
        assert_eq!(metrics.total_return, 0.0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.trading_days, 0);
    }

    #[test]
    fn test_total_return_is_percent() {
        let metrics = compute(
            Decimal::from(100),
            &valuations(&[100, 105, 110]),
            &[],
            WinRateMethod::SellCount,
        );
        assert!((metrics.total_return - 10.0).abs() < 1e-9);
        assert!(metrics.is_profitable());
    }

    #[test]
    fn test_max_drawdown_uses_running_peak() {
        // peak 120, trough 90
        let dd = max_drawdown(&valuations(&[100, 120, 90, 130]));
        assert!((dd - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_population_std() {
        // returns 0.10 and -0.05: mean 0.025, population std 0.075
        let values: Vec<DailyValuation> = [
            Decimal::new(1000, 1),
            Decimal::new(1100, 1),
            Decimal::new(1045, 1),
        ]
        .iter()
            .enumerate()
            .map(|(i, v)| DailyValuation {
                date: date(1, 1 + i as u32),
                total_value: *v,
                cash: *v,
                holdings: BTreeMap::new(),
            })
            .collect();

        let metrics = compute(Decimal::from(100), &values, &[], WinRateMethod::SellCount);
        assert!((metrics.sharpe_ratio - 1.0 / 3.0).abs() < 1e-9);
        // one downside return of -0.05
        assert!((metrics.sortino_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_constant_returns_have_zero_sharpe() {
        let metrics = compute(
            Decimal::from(100),
            &valuations(&[100, 100, 100]),
            &[],
            WinRateMethod::SellCount,
        );
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.sortino_ratio, 0.0);
    }

    #[test]
    fn test_annualized_return_over_one_year() {
        let mut series = valuations(&[100, 110]);
        series[1].date = date(1, 1) + chrono::Days::new(365);
        let metrics = compute(Decimal::from(100), &series, &[], WinRateMethod::SellCount);
        assert!((metrics.annualized_return.unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_overflowing_annualized_return_survives_json() {
        // 8x in one day compounds past f64::MAX over a year
        let metrics = compute(
            Decimal::from(100),
            &valuations(&[100, 800]),
            &[],
            WinRateMethod::SellCount,
        );
        assert_eq!(metrics.annualized_return, None);

        let json = serde_json::to_string(&metrics).unwrap();
        let decoded: BacktestMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, metrics);
    }

    #[test]
    fn test_sell_count_win_rate() {
        let trades = vec![
            trade("COMI", TradeSide::Buy, 10, 10, 0),
            trade("COMI", TradeSide::Buy, 10, 10, 0),
            trade("ETEL", TradeSide::Buy, 10, 10, 0),
            trade("COMI", TradeSide::Sell, 5, 1, 0),
        ];
        let metrics = compute(
            Decimal::from(1000),
            &valuations(&[1000]),
            &trades,
            WinRateMethod::SellCount,
        );
        assert_eq!(metrics.total_trades, 4);
        // A sell at a loss still counts as a win under this method
        assert_eq!(metrics.winning_trades, 1);
        assert_eq!(metrics.losing_trades, 3);
        assert!((metrics.win_rate - 0.25).abs() < 1e-9);
        assert_eq!(metrics.realized.losses, 1);
    }

    #[test]
    fn test_lot_matching_fifo() {
        let trades = vec![
            trade("COMI", TradeSide::Buy, 10, 10, 0),
            trade("COMI", TradeSide::Buy, 10, 20, 0),
            // cost 10 x 10 + 5 x 20 = 200, proceeds 270
            trade("COMI", TradeSide::Sell, 15, 18, 0),
            // cost 5 x 20 = 100, proceeds 75
            trade("COMI", TradeSide::Sell, 5, 15, 0),
        ];
        let stats = lot_matched_stats(&trades);
        assert_eq!(stats.closed_trades, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.gross_profit, Decimal::from(70));
        assert_eq!(stats.gross_loss, Decimal::from(25));
        assert_eq!(stats.realized_pnl, Decimal::from(45));
        assert!((stats.profit_factor.unwrap() - 2.8).abs() < 1e-9);

        let metrics = compute(
            Decimal::from(1000),
            &valuations(&[1000]),
            &trades,
            WinRateMethod::LotMatched,
        );
        assert_eq!(metrics.winning_trades, 1);
        assert!((metrics.win_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_lot_matching_includes_commission() {
        let trades = vec![
            trade("SWDY", TradeSide::Buy, 10, 10, 1),
            // proceeds 100 - 1 against cost 101
            trade("SWDY", TradeSide::Sell, 10, 10, 1),
        ];
        let stats = lot_matched_stats(&trades);
        assert_eq!(stats.realized_pnl, Decimal::from(-2));
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.profit_factor, Some(0.0));
    }

    #[test]
    fn test_total_commission() {
        let trades = vec![
            trade("SWDY", TradeSide::Buy, 10, 10, 1),
            trade("SWDY", TradeSide::Sell, 10, 10, 2),
        ];
        let metrics = compute(
            Decimal::from(1000),
            &valuations(&[1000]),
            &trades,
            WinRateMethod::SellCount,
        );
        assert_eq!(metrics.total_commission, Decimal::from(3));
    }
}
