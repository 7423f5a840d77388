//! Portfolio ledger: cash, share holdings, trade log and daily valuations.
//!
//! Every mutation is a state transition that consumes the current
//! [`PortfolioState`] and returns the next one, so a simulation holds exactly
//! one owner of its ledger and a caller can keep a clone to compare before and
//! after.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::strategy::Signal;

/// Share of available cash a buy without an explicit quantity spends.
const DEFAULT_BUY_CASH_FRACTION: Decimal = Decimal::from_parts(1, 0, 0, false, 1); // 0.1

/// Direction of a trade or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// A filled trade. Immutable once appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: u64,
    pub price: Decimal,
    pub date: NaiveDate,
    pub reason: String,
    pub commission: Decimal,
    /// Portfolio value immediately after the fill, at the day's marks.
    pub portfolio_value: Decimal,
}

impl Trade {
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// One symbol's contribution to a daily valuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub shares: u64,
    pub price: Decimal,
    pub value: Decimal,
}

/// End-of-day portfolio valuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyValuation {
    pub date: NaiveDate,
    pub total_value: Decimal,
    pub cash: Decimal,
    pub holdings: BTreeMap<String, HoldingSnapshot>,
}

/// Why a signal did not turn into a trade.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    ZeroQuantity,
    InvalidPrice(Decimal),
    InsufficientCash { required: Decimal, available: Decimal },
    InsufficientShares { held: u64, requested: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    Filled(Trade),
    Rejected(Rejection),
}

impl TradeOutcome {
    pub fn trade(&self) -> Option<&Trade> {
        match self {
            TradeOutcome::Filled(trade) => Some(trade),
            TradeOutcome::Rejected(_) => None,
        }
    }
}

/// Inputs a trade needs besides the signal itself.
#[derive(Debug, Clone, Copy)]
pub struct TradeContext<'a> {
    pub date: NaiveDate,
    pub commission_rate: Decimal,
    /// Closing marks for the day. Held symbols missing here are valued at zero.
    pub marks: &'a BTreeMap<String, Decimal>,
}

/// Ledger owned by a single simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    cash: Decimal,
    holdings: BTreeMap<String, u64>,
    trades: Vec<Trade>,
    valuations: Vec<DailyValuation>,
}

impl PortfolioState {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            cash: initial_cash,
            holdings: BTreeMap::new(),
            trades: Vec::new(),
            valuations: Vec::new(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Currently held symbols; never contains a zero entry.
    pub fn holdings(&self) -> &BTreeMap<String, u64> {
        &self.holdings
    }

    pub fn shares(&self, symbol: &str) -> u64 {
        self.holdings.get(symbol).copied().unwrap_or(0)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn valuations(&self) -> &[DailyValuation] {
        &self.valuations
    }

    pub fn into_parts(self) -> (Vec<Trade>, Vec<DailyValuation>) {
        (self.trades, self.valuations)
    }

    /// Quantity a signal trades once defaults are applied.
    ///
    /// Buys without an explicit quantity spend 10% of cash, sells without one
    /// release half of the current holding. Both round down to whole shares.
    pub fn resolve_quantity(&self, signal: &Signal) -> u64 {
        if let Some(quantity) = signal.quantity {
            return quantity;
        }
        match signal.action {
            TradeSide::Buy => {
                if signal.price <= Decimal::ZERO {
                    return 0;
                }
                (self.cash * DEFAULT_BUY_CASH_FRACTION / signal.price)
                    .floor()
                    .to_u64()
                    .unwrap_or(0)
            }
            TradeSide::Sell => self.shares(&signal.symbol) / 2,
        }
    }

    /// Apply one signal. Rejected signals leave the state untouched.
    pub fn apply(mut self, signal: &Signal, ctx: &TradeContext<'_>) -> (Self, TradeOutcome) {
        if signal.price <= Decimal::ZERO {
            return (self, TradeOutcome::Rejected(Rejection::InvalidPrice(signal.price)));
        }

        let quantity = self.resolve_quantity(signal);
        if quantity == 0 {
            return (self, TradeOutcome::Rejected(Rejection::ZeroQuantity));
        }

        let notional = signal.price * Decimal::from(quantity);
        let commission = notional * ctx.commission_rate;

        match signal.action {
            TradeSide::Buy => {
                let required = notional + commission;
                if self.cash < required {
                    debug!(
                        symbol = %signal.symbol,
                        required = %required,
                        cash = %self.cash,
                        "Insufficient cash for buy"
                    );
                    let available = self.cash;
                    return (
                        self,
                        TradeOutcome::Rejected(Rejection::InsufficientCash {
                            required,
                            available,
                        }),
                    );
                }
                self.cash -= required;
                *self.holdings.entry(signal.symbol.clone()).or_insert(0) += quantity;
            }
            TradeSide::Sell => {
                let held = self.shares(&signal.symbol);
                if held < quantity {
                    debug!(
                        symbol = %signal.symbol,
                        held,
                        requested = quantity,
                        "Insufficient shares for sell"
                    );
                    return (
                        self,
                        TradeOutcome::Rejected(Rejection::InsufficientShares {
                            held,
                            requested: quantity,
                        }),
                    );
                }
                self.cash += notional - commission;
                let remaining = held - quantity;
                if remaining == 0 {
                    self.holdings.remove(&signal.symbol);
                } else {
                    self.holdings.insert(signal.symbol.clone(), remaining);
                }
            }
        }

        let trade = Trade {
            symbol: signal.symbol.clone(),
            side: signal.action,
            quantity,
            price: signal.price,
            date: ctx.date,
            reason: signal.reason.clone(),
            commission,
            portfolio_value: self.market_value(ctx.marks),
        };
        self.trades.push(trade.clone());

        (self, TradeOutcome::Filled(trade))
    }

    /// Cash plus every holding at its mark. A holding without a mark counts as zero.
    pub fn market_value(&self, marks: &BTreeMap<String, Decimal>) -> Decimal {
        self.cash
            + self
                .holdings
                .iter()
                .map(|(symbol, shares)| {
                    marks
                        .get(symbol)
                        .map(|price| *price * Decimal::from(*shares))
                        .unwrap_or(Decimal::ZERO)
                })
                .sum::<Decimal>()
    }

    /// Append the end-of-day valuation for `date`.
    pub fn record_valuation(mut self, date: NaiveDate, marks: &BTreeMap<String, Decimal>) -> Self {
        let holdings = self
            .holdings
            .iter()
            .map(|(symbol, shares)| {
                let price = marks.get(symbol).copied().unwrap_or(Decimal::ZERO);
                (
                    symbol.clone(),
                    HoldingSnapshot {
                        shares: *shares,
                        price,
                        value: price * Decimal::from(*shares),
                    },
                )
            })
            .collect();

        let valuation = DailyValuation {
            date,
            total_value: self.market_value(marks),
            cash: self.cash,
            holdings,
        };
        self.valuations.push(valuation);
        self
    }
}
