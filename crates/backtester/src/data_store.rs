//! Historical daily bars for backtests.
//!
//! Bars come from the persisted `stock_prices` table first. A symbol the
//! store has nothing for (or a store error) falls through to the external
//! market-data API. Everything handed to the simulator is sorted ascending,
//! deduplicated by date and restricted to the requested range.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use egx_core::api::MarketDataClient;
use egx_core::db::PriceRepository;
use egx_core::types::{normalize_series, normalize_symbol, Bar};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::{BacktestError, Result};
use crate::strategy::PriceHistory;

/// A source of daily bars.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn daily_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>>;
}

/// Bars persisted by the market data collector.
#[derive(Clone)]
pub struct PgPriceStore {
    repository: PriceRepository,
}

impl PgPriceStore {
    pub fn new(repository: PriceRepository) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl MarketDataSource for PgPriceStore {
    async fn daily_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        Ok(self.repository.daily_bars(symbol, start, end).await?)
    }
}

/// The external chart API.
#[derive(Clone)]
pub struct HttpMarketData {
    client: MarketDataClient,
}

impl HttpMarketData {
    pub fn new(client: MarketDataClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketData {
    async fn daily_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        Ok(self.client.daily_bars(symbol, start, end).await?)
    }
}

/// Fixed in-memory series, keyed by canonical symbol.
#[derive(Debug, Clone, Default)]
pub struct StaticMarketData {
    series: HashMap<String, Vec<Bar>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, symbol: &str, bars: Vec<Bar>) -> Self {
        self.insert(symbol, bars);
        self
    }

    pub fn insert(&mut self, symbol: &str, bars: Vec<Bar>) {
        self.series.insert(normalize_symbol(symbol), bars);
    }
}

#[async_trait]
impl MarketDataSource for StaticMarketData {
    async fn daily_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        Ok(self
            .series
            .get(&normalize_symbol(symbol))
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Store-first loader with an optional fallback source.
#[derive(Clone)]
pub struct HistoricalDataProvider {
    primary: Arc<dyn MarketDataSource>,
    fallback: Option<Arc<dyn MarketDataSource>>,
}

impl HistoricalDataProvider {
    pub fn new(primary: Arc<dyn MarketDataSource>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn MarketDataSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Bars for one symbol in `[start, end]`, ascending and unique by date.
    pub async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        let primary_error = match self.primary.daily_bars(symbol, start, end).await {
            Ok(bars) if !bars.is_empty() => {
                debug!(symbol = %symbol, count = bars.len(), "Loaded bars from price store");
                return Ok(clean(bars, start, end));
            }
            Ok(_) => None,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Price store query failed");
                Some(e)
            }
        };

        let Some(fallback) = &self.fallback else {
            return match primary_error {
                Some(e) => Err(e),
                None => Ok(Vec::new()),
            };
        };

        warn!(symbol = %symbol, "No stored prices, falling back to market data API");
        let bars = fallback.daily_bars(symbol, start, end).await?;
        debug!(symbol = %symbol, count = bars.len(), "Loaded bars from market data API");
        Ok(clean(bars, start, end))
    }

    /// Load every requested symbol concurrently.
    ///
    /// Symbols without data are excluded; the load fails only when nothing
    /// is left.
    pub async fn load_universe(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MarketData> {
        let fetches = symbols.iter().map(|symbol| async move {
            let result = self.fetch(symbol, start, end).await;
            (symbol.clone(), result)
        });

        let mut series = BTreeMap::new();
        let mut excluded = Vec::new();

        for (symbol, result) in join_all(fetches).await {
            match result {
                Ok(bars) if !bars.is_empty() => {
                    series.insert(symbol, bars);
                }
                Ok(_) => {
                    warn!(symbol = %symbol, "No historical data, excluding symbol");
                    excluded.push(symbol);
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        "Failed to load historical data, excluding symbol"
                    );
                    excluded.push(symbol);
                }
            }
        }

        if series.is_empty() {
            return Err(BacktestError::DataUnavailable(
                "no historical data available".to_string(),
            ));
        }

        info!(
            loaded = series.len(),
            excluded = excluded.len(),
            "Historical data loaded"
        );

        Ok(MarketData { series, excluded })
    }
}

fn clean(bars: Vec<Bar>, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    let mut bars = normalize_series(bars);
    bars.retain(|b| b.date >= start && b.date <= end);
    bars
}

/// Price series for the symbols of one run.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: BTreeMap<String, Vec<Bar>>,
    excluded: Vec<String>,
}

impl MarketData {
    /// Build directly from series; bars are normalized and empty series excluded.
    pub fn from_series(series: impl IntoIterator<Item = (String, Vec<Bar>)>) -> Self {
        let mut data = Self::default();
        for (symbol, bars) in series {
            let bars = normalize_series(bars);
            if bars.is_empty() {
                data.excluded.push(symbol);
            } else {
                data.series.insert(symbol, bars);
            }
        }
        data
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn symbol_count(&self) -> usize {
        self.series.len()
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn bars(&self, symbol: &str) -> Option<&[Bar]> {
        self.series.get(symbol).map(Vec::as_slice)
    }

    /// Bars dated on or before `date`, per symbol. Symbols with no such bar are left out.
    pub fn history_until(&self, date: NaiveDate) -> PriceHistory<'_> {
        self.series
            .iter()
            .filter_map(|(symbol, bars)| {
                let end = bars.partition_point(|b| b.date <= date);
                (end > 0).then(|| (symbol.as_str(), &bars[..end]))
            })
            .collect()
    }

    /// Close on exactly `date`.
    pub fn close_on(&self, symbol: &str, date: NaiveDate) -> Option<Decimal> {
        let bars = self.series.get(symbol)?;
        bars.binary_search_by_key(&date, |b| b.date)
            .ok()
            .map(|i| bars[i].close)
    }

    /// Most recent close on or before `date`.
    pub fn last_close_through(&self, symbol: &str, date: NaiveDate) -> Option<Decimal> {
        let bars = self.series.get(symbol)?;
        let end = bars.partition_point(|b| b.date <= date);
        end.checked_sub(1).map(|i| bars[i].close)
    }
}
