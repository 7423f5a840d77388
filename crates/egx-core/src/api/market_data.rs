//! HTTP client for an external daily market data source.
//!
//! The endpoint speaks the Yahoo chart schema: parallel arrays of timestamps
//! and OHLCV values, where any entry may be `null` on days the exchange did
//! not print a value.

use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveDate, NaiveTime};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::config::MarketDataConfig;
use crate::types::{normalize_series, Bar};
use crate::{Error, Result};

/// Client for the external market data API.
#[derive(Clone)]
pub struct MarketDataClient {
    base_url: String,
    symbol_suffix: String,
    http_client: reqwest::Client,
}

impl MarketDataClient {
    /// Create a client from configuration. Returns `None` when no URL is configured.
    pub fn from_config(config: &MarketDataConfig) -> Result<Option<Self>> {
        let Some(base_url) = config.api_url.clone() else {
            return Ok(None);
        };

        let http_client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(config.timeout_secs))
            .connect_timeout(StdDuration::from_secs(10))
            .build()?;

        Ok(Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            symbol_suffix: config.symbol_suffix.clone(),
            http_client,
        }))
    }

    pub fn new(base_url: String, symbol_suffix: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            symbol_suffix,
            http_client: reqwest::Client::new(),
        }
    }

    /// Ticker as the external source spells it, e.g. `COMI` -> `COMI.CA`.
    pub fn remote_symbol(&self, symbol: &str) -> String {
        if self.symbol_suffix.is_empty() || symbol.ends_with(&self.symbol_suffix) {
            symbol.to_string()
        } else {
            format!("{}{}", symbol, self.symbol_suffix)
        }
    }

    /// Fetch daily bars for `[start, end]`, ascending by date.
    pub async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let period1 = start.and_time(NaiveTime::MIN).and_utc().timestamp();
        // period2 is exclusive on the remote side
        let period2 = end
            .succ_opt()
            .unwrap_or(end)
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp();

        let url = format!(
            "{}/v8/finance/chart/{}",
            self.base_url,
            self.remote_symbol(symbol)
        );

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Api {
                message: format!("market data request failed: {}", response.status()),
                status: Some(response.status().as_u16()),
            });
        }

        let body: ChartResponse = response.json().await?;
        let bars = parse_chart(body)?
            .into_iter()
            .filter(|b| b.date >= start && b.date <= end)
            .collect::<Vec<_>>();

        debug!(symbol, count = bars.len(), "Fetched bars from market data API");
        Ok(bars)
    }
}

#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Map a chart response onto bars, skipping days with missing values.
pub fn parse_chart(response: ChartResponse) -> Result<Vec<Bar>> {
    if let Some(err) = response.chart.error {
        return Err(Error::Api {
            message: format!("{}: {}", err.code, err.description),
            status: None,
        });
    }

    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let Some(quote) = result.indicators.quote.into_iter().next() else {
        return Ok(Vec::new());
    };

    let value = |series: &[Option<f64>], i: usize| -> Option<Decimal> {
        series
            .get(i)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
            .and_then(Decimal::from_f64)
    };

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(*ts, 0).map(|dt| dt.date_naive()) else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            value(&quote.open, i),
            value(&quote.high, i),
            value(&quote.low, i),
            value(&quote.close, i),
        ) else {
            continue;
        };
        let volume = value(&quote.volume, i).unwrap_or(Decimal::ZERO);
        bars.push(Bar::new(date, open, high, low, close, volume));
    }

    Ok(normalize_series(bars))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(json: &str) -> ChartResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_chart_skips_null_days() {
        // 2024-01-01 08:00 UTC, 2024-01-02 08:00 UTC, 2024-01-03 08:00 UTC
        let response = chart(
            r#"{
                "chart": {
                    "result": [{
                        "timestamp": [1704096000, 1704182400, 1704268800],
                        "indicators": {
                            "quote": [{
                                "open":   [70.1, null, 71.0],
                                "high":   [71.0, null, 72.5],
                                "low":    [69.5, null, 70.2],
                                "close":  [70.8, null, 72.0],
                                "volume": [120000, null, null]
                            }]
                        }
                    }],
                    "error": null
                }
            }"#,
        );

        let bars = parse_chart(response).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(bars[0].close, Decimal::new(708, 1));
        assert_eq!(bars[0].volume, Decimal::new(120000, 0));
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(bars[1].volume, Decimal::ZERO);
    }

    #[test]
    fn test_parse_chart_error_payload() {
        let response = chart(
            r#"{"chart": {"result": null,
                "error": {"code": "Not Found", "description": "No data found"}}}"#,
        );
        let err = parse_chart(response).unwrap_err();
        assert!(err.to_string().contains("No data found"));
    }

    #[test]
    fn test_parse_chart_empty_result() {
        let response = chart(r#"{"chart": {"result": [], "error": null}}"#);
        assert!(parse_chart(response).unwrap().is_empty());
    }

    #[test]
    fn test_remote_symbol() {
        let client = MarketDataClient::new("http://localhost:9000/".to_string(), ".CA".to_string());
        assert_eq!(client.remote_symbol("COMI"), "COMI.CA");
        assert_eq!(client.remote_symbol("COMI.CA"), "COMI.CA");
    }
}
