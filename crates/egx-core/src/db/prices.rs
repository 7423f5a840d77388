//! Database operations for daily stock prices.

use crate::types::Bar;
use crate::Result;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use tracing::debug;

/// Repository for the `stock_prices` table filled by the market data collector.
#[derive(Clone)]
pub struct PriceRepository {
    pool: PgPool,
}

impl PriceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Daily bars for a symbol in `[start, end]`, ascending by date.
    pub async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_date, open, high, low, close, volume
            FROM stock_prices
            WHERE symbol = $1 AND trade_date >= $2 AND trade_date <= $3
            ORDER BY trade_date
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let bars: Vec<Bar> = rows
            .iter()
            .map(|r| Bar {
                date: r.get("trade_date"),
                open: r.get("open"),
                high: r.get("high"),
                low: r.get("low"),
                close: r.get("close"),
                volume: r.get("volume"),
            })
            .collect();

        debug!(symbol, count = bars.len(), "Fetched stored daily bars");
        Ok(bars)
    }
}
