//! Durable storage for backtest runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{BacktestError, Result};
use crate::metrics::BacktestMetrics;
use crate::run::{
    BacktestResults, BacktestRun, BacktestSummary, Page, RunCompletion, RunOptions, RunStatus,
};
use crate::strategy::StrategyKind;

/// Storage backend for backtest runs.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a newly submitted run.
    async fn insert(&self, run: &BacktestRun) -> Result<()>;

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()>;

    /// Write the terminal status, metrics, results and error in one statement.
    async fn finalize(&self, id: Uuid, completion: &RunCompletion) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<BacktestRun>>;

    /// Runs owned by `user_id`, newest first. `page` is one-based.
    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<Page<BacktestSummary>>;

    /// Returns whether a run was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// In-memory run storage for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    runs: Arc<tokio::sync::RwLock<HashMap<Uuid, BacktestRun>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, run: &BacktestRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(BacktestError::Persistence(format!("backtest {} already exists", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(BacktestError::NotFound(id))?;
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        Ok(())
    }

    async fn finalize(&self, id: Uuid, completion: &RunCompletion) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(BacktestError::NotFound(id))?;
        run.status = completion.status;
        run.metrics = completion.metrics.clone();
        run.results = completion.results.clone();
        run.error_message = completion.error_message.clone();
        run.completed_at = Some(completion.completed_at);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BacktestRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<Page<BacktestSummary>> {
        let runs = self.runs.read().await;

        let mut owned: Vec<&BacktestRun> = runs.values().filter(|r| r.user_id == user_id).collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = owned.len() as u64;
        let items = owned
            .into_iter()
            .skip(Page::<BacktestSummary>::offset(page, limit) as usize)
            .take(limit as usize)
            .map(BacktestRun::summary)
            .collect();

        Ok(Page {
            items,
            page: page.max(1),
            limit,
            total,
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.runs.write().await.remove(&id).is_some())
    }
}

/// Run storage in the `backtests` table.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Headline metrics kept in their own `backtests` columns next to the full JSON set.
#[derive(Debug, Default, PartialEq)]
struct MetricColumns {
    final_value: Option<Decimal>,
    total_return: Option<f64>,
    annual_return: Option<f64>,
    max_drawdown: Option<f64>,
    sharpe_ratio: Option<f64>,
    total_trades: Option<i32>,
    winning_trades: Option<i32>,
    losing_trades: Option<i32>,
    win_rate: Option<f64>,
}

impl MetricColumns {
    fn from_metrics(metrics: Option<&BacktestMetrics>) -> Self {
        let Some(m) = metrics else {
            return Self::default();
        };
        let count = |n: usize| Some(i32::try_from(n).unwrap_or(i32::MAX));

        Self {
            final_value: Some(m.final_value),
            total_return: Some(m.total_return),
            annual_return: m.annualized_return,
            max_drawdown: Some(m.max_drawdown),
            sharpe_ratio: Some(m.sharpe_ratio),
            total_trades: count(m.total_trades),
            winning_trades: count(m.winning_trades),
            losing_trades: count(m.losing_trades),
            win_rate: Some(m.win_rate),
        }
    }
}

fn parse_strategy(row: &PgRow) -> Result<StrategyKind> {
    let name: String = row.try_get("strategy_name")?;
    name.parse()
        .map_err(|_| BacktestError::Persistence(format!("unknown stored strategy '{}'", name)))
}

fn run_from_row(row: &PgRow) -> Result<BacktestRun> {
    let status: String = row.try_get("status")?;
    let parameters: Json<serde_json::Value> = row.try_get("strategy_config")?;
    let options: Json<RunOptions> = row.try_get("options")?;
    let metrics: Option<Json<BacktestMetrics>> = row.try_get("metrics")?;
    let results: Option<Json<BacktestResults>> = row.try_get("results_data")?;

    Ok(BacktestRun {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        strategy: parse_strategy(row)?,
        parameters: parameters.0,
        symbols: row.try_get("symbols")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        initial_capital: row.try_get("initial_capital")?,
        commission_rate: row.try_get("commission_rate")?,
        options: options.0,
        status: status.parse()?,
        metrics: metrics.map(|m| m.0),
        results: results.map(|r| r.0),
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<BacktestSummary> {
    let status: String = row.try_get("status")?;

    Ok(BacktestSummary {
        id: row.try_get("id")?,
        strategy: parse_strategy(row)?,
        symbols: row.try_get("symbols")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        initial_capital: row.try_get("initial_capital")?,
        status: status.parse()?,
        total_return: row.try_get("total_return")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait::async_trait]
impl RunStore for PgRunStore {
    async fn insert(&self, run: &BacktestRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backtests (
                id, user_id, strategy_name, strategy_config, options, symbols,
                start_date, end_date, initial_capital, commission_rate,
                status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(run.user_id)
        .bind(run.strategy.id())
        .bind(Json(&run.parameters))
        .bind(Json(&run.options))
        .bind(&run.symbols)
        .bind(run.start_date)
        .bind(run.end_date)
        .bind(run.initial_capital)
        .bind(run.commission_rate)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backtests
            SET status = 'running', started_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BacktestError::NotFound(id));
        }
        Ok(())
    }

    async fn finalize(&self, id: Uuid, completion: &RunCompletion) -> Result<()> {
        let columns = MetricColumns::from_metrics(completion.metrics.as_ref());

        let result = sqlx::query(
            r#"
            UPDATE backtests
            SET status = $2, metrics = $3, results_data = $4, error_message = $5,
                completed_at = $6, final_value = $7, total_return = $8,
                annual_return = $9, max_drawdown = $10, sharpe_ratio = $11,
                total_trades = $12, winning_trades = $13, losing_trades = $14,
                win_rate = $15
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(completion.status.as_str())
        .bind(completion.metrics.as_ref().map(Json))
        .bind(completion.results.as_ref().map(Json))
        .bind(completion.error_message.as_deref())
        .bind(completion.completed_at)
        .bind(columns.final_value)
        .bind(columns.total_return)
        .bind(columns.annual_return)
        .bind(columns.max_drawdown)
        .bind(columns.sharpe_ratio)
        .bind(columns.total_trades)
        .bind(columns.winning_trades)
        .bind(columns.losing_trades)
        .bind(columns.win_rate)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BacktestError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BacktestRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, strategy_name, strategy_config, options, symbols,
                   start_date, end_date, initial_capital, commission_rate,
                   status, metrics, results_data, error_message,
                   created_at, started_at, completed_at
            FROM backtests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<Page<BacktestSummary>> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS count FROM backtests WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        let rows = sqlx::query(
            r#"
            SELECT id, strategy_name, symbols, start_date, end_date, initial_capital,
                   status, total_return,
                   created_at, completed_at
            FROM backtests
            WHERE user_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .bind(Page::<BacktestSummary>::offset(page, limit) as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows.iter().map(summary_from_row).collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            page: page.max(1),
            limit,
            total: total.max(0) as u64,
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backtests WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::BacktestRequest;
    use chrono::{Duration, NaiveDate};
    use rust_decimal::Decimal;
    use tokio_test::{assert_err, assert_ok};

    fn run_for(user_id: Uuid) -> BacktestRun {
        let request = BacktestRequest {
            strategy: "buy_and_hold".to_string(),
            symbols: vec!["COMI".to_string()],
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            initial_capital: Decimal::from(10000),
            parameters: serde_json::Value::Null,
            commission_rate: None,
            options: RunOptions::default(),
        };
        let validated = request
            .validate(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), Decimal::ZERO)
            .unwrap();
        BacktestRun::new(user_id, &validated)
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemoryRunStore::new();
        let run = run_for(Uuid::new_v4());
        assert_ok!(store.insert(&run).await);
        assert_err!(store.insert(&run).await);

        assert_ok!(store.mark_running(run.id, Utc::now()).await);
        assert_eq!(store.get(run.id).await.unwrap().unwrap().status, RunStatus::Running);

        let completion = RunCompletion {
            status: RunStatus::Failed,
            metrics: None,
            results: None,
            error_message: Some("boom".to_string()),
            completed_at: Utc::now(),
        };
        assert_ok!(store.finalize(run.id, &completion).await);

        let stored = store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert!(stored.completed_at.is_some());

        assert!(store.delete(run.id).await.unwrap());
        assert!(!store.delete(run.id).await.unwrap());
        assert!(store.get(run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_missing_run() {
        let store = MemoryRunStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.mark_running(id, Utc::now()).await,
            Err(BacktestError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_list_for_user_pages_newest_first() {
        let store = MemoryRunStore::new();
        let user = Uuid::new_v4();
        let base = Utc::now();

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut run = run_for(user);
            run.created_at = base + Duration::seconds(i);
            ids.push(run.id);
            store.insert(&run).await.unwrap();
        }
        store.insert(&run_for(Uuid::new_v4())).await.unwrap();

        let first = store.list_for_user(user, 1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let last = store.list_for_user(user, 3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].id, ids[0]);
    }

    #[test]
    fn test_metric_columns_follow_metrics() {
        assert_eq!(MetricColumns::from_metrics(None), MetricColumns::default());

        let metrics = crate::metrics::compute(
            Decimal::from(10000),
            &[],
            &[],
            crate::metrics::WinRateMethod::SellCount,
        );
        let columns = MetricColumns::from_metrics(Some(&metrics));
        assert_eq!(columns.final_value, Some(Decimal::from(10000)));
        assert_eq!(columns.total_return, Some(0.0));
        assert_eq!(columns.annual_return, metrics.annualized_return);
        assert_eq!(columns.total_trades, Some(0));
        assert_eq!(columns.win_rate, Some(0.0));
    }

    #[test]
    fn test_migration_defines_stored_columns() {
        let schema = include_str!("../../../migrations/20240101000002_backtests.sql");
        for column in [
            "strategy_name",
            "strategy_config",
            "final_value",
            "total_return",
            "annual_return",
            "max_drawdown",
            "sharpe_ratio",
            "total_trades",
            "winning_trades",
            "losing_trades",
            "win_rate",
            "results_data",
            "completed_at",
        ] {
            assert!(schema.contains(column), "backtests table lacks {}", column);
        }
    }
}
