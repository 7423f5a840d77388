//! Backtest job orchestration.
//!
//! Submissions are validated synchronously and stored as `pending`; the
//! simulation then runs in its own task. Each active job is tracked in a
//! registry holding its status channel and cancellation token, and the whole
//! result is written back to the run store in one batch when the job ends.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::data_store::HistoricalDataProvider;
use crate::error::{BacktestError, Result};
use crate::run::{
    sanitize_error_message, BacktestRequest, BacktestResults, BacktestRun, BacktestSummary, Page,
    RunCompletion, RunStatus, ValidatedRequest,
};
use crate::run_store::RunStore;
use crate::simulator::{CancelToken, SimulationStatus, Simulator};

/// Largest page size `get_user_backtests` serves.
pub const MAX_PAGE_SIZE: u32 = 100;

struct JobHandle {
    status: Arc<watch::Sender<RunStatus>>,
    cancel: CancelToken,
}

struct Inner {
    store: Arc<dyn RunStore>,
    data: HistoricalDataProvider,
    jobs: DashMap<Uuid, JobHandle>,
    default_commission: Decimal,
}

/// Entry point for submitting, inspecting and cancelling backtests.
#[derive(Clone)]
pub struct BacktestService {
    inner: Arc<Inner>,
}

impl BacktestService {
    pub fn new(
        store: Arc<dyn RunStore>,
        data: HistoricalDataProvider,
        default_commission: Decimal,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                data,
                jobs: DashMap::new(),
                default_commission,
            }),
        }
    }

    /// Validate and store a run, then start it in the background.
    ///
    /// Invalid requests fail here with a configuration error and nothing is
    /// stored. The returned id is usable immediately.
    pub async fn create_backtest(&self, user_id: Uuid, request: BacktestRequest) -> Result<Uuid> {
        let today = Utc::now().date_naive();
        let validated = request.validate(today, self.inner.default_commission)?;

        let run = BacktestRun::new(user_id, &validated);
        let id = run.id;
        self.inner.store.insert(&run).await?;

        let (status_tx, _) = watch::channel(RunStatus::Pending);
        let status_tx = Arc::new(status_tx);
        let cancel = CancelToken::new();
        self.inner.jobs.insert(
            id,
            JobHandle {
                status: status_tx.clone(),
                cancel: cancel.clone(),
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_job(inner, id, validated, cancel, status_tx).await;
        });

        info!(
            backtest_id = %id,
            user_id = %user_id,
            strategy = %run.strategy,
            symbols = run.symbols.len(),
            "Backtest submitted"
        );
        Ok(id)
    }

    /// A run owned by `user_id`.
    pub async fn get_backtest_results(&self, id: Uuid, user_id: Uuid) -> Result<BacktestRun> {
        let mut run = self.owned_run(id, user_id).await?;
        run.error_message = run.error_message.as_deref().map(sanitize_error_message);
        Ok(run)
    }

    /// Runs owned by `user_id`, newest first.
    pub async fn get_user_backtests(
        &self,
        user_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<Page<BacktestSummary>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.inner
            .store
            .list_for_user(user_id, page.max(1), limit)
            .await
            .map_err(|e| {
                error!(user_id = %user_id, error = %e, "Failed to list backtests");
                BacktestError::Persistence("failed to list backtests".to_string())
            })
    }

    /// Ask an active run to stop after the current trading day.
    ///
    /// Returns `false` when the run has already finished.
    pub async fn cancel_backtest(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        self.owned_run(id, user_id).await?;
        Ok(self.signal_cancel(id))
    }

    /// Cancel the run if it is active, then remove it.
    pub async fn delete_backtest(&self, id: Uuid, user_id: Uuid) -> Result<()> {
        self.owned_run(id, user_id).await?;
        self.signal_cancel(id);

        if !self.inner.store.delete(id).await? {
            return Err(BacktestError::NotFound(id));
        }
        info!(backtest_id = %id, "Backtest deleted");
        Ok(())
    }

    /// Status updates of an active run. `None` once the run has finished.
    pub fn subscribe(&self, id: Uuid) -> Option<watch::Receiver<RunStatus>> {
        self.inner.jobs.get(&id).map(|job| job.status.subscribe())
    }

    /// Wait until the run reaches a terminal status and return it.
    pub async fn wait_for_completion(&self, id: Uuid) -> Result<RunStatus> {
        if let Some(mut rx) = self.subscribe(id) {
            if let Ok(status) = rx.wait_for(|s| s.is_terminal()).await {
                return Ok(*status);
            }
        }

        let run = self.inner.store.get(id).await?.ok_or(BacktestError::NotFound(id))?;
        Ok(run.status)
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    fn signal_cancel(&self, id: Uuid) -> bool {
        match self.inner.jobs.get(&id) {
            Some(job) => {
                job.cancel.cancel();
                info!(backtest_id = %id, "Backtest cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn owned_run(&self, id: Uuid, user_id: Uuid) -> Result<BacktestRun> {
        let run = self.inner.store.get(id).await.map_err(|e| {
            error!(backtest_id = %id, error = %e, "Failed to load backtest");
            BacktestError::Persistence("failed to load backtest".to_string())
        })?;

        match run {
            Some(run) if run.user_id == user_id => Ok(run),
            _ => Err(BacktestError::NotFound(id)),
        }
    }
}

async fn run_job(
    inner: Arc<Inner>,
    id: Uuid,
    request: ValidatedRequest,
    cancel: CancelToken,
    status: Arc<watch::Sender<RunStatus>>,
) {
    info!(backtest_id = %id, strategy = %request.strategy.kind(), "Starting backtest execution");

    if let Err(e) = inner.store.mark_running(id, Utc::now()).await {
        warn!(backtest_id = %id, error = %e, "Failed to mark backtest running");
    }
    status.send_replace(RunStatus::Running);

    let completion = execute(&inner, id, &request, cancel).await;
    let final_status = completion.status;

    match &completion.error_message {
        Some(message) => error!(backtest_id = %id, error = %message, "Backtest failed"),
        None => info!(backtest_id = %id, status = %final_status, "Backtest finished"),
    }

    if let Err(e) = inner.store.finalize(id, &completion).await {
        error!(backtest_id = %id, error = %e, "Failed to persist backtest results");
    }

    status.send_replace(final_status);
    inner.jobs.remove(&id);
}

async fn execute(
    inner: &Inner,
    id: Uuid,
    request: &ValidatedRequest,
    cancel: CancelToken,
) -> RunCompletion {
    let failed = |message: String| RunCompletion {
        status: RunStatus::Failed,
        metrics: None,
        results: None,
        error_message: Some(sanitize_error_message(&message)),
        completed_at: Utc::now(),
    };

    let data = match inner
        .data
        .load_universe(&request.symbols, request.start_date, request.end_date)
        .await
    {
        Ok(data) => data,
        Err(e) => return failed(e.to_string()),
    };

    let simulator = Simulator::new(request.strategy.clone(), request.simulator_config());
    let (start, end) = (request.start_date, request.end_date);

    let joined = tokio::task::spawn_blocking(move || {
        let outcome = simulator.run(&data, start, end, &cancel);
        (outcome, data.excluded().to_vec())
    })
    .await;

    let (outcome, excluded_symbols) = match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            error!(backtest_id = %id, "Simulation panicked");
            return failed("simulation panicked".to_string());
        }
        Err(e) => return failed(format!("simulation task aborted: {}", e)),
    };

    let (status, error_message) = match outcome.status {
        SimulationStatus::Completed => (RunStatus::Completed, None),
        SimulationStatus::Cancelled => (RunStatus::Cancelled, None),
        SimulationStatus::Failed(message) => {
            (RunStatus::Failed, Some(sanitize_error_message(&message)))
        }
    };

    RunCompletion {
        status,
        metrics: Some(outcome.metrics),
        results: Some(BacktestResults {
            trades: outcome.trades,
            valuations: outcome.valuations,
            excluded_symbols,
            days_processed: outcome.days_processed,
        }),
        error_message,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::StaticMarketData;
    use crate::run::RunOptions;
    use crate::run_store::MemoryRunStore;
    use chrono::NaiveDate;
    use egx_core::types::Bar;
    use serde_json::json;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn service() -> BacktestService {
        let bars = (1..=31)
            .map(|d| Bar::flat(date(d), Decimal::from(100), Decimal::from(1000)))
            .collect();
        let source = StaticMarketData::new().with_series("COMI", bars);
        BacktestService::new(
            Arc::new(MemoryRunStore::new()),
            HistoricalDataProvider::new(Arc::new(source)),
            Decimal::new(1, 3),
        )
    }

    fn request(strategy: &str, symbols: &[&str]) -> BacktestRequest {
        BacktestRequest {
            strategy: strategy.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            start_date: date(1),
            end_date: date(14),
            initial_capital: Decimal::from(10000),
            parameters: json!({"investmentPerSymbol": 10000.0}),
            commission_rate: Some(Decimal::ZERO),
            options: RunOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_completed_run() {
        let service = service();
        let user = Uuid::new_v4();
        let id = service.create_backtest(user, request("buy_and_hold", &["COMI"])).await.unwrap();

        assert_eq!(service.wait_for_completion(id).await.unwrap(), RunStatus::Completed);

        let run = service.get_backtest_results(id, user).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());

        let metrics = run.metrics.unwrap();
        assert_eq!(metrics.final_value, Decimal::from(10000));
        let results = run.results.unwrap();
        assert_eq!(results.trades.len(), 1);
        assert_eq!(results.trades[0].quantity, 100);
        assert_eq!(service.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_stored() {
        let service = service();
        let user = Uuid::new_v4();

        let err = service
            .create_backtest(user, request("golden_cross", &["COMI"]))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(service.get_user_backtests(user, 1, 20).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_oversized_period_rejected_at_submission() {
        let service = service();
        let user = Uuid::new_v4();
        let mut req = request("momentum_rsi", &["COMI"]);
        req.parameters = json!({"rsiPeriod": u64::MAX});

        let err = service.create_backtest(user, req).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("rsiPeriod"));
        assert_eq!(service.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_missing_data_fails_run() {
        let service = service();
        let user = Uuid::new_v4();
        let id = service.create_backtest(user, request("buy_and_hold", &["HRHO"])).await.unwrap();

        assert_eq!(service.wait_for_completion(id).await.unwrap(), RunStatus::Failed);
        let run = service.get_backtest_results(id, user).await.unwrap();
        assert!(run
            .error_message
            .unwrap()
            .contains("no historical data available"));
    }

    #[tokio::test]
    async fn test_other_user_cannot_read() {
        let service = service();
        let id = service
            .create_backtest(Uuid::new_v4(), request("buy_and_hold", &["COMI"]))
            .await
            .unwrap();
        service.wait_for_completion(id).await.unwrap();

        let err = service.get_backtest_results(id, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.to_string(), format!("backtest {} not found or access denied", id));
    }

    #[tokio::test]
    async fn test_cancel_before_first_day() {
        let service = service();
        let user = Uuid::new_v4();
        let id = service.create_backtest(user, request("buy_and_hold", &["COMI"])).await.unwrap();

        // The job has not been polled yet on the current-thread runtime.
        assert!(service.cancel_backtest(id, user).await.unwrap());
        assert_eq!(service.wait_for_completion(id).await.unwrap(), RunStatus::Cancelled);

        let run = service.get_backtest_results(id, user).await.unwrap();
        assert_eq!(run.results.unwrap().days_processed, 0);
        assert!(!service.cancel_backtest(id, user).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_run() {
        let service = service();
        let user = Uuid::new_v4();
        let id = service.create_backtest(user, request("buy_and_hold", &["COMI"])).await.unwrap();
        service.wait_for_completion(id).await.unwrap();

        assert!(service.delete_backtest(id, Uuid::new_v4()).await.is_err());
        service.delete_backtest(id, user).await.unwrap();
        assert!(matches!(
            service.get_backtest_results(id, user).await,
            Err(BacktestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_reports_terminal_status() {
        let service = service();
        let user = Uuid::new_v4();
        let id = service.create_backtest(user, request("buy_and_hold", &["COMI"])).await.unwrap();

        let mut rx = service.subscribe(id).unwrap();
        assert_eq!(*rx.borrow(), RunStatus::Pending);
        let status = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
    }
}
