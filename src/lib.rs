//! EGX Backtest: strategy backtesting for Egyptian Exchange equities
//!
//! This is the root crate that provides benchmark and integration-test access
//! to the workspace crates. For actual functionality, use them directly:
//!
//! - `egx-core`: OHLCV types, configuration, price store, market data client
//! - `backtester`: Strategies, portfolio ledger, metrics, simulator, backtest service
//! - `backtest-runner`: Command-line entry point

// Re-export for benchmarks
pub use backtester as engine;
pub use egx_core as core;
