//! API clients for external services.

pub mod market_data;

pub use market_data::MarketDataClient;
