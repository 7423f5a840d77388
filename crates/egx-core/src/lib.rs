//! EGX Core Library
//!
//! Shared types, market data clients, and database access for the EGX
//! dashboard and its backtesting engine.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod types;

pub use error::{Error, Result};
