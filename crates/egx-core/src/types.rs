//! Core domain types for the EGX dashboard.

pub mod bar;

pub use bar::*;
