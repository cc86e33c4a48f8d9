//! Batchwise - a rate-limited batch engine for remote completion APIs.
//!
//! Batchwise queues API calls, runs them through a fixed worker pool while
//! staying under the service's requests-per-minute and tokens-per-minute
//! budgets, and collects the successful responses as result rows.

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;

pub use error::{BatchError, Result};
