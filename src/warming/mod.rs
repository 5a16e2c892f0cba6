//! # Cache Warming
//!
//! Proactively runs queries through a [`QueryExecutor`] so their results are
//! cached before real traffic asks for them.
//!
//! - **Startup strategies** run once, lowest priority number first
//! - **Recurring strategies** run on a cron expression or fixed interval
//! - **Ad-hoc warming** primes one project, one user or an explicit list
//!
//! Queries inside a strategy run in batches; a failing query is counted and
//! skipped without affecting the rest of the run.

pub mod defaults;
pub mod executor;
pub mod scheduler;
pub mod strategy;

pub use defaults::{
    default_strategies, DAILY_REPORTS_STRATEGY, FREQUENT_STRATEGY, HOURLY_ANALYTICS_STRATEGY,
    STARTUP_STRATEGY,
};
pub use executor::{QueryExecutor, QueryResult, WarmingQuery};
pub use scheduler::WarmingScheduler;
pub use strategy::{Schedule, WarmingMetrics, WarmingStrategy};
