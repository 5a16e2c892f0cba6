//! Warming strategies and their schedules

use crate::error::{CacheError, Result};
use crate::warming::executor::WarmingQuery;
use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// When a strategy runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Schedule {
    /// Once, when the scheduler starts
    OnStartup,

    /// Five-field cron expression, evaluated in UTC
    Cron(String),

    /// Fixed interval, first run one interval after registration
    Every(Duration),
}

impl Schedule {
    /// Cron schedule, rejected if the expression does not parse
    pub fn cron(expression: impl Into<String>) -> Result<Self> {
        let schedule = Schedule::Cron(expression.into());
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn is_startup(&self) -> bool {
        matches!(self, Schedule::OnStartup)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::OnStartup => Ok(()),
            Schedule::Cron(expression) => parse_cron(expression).map(|_| ()),
            Schedule::Every(interval) if interval.is_zero() => Err(CacheError::InvalidSchedule {
                expression: self.to_string(),
                reason: "interval must be positive".to_string(),
            }),
            Schedule::Every(_) => Ok(()),
        }
    }

    /// Delay from `now` until the next run; `None` for startup schedules
    pub fn delay_until_next(&self, now: DateTime<Utc>) -> Result<Option<Duration>> {
        match self {
            Schedule::OnStartup => Ok(None),
            Schedule::Every(interval) => Ok(Some(*interval)),
            Schedule::Cron(expression) => {
                let cron = parse_cron(expression)?;
                let next = cron.find_next_occurrence(&now, false).map_err(|e| {
                    CacheError::InvalidSchedule {
                        expression: expression.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some((next - now).to_std().unwrap_or(Duration::ZERO)))
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::OnStartup => write!(f, "startup"),
            Schedule::Cron(expression) => write!(f, "cron({})", expression),
            Schedule::Every(interval) => write!(f, "every({:?})", interval),
        }
    }
}

fn parse_cron(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .parse()
        .map_err(|e| CacheError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// A named bundle of warming queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingStrategy {
    pub name: String,

    /// Startup ordering; lower runs first
    pub priority: u32,

    pub schedule: Schedule,

    pub enabled: bool,

    /// Executed in order, in batches
    pub queries: Vec<WarmingQuery>,
}

impl WarmingStrategy {
    pub fn new(name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            priority: 100,
            schedule,
            enabled: true,
            queries: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn query(mut self, query: WarmingQuery) -> Self {
        self.queries.push(query);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CacheError::ConfigError(
                "strategy name must not be empty".to_string(),
            ));
        }
        self.schedule.validate()
    }
}

/// Outcome of the latest run of a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingMetrics {
    pub queries_warmed: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Wall time of the whole run
    pub total_time: Duration,
    /// Mean execution time of one query
    pub average_query_time: Duration,
    pub last_run: DateTime<Utc>,
}

impl fmt::Display for WarmingMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} queries warmed in {:?} (avg {:?}, last run {})",
            self.success_count,
            self.queries_warmed,
            self.total_time,
            self.average_query_time,
            self.last_run.to_rfc3339()
        )
    }
}
