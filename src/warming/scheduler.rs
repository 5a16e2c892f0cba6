//! Warming scheduler
//!
//! Startup strategies run once, in priority order, when the scheduler
//! starts. Every other enabled strategy gets its own background job that
//! sleeps until the next occurrence of its schedule and then runs. A job
//! is a plain tokio task; disabling or removing a strategy aborts it.
//!
//! Whether a job exists is decided under the strategy table's write lock:
//! `start`, `stop` and the enable/disable/add calls all take it before
//! touching jobs or the running flag, so a toggle during the startup pass
//! is seen by the scheduling pass that follows.

use crate::config::WarmingSettings;
use crate::error::{CacheError, Result};
use crate::warming::defaults;
use crate::warming::executor::{QueryExecutor, WarmingQuery};
use crate::warming::strategy::{Schedule, WarmingMetrics, WarmingStrategy};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct SchedulerInner {
    executor: Arc<dyn QueryExecutor>,
    settings: WarmingSettings,
    strategies: RwLock<BTreeMap<String, WarmingStrategy>>,
    jobs: DashMap<String, JoinHandle<()>>,
    metrics: DashMap<String, WarmingMetrics>,
    running: AtomicBool,
    lifecycle: Mutex<()>,
}

/// Cache warming scheduler; cheap to clone, clones share state
#[derive(Clone)]
pub struct WarmingScheduler {
    inner: Arc<SchedulerInner>,
}

impl WarmingScheduler {
    /// Scheduler with no strategies
    pub fn new(executor: Arc<dyn QueryExecutor>, settings: WarmingSettings) -> Self {
        Self::with_strategies(executor, settings, Vec::new())
    }

    /// Scheduler preloaded with the default strategies
    pub fn with_default_strategies(executor: Arc<dyn QueryExecutor>, settings: WarmingSettings) -> Self {
        Self::with_strategies(executor, settings, defaults::default_strategies())
    }

    /// Scheduler with an initial strategy table; later duplicates replace
    /// earlier ones
    pub fn with_strategies(
        executor: Arc<dyn QueryExecutor>,
        settings: WarmingSettings,
        strategies: Vec<WarmingStrategy>,
    ) -> Self {
        let table: BTreeMap<String, WarmingStrategy> = strategies
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                settings,
                strategies: RwLock::new(table),
                jobs: DashMap::new(),
                metrics: DashMap::new(),
                running: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Run startup strategies, then schedule recurring ones.
    ///
    /// A startup strategy that fails is logged; it does not prevent the
    /// scheduler from starting. Calling `start` again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.running.load(Ordering::SeqCst) {
            debug!("Warming scheduler already running");
            return Ok(());
        }
        if !self.inner.settings.enabled {
            info!("Cache warming disabled, scheduler not started");
            return Ok(());
        }

        info!("Starting warming scheduler");

        if self.inner.settings.run_on_startup {
            let mut startup: Vec<WarmingStrategy> = self
                .inner
                .strategies
                .read()
                .await
                .values()
                .filter(|s| s.enabled && s.schedule.is_startup())
                .cloned()
                .collect();
            startup.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

            for strategy in startup {
                match self.execute_strategy(&strategy.name).await {
                    Ok(_) | Err(CacheError::StrategyDisabled(_)) | Err(CacheError::StrategyNotFound(_)) => {}
                    Err(e) => warn!(strategy = %strategy.name, error = %e, "Startup warming failed"),
                }
            }
        }

        // the table as it is now, not as it was before the startup pass
        let strategies = self.inner.strategies.write().await;
        for strategy in strategies
            .values()
            .filter(|s| s.enabled && !s.schedule.is_startup())
        {
            self.inner.schedule_job(&strategy.name, strategy.schedule.clone());
        }
        self.inner.running.store(true, Ordering::SeqCst);
        drop(strategies);

        info!(jobs = self.inner.jobs.len(), "Warming scheduler started");
        Ok(())
    }

    /// Cancel every recurring job
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        let _strategies = self.inner.strategies.write().await;
        self.inner.running.store(false, Ordering::SeqCst);

        let names: Vec<String> = self.inner.jobs.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.inner.cancel_job(&name);
        }
        info!("Warming scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Names of strategies with an active recurring job, sorted
    pub fn scheduled_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.jobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run one strategy now and record its metrics
    pub async fn execute_strategy(&self, name: &str) -> Result<WarmingMetrics> {
        self.inner.execute_strategy(name).await
    }

    /// Prime the cache for one project
    pub async fn warm_project_data(&self, project_id: &str) -> WarmingMetrics {
        info!(project = %project_id, "Warming project data");
        self.inner.run_queries(&defaults::project_queries(project_id)).await
    }

    /// Prime the cache for one user
    pub async fn warm_user_data(&self, user_id: &str) -> WarmingMetrics {
        info!(user = %user_id, "Warming user data");
        self.inner.run_queries(&defaults::user_queries(user_id)).await
    }

    pub async fn warm_specific_queries(&self, queries: &[WarmingQuery]) -> WarmingMetrics {
        self.inner.run_queries(queries).await
    }

    /// Register a strategy, scheduling it at once if the scheduler runs
    pub async fn add_strategy(&self, strategy: WarmingStrategy) -> Result<()> {
        strategy.validate()?;
        let mut strategies = self.inner.strategies.write().await;
        if strategies.contains_key(&strategy.name) {
            return Err(CacheError::ConfigError(format!(
                "strategy {} already registered",
                strategy.name
            )));
        }
        if self.is_running() && strategy.enabled && !strategy.schedule.is_startup() {
            self.inner
                .schedule_job(&strategy.name, strategy.schedule.clone());
        }
        info!(strategy = %strategy.name, schedule = %strategy.schedule, "Added warming strategy");
        strategies.insert(strategy.name.clone(), strategy);
        Ok(())
    }

    pub async fn remove_strategy(&self, name: &str) -> Result<WarmingStrategy> {
        let mut strategies = self.inner.strategies.write().await;
        let removed = strategies
            .remove(name)
            .ok_or_else(|| CacheError::StrategyNotFound(name.to_string()))?;
        self.inner.cancel_job(name);
        drop(strategies);
        self.inner.metrics.remove(name);
        info!(strategy = %name, "Removed warming strategy");
        Ok(removed)
    }

    /// Enable a strategy and, while running, schedule its job
    pub async fn enable_strategy(&self, name: &str) -> Result<()> {
        let mut strategies = self.inner.strategies.write().await;
        let strategy = strategies
            .get_mut(name)
            .ok_or_else(|| CacheError::StrategyNotFound(name.to_string()))?;
        strategy.enabled = true;

        if self.is_running() && !strategy.schedule.is_startup() {
            self.inner.schedule_job(name, strategy.schedule.clone());
        }
        drop(strategies);
        info!(strategy = %name, "Enabled warming strategy");
        Ok(())
    }

    /// Disable a strategy and tear down its job
    pub async fn disable_strategy(&self, name: &str) -> Result<()> {
        let mut strategies = self.inner.strategies.write().await;
        let strategy = strategies
            .get_mut(name)
            .ok_or_else(|| CacheError::StrategyNotFound(name.to_string()))?;
        strategy.enabled = false;
        self.inner.cancel_job(name);
        drop(strategies);
        info!(strategy = %name, "Disabled warming strategy");
        Ok(())
    }

    pub async fn strategy(&self, name: &str) -> Option<WarmingStrategy> {
        self.inner.strategies.read().await.get(name).cloned()
    }

    /// Every strategy, by priority
    pub async fn strategies(&self) -> Vec<WarmingStrategy> {
        let mut strategies: Vec<WarmingStrategy> =
            self.inner.strategies.read().await.values().cloned().collect();
        strategies.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        strategies
    }

    /// Metrics of a strategy's latest run
    pub fn metrics(&self, name: &str) -> Option<WarmingMetrics> {
        self.inner.metrics.get(name).map(|m| m.clone())
    }

    pub fn all_metrics(&self) -> BTreeMap<String, WarmingMetrics> {
        self.inner
            .metrics
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl SchedulerInner {
    async fn execute_strategy(&self, name: &str) -> Result<WarmingMetrics> {
        let strategy = self
            .strategies
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::StrategyNotFound(name.to_string()))?;

        if !strategy.enabled {
            return Err(CacheError::StrategyDisabled(name.to_string()));
        }

        debug!(strategy = %name, queries = strategy.queries.len(), "Executing warming strategy");
        let metrics = self.run_queries(&strategy.queries).await;
        info!(strategy = %name, "Warming strategy finished: {}", metrics);

        self.metrics.insert(name.to_string(), metrics.clone());
        Ok(metrics)
    }

    /// Run queries in batches; queries within a batch run concurrently
    async fn run_queries(&self, queries: &[WarmingQuery]) -> WarmingMetrics {
        let start = Instant::now();
        let batch_size = self.settings.batch_size.max(1);
        let mut success_count = 0;
        let mut failure_count = 0;
        let mut query_time = Duration::ZERO;

        for batch in queries.chunks(batch_size) {
            let results = join_all(batch.iter().map(|query| self.warm_query(query))).await;
            for (elapsed, ok) in results {
                query_time += elapsed;
                if ok {
                    success_count += 1;
                } else {
                    failure_count += 1;
                }
            }
        }

        WarmingMetrics {
            queries_warmed: queries.len(),
            success_count,
            failure_count,
            total_time: start.elapsed(),
            average_query_time: if queries.is_empty() {
                Duration::ZERO
            } else {
                query_time / queries.len() as u32
            },
            last_run: Utc::now(),
        }
    }

    async fn warm_query(&self, query: &WarmingQuery) -> (Duration, bool) {
        let start = Instant::now();
        match self
            .executor
            .execute(&query.query, &query.params, query.tier, false)
            .await
        {
            Ok(result) => {
                debug!(
                    query = %query.description,
                    tier = %query.tier,
                    from_cache = result.from_cache,
                    "Warmed query"
                );
                (start.elapsed(), true)
            }
            Err(e) => {
                warn!(query = %query.description, error = %e, "Warming query failed");
                (start.elapsed(), false)
            }
        }
    }

    fn schedule_job(self: &Arc<Self>, name: &str, schedule: Schedule) {
        debug!(strategy = %name, schedule = %schedule, "Scheduling warming job");
        let inner = Arc::clone(self);
        let job_name = name.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let delay = match schedule.delay_until_next(Utc::now()) {
                    Ok(Some(delay)) => delay,
                    Ok(None) => return,
                    Err(e) => {
                        error!(strategy = %job_name, error = %e, "Invalid warming schedule");
                        return;
                    }
                };
                tokio::time::sleep(delay).await;

                if let Err(e) = inner.execute_strategy(&job_name).await {
                    warn!(strategy = %job_name, error = %e, "Scheduled warming failed");
                }
            }
        });

        if let Some(previous) = self.jobs.insert(name.to_string(), handle) {
            previous.abort();
        }
    }

    fn cancel_job(&self, name: &str) {
        if let Some((_, handle)) = self.jobs.remove(name) {
            handle.abort();
            debug!(strategy = %name, "Cancelled warming job");
        }
    }
}
