//! Operational facade over the caching subsystem
//!
//! Wires the backend, tiered store, invalidation engine and warming
//! scheduler together from [`CacheSettings`], and exposes the calls the
//! application makes after domain writes.

use crate::backend::{connect_with_retry, KvBackend, MemoryBackend};
use crate::cache::{NamespaceMetrics, TieredCache};
use crate::config::CacheSettings;
use crate::error::{CacheError, Result};
use crate::graph::GraphQueryExecutor;
use crate::invalidation::{EntityOperation, InvalidationEngine, InvalidationEvent, InvalidationMetrics};
use crate::warming::{QueryExecutor, WarmingMetrics, WarmingScheduler};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Result of [`CacheManager::health_check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Every component below is healthy
    pub healthy: bool,
    /// Backend answers PING
    pub backend: bool,
    /// Store round trip succeeds
    pub cache: bool,
    /// Peer event subscription is active
    pub invalidation: bool,
    /// Scheduler is running, or warming is disabled
    pub warming: bool,
    /// Graph database answers, `None` when not configured
    pub graph: Option<bool>,
    pub errors: Vec<String>,
}

/// Point-in-time metrics of every component
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub aggregate: NamespaceMetrics,
    pub namespaces: Vec<NamespaceMetrics>,
    pub invalidation: InvalidationMetrics,
    pub warming: BTreeMap<String, WarmingMetrics>,
}

pub struct CacheManager {
    settings: CacheSettings,
    backend: Arc<dyn KvBackend>,
    cache: Arc<TieredCache>,
    invalidation: InvalidationEngine,
    warming: Option<WarmingScheduler>,
    graph: Option<Arc<GraphQueryExecutor>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Connect every configured component.
    ///
    /// Without Redis settings the in-memory backend is used. Without Neo4j
    /// settings there is no query executor and warming is unavailable.
    pub async fn connect(settings: CacheSettings) -> Result<Self> {
        settings.validate()?;

        let backend: Arc<dyn KvBackend> = match &settings.redis {
            Some(redis) => Arc::new(connect_with_retry(redis).await?),
            None => {
                warn!("No Redis configured, using in-memory cache backend");
                Arc::new(MemoryBackend::new())
            }
        };

        let cache = Arc::new(TieredCache::new(Arc::clone(&backend), &settings));

        let graph = match &settings.neo4j {
            Some(neo4j) => Some(Arc::new(
                GraphQueryExecutor::connect(neo4j, Arc::clone(&cache)).await?,
            )),
            None => None,
        };
        let executor = graph
            .as_ref()
            .map(|g| Arc::clone(g) as Arc<dyn QueryExecutor>);

        let mut manager = Self::assemble(settings, backend, cache, executor);
        manager.graph = graph;
        Ok(manager)
    }

    /// Build over an existing backend and optional executor, with the
    /// default rules and strategies
    pub fn with_backend(
        settings: CacheSettings,
        backend: Arc<dyn KvBackend>,
        executor: Option<Arc<dyn QueryExecutor>>,
    ) -> Self {
        let cache = Arc::new(TieredCache::new(Arc::clone(&backend), &settings));
        Self::assemble(settings, backend, cache, executor)
    }

    fn assemble(
        settings: CacheSettings,
        backend: Arc<dyn KvBackend>,
        cache: Arc<TieredCache>,
        executor: Option<Arc<dyn QueryExecutor>>,
    ) -> Self {
        let invalidation = InvalidationEngine::with_default_rules(Arc::clone(&cache));
        let warming = executor.map(|executor| {
            WarmingScheduler::with_default_strategies(executor, settings.warming.clone())
        });

        Self {
            settings,
            backend,
            cache,
            invalidation,
            warming,
            graph: None,
            reporter: Mutex::new(None),
        }
    }

    /// Subscribe to peer events, start warming and the metrics reporter
    pub async fn start(&self) -> Result<()> {
        self.invalidation.start().await?;
        if let Some(warming) = &self.warming {
            warming.start().await?;
        }
        self.start_reporter();
        info!(backend = self.backend.kind(), "Cache manager started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = lock(&self.reporter).take() {
            handle.abort();
        }
        if let Some(warming) = &self.warming {
            warming.stop().await;
        }
        self.invalidation.stop();
        info!("Cache manager stopped");
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn invalidation(&self) -> &InvalidationEngine {
        &self.invalidation
    }

    pub fn warming(&self) -> Option<&WarmingScheduler> {
        self.warming.as_ref()
    }

    pub fn graph(&self) -> Option<&Arc<GraphQueryExecutor>> {
        self.graph.as_ref()
    }

    /// Emit an invalidation event for any entity
    pub async fn invalidate_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: EntityOperation,
        data: Option<Value>,
    ) {
        let mut event = InvalidationEvent::new(entity_type, entity_id, operation);
        event.data = data;
        self.invalidation.emit(event).await;
    }

    pub async fn invalidate_requirement(
        &self,
        requirement_id: &str,
        operation: EntityOperation,
        project_id: Option<&str>,
    ) {
        self.invalidate_entity(
            "requirement",
            requirement_id,
            operation,
            project_id.map(|p| json!({ "projectId": p })),
        )
        .await;
    }

    pub async fn invalidate_project(&self, project_id: &str, operation: EntityOperation) {
        self.invalidate_entity(
            "project",
            project_id,
            operation,
            Some(json!({ "projectId": project_id })),
        )
        .await;
    }

    pub async fn invalidate_architecture(
        &self,
        decision_id: &str,
        operation: EntityOperation,
        project_id: Option<&str>,
    ) {
        self.invalidate_entity(
            "architecture",
            decision_id,
            operation,
            project_id.map(|p| json!({ "projectId": p })),
        )
        .await;
    }

    pub async fn invalidate_stakeholder(
        &self,
        stakeholder_id: &str,
        operation: EntityOperation,
        project_id: Option<&str>,
    ) {
        self.invalidate_entity(
            "stakeholder",
            stakeholder_id,
            operation,
            project_id.map(|p| json!({ "projectId": p })),
        )
        .await;
    }

    pub async fn warm_project(&self, project_id: &str) -> Result<WarmingMetrics> {
        Ok(self.scheduler()?.warm_project_data(project_id).await)
    }

    pub async fn warm_user(&self, user_id: &str) -> Result<WarmingMetrics> {
        Ok(self.scheduler()?.warm_user_data(user_id).await)
    }

    fn scheduler(&self) -> Result<&WarmingScheduler> {
        self.warming
            .as_ref()
            .ok_or_else(|| CacheError::ConfigError("no query executor configured".to_string()))
    }

    /// Check every component; never fails, problems are listed in `errors`
    pub async fn health_check(&self) -> HealthReport {
        let mut errors = Vec::new();

        let backend = match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("backend: {}", e));
                false
            }
        };

        let cache = match self.cache.health_probe().await {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("cache: {}", e));
                false
            }
        };

        let invalidation = self.invalidation.is_running();
        if !invalidation {
            errors.push("invalidation: subscriber not running".to_string());
        }

        let warming = match &self.warming {
            Some(scheduler) if self.settings.warming.enabled => {
                let running = scheduler.is_running();
                if !running {
                    errors.push("warming: scheduler not running".to_string());
                }
                running
            }
            _ => true,
        };

        let graph = match &self.graph {
            Some(graph) => Some(match graph.health_check().await {
                Ok(ok) => ok,
                Err(e) => {
                    errors.push(format!("graph: {}", e));
                    false
                }
            }),
            None => None,
        };

        HealthReport {
            healthy: errors.is_empty(),
            backend,
            cache,
            invalidation,
            warming,
            graph,
            errors,
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        snapshot(&self.cache, &self.invalidation, self.warming.as_ref())
    }

    fn start_reporter(&self) {
        let mut slot = lock(&self.reporter);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let period = self.settings.metrics_interval;
        if period.is_zero() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let invalidation = self.invalidation.clone();
        let warming = self.warming.clone();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let snapshot = snapshot(&cache, &invalidation, warming.as_ref());
                info!(
                    hit_ratio = snapshot.aggregate.hit_ratio,
                    requests = snapshot.aggregate.total_requests,
                    keys_invalidated = snapshot.invalidation.keys_invalidated,
                    "Cache metrics: {}",
                    serde_json::to_string(&snapshot).unwrap_or_default()
                );
            }
        }));
    }
}

fn snapshot(
    cache: &TieredCache,
    invalidation: &InvalidationEngine,
    warming: Option<&WarmingScheduler>,
) -> MetricsSnapshot {
    MetricsSnapshot {
        aggregate: cache.aggregate_metrics(),
        namespaces: cache.all_metrics(),
        invalidation: invalidation.metrics(),
        warming: warming.map(|w| w.all_metrics()).unwrap_or_default(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::invalidation::NEO4J_NAMESPACE;

    fn manager() -> CacheManager {
        let settings = CacheSettings::builder().key_prefix("test").build();
        CacheManager::with_backend(settings, Arc::new(MemoryBackend::new()), None)
    }

    #[tokio::test]
    async fn test_invalidate_requirement_uses_default_rules() {
        let manager = manager();
        let opts = CacheOptions::new().namespace(NEO4J_NAMESPACE);
        manager.cache().set("requirement:req:42", &1, &opts).await;
        manager.cache().set("project:p9:summary", &1, &opts).await;

        manager
            .invalidate_requirement("42", EntityOperation::Update, Some("p9"))
            .await;

        assert!(!manager.cache().exists("requirement:req:42", &opts).await);
        assert!(!manager.cache().exists("project:p9:summary", &opts).await);
    }

    #[tokio::test]
    async fn test_health_check_reports_components() {
        let manager = manager();

        let before = manager.health_check().await;
        assert!(before.backend);
        assert!(before.cache);
        assert!(!before.invalidation);
        assert!(!before.healthy);
        assert_eq!(before.graph, None);

        manager.start().await.unwrap();
        let after = manager.health_check().await;
        assert!(after.healthy, "errors: {:?}", after.errors);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_warming_requires_executor() {
        let manager = manager();
        assert!(matches!(
            manager.warm_project("p1").await,
            Err(CacheError::ConfigError(_))
        ));
    }
}
