//! Integration tests for the invalidation rule engine
//!
//! Runs the engine over the in-memory backend, which shares one pub/sub bus
//! between every engine built on it, so cross-instance distribution is
//! exercised without Redis.

use ouroboros_cache::backend::{KvBackend, MemoryBackend};
use ouroboros_cache::cache::{CacheOptions, TieredCache, INVALIDATION_CHANNEL};
use ouroboros_cache::invalidation::{
    EntityOperation, InvalidationEngine, InvalidationEvent, InvalidationRule, RuleCondition,
    NEO4J_NAMESPACE,
};
use ouroboros_cache::CacheSettings;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn cache_over(backend: &MemoryBackend) -> Arc<TieredCache> {
    let settings = CacheSettings::builder().key_prefix("inv").build();
    Arc::new(TieredCache::new(Arc::new(backend.clone()), &settings))
}

fn requirement_rule() -> InvalidationRule {
    InvalidationRule::new("req-updated", "Requirement updated", "requirement.updated")
        .pattern("*requirement*{entityId}*")
        .namespace(NEO4J_NAMESPACE)
}

fn neo4j() -> CacheOptions {
    CacheOptions::new().namespace(NEO4J_NAMESPACE)
}

/// Poll until the condition holds or a second passes
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// Keys carry their entity type: a bare `req:42` holds no "requirement"
// segment, so `*requirement*42*` would never reach it.
#[tokio::test]
async fn test_requirement_update_invalidates_entity_typed_key() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine.add_rule(requirement_rule()).await.unwrap();

    cache
        .set("requirement:req:42", &json!({"title": "Login"}), &neo4j())
        .await;
    cache
        .set("requirement:req:7", &json!({"title": "Logout"}), &neo4j())
        .await;

    engine
        .emit(
            InvalidationEvent::new("requirement", "42", EntityOperation::Update)
                .with_data(json!({"projectId": "p1"})),
        )
        .await;

    let value: Option<serde_json::Value> = cache.get("requirement:req:42", &neo4j()).await;
    assert!(value.is_none());
    assert!(cache.exists("requirement:req:7", &neo4j()).await);

    let metrics = engine.metrics();
    assert_eq!(metrics.events_processed, 1);
    assert_eq!(metrics.rules_executed, 1);
    assert_eq!(metrics.keys_invalidated, 1);
    assert_eq!(metrics.rule_invalidations.get("req-updated"), Some(&1));
}

#[tokio::test]
async fn test_templates_resolve_data_fields_across_namespaces() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine
        .add_rule(
            InvalidationRule::new("project-scope", "Project scope", "requirement.updated")
                .pattern("project:{data.projectId}:*")
                .namespaces(["neo4j", "graphql"]),
        )
        .await
        .unwrap();

    for ns in ["neo4j", "graphql", "similarity"] {
        let opts = CacheOptions::new().namespace(ns);
        cache.set("project:p1:requirements", &1, &opts).await;
        cache.set("project:p2:requirements", &1, &opts).await;
    }

    engine
        .emit(
            InvalidationEvent::new("requirement", "42", EntityOperation::Update)
                .with_data(json!({"projectId": "p1"})),
        )
        .await;

    for ns in ["neo4j", "graphql"] {
        let opts = CacheOptions::new().namespace(ns);
        assert!(!cache.exists("project:p1:requirements", &opts).await);
        assert!(cache.exists("project:p2:requirements", &opts).await);
    }
    let similarity = CacheOptions::new().namespace("similarity");
    assert!(cache.exists("project:p1:requirements", &similarity).await);
    assert_eq!(engine.metrics().keys_invalidated, 2);
}

#[tokio::test]
async fn test_condition_gates_execution() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine
        .add_rule(
            requirement_rule().condition(RuleCondition::data_equals("status", "archived")),
        )
        .await
        .unwrap();

    cache.set("requirement:req:42", &1, &neo4j()).await;

    engine
        .emit(
            InvalidationEvent::new("requirement", "42", EntityOperation::Update)
                .with_data(json!({"status": "draft"})),
        )
        .await;
    assert!(cache.exists("requirement:req:42", &neo4j()).await);
    assert_eq!(engine.metrics().rules_executed, 0);

    engine
        .emit(
            InvalidationEvent::new("requirement", "42", EntityOperation::Update)
                .with_data(json!({"status": "archived"})),
        )
        .await;
    assert!(!cache.exists("requirement:req:42", &neo4j()).await);
    assert_eq!(engine.metrics().rules_executed, 1);
    assert_eq!(engine.metrics().events_processed, 2);
}

#[tokio::test]
async fn test_predicate_condition() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine
        .add_rule(requirement_rule().condition(RuleCondition::predicate(|event| {
            event.user_id.as_deref() != Some("importer")
        })))
        .await
        .unwrap();

    cache.set("requirement:req:1", &1, &neo4j()).await;

    engine
        .emit(
            InvalidationEvent::new("requirement", "1", EntityOperation::Update)
                .with_user("importer"),
        )
        .await;
    assert!(cache.exists("requirement:req:1", &neo4j()).await);

    engine
        .emit(InvalidationEvent::new("requirement", "1", EntityOperation::Update).with_user("alice"))
        .await;
    assert!(!cache.exists("requirement:req:1", &neo4j()).await);
}

#[tokio::test]
async fn test_disabled_rule_is_skipped() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine.add_rule(requirement_rule().disabled()).await.unwrap();

    cache.set("requirement:req:42", &1, &neo4j()).await;
    engine
        .emit(InvalidationEvent::new("requirement", "42", EntityOperation::Update))
        .await;
    assert!(cache.exists("requirement:req:42", &neo4j()).await);

    engine.enable_rule("req-updated").await.unwrap();
    engine
        .emit(InvalidationEvent::new("requirement", "42", EntityOperation::Update))
        .await;
    assert!(!cache.exists("requirement:req:42", &neo4j()).await);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_collapses_burst_into_one_execution() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine
        .add_rule(requirement_rule().delay(Duration::from_secs(5)))
        .await
        .unwrap();

    cache.set("requirement:req:42", &1, &neo4j()).await;

    for _ in 0..10 {
        engine
            .emit(InvalidationEvent::new("requirement", "42", EntityOperation::Update))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    assert_eq!(engine.pending_timers(), 1);
    assert!(cache.exists("requirement:req:42", &neo4j()).await);
    assert_eq!(engine.metrics().rules_executed, 0);

    tokio::time::sleep(Duration::from_secs(6)).await;

    let metrics = engine.metrics();
    assert_eq!(metrics.events_processed, 10);
    assert_eq!(metrics.rules_executed, 1);
    assert_eq!(metrics.pending_timers, 0);
    assert!(!cache.exists("requirement:req:42", &neo4j()).await);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_is_per_entity() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine
        .add_rule(requirement_rule().delay(Duration::from_secs(5)))
        .await
        .unwrap();

    for id in ["1", "2", "3"] {
        engine
            .emit(InvalidationEvent::new("requirement", id, EntityOperation::Update))
            .await;
    }
    assert_eq!(engine.pending_timers(), 3);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(engine.metrics().rules_executed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_removing_rule_cancels_pending_timers() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine
        .add_rule(requirement_rule().delay(Duration::from_secs(5)))
        .await
        .unwrap();

    cache.set("requirement:req:42", &1, &neo4j()).await;
    engine
        .emit(InvalidationEvent::new("requirement", "42", EntityOperation::Update))
        .await;
    assert_eq!(engine.pending_timers(), 1);

    engine.remove_rule("req-updated").await.unwrap();
    assert_eq!(engine.pending_timers(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(engine.metrics().rules_executed, 0);
    assert!(cache.exists("requirement:req:42", &neo4j()).await);
}

#[tokio::test]
async fn test_events_reach_peer_instances() {
    let backend = MemoryBackend::new();
    let cache_a = cache_over(&backend);
    let cache_b = cache_over(&backend);

    let engine_a = InvalidationEngine::new(Arc::clone(&cache_a));
    // only B knows a rule for the graphql namespace
    let engine_b = InvalidationEngine::new(Arc::clone(&cache_b));
    engine_b
        .add_rule(
            InvalidationRule::new("gql", "GraphQL requirement", "requirement.updated")
                .pattern("*{entityId}*")
                .namespace("graphql"),
        )
        .await
        .unwrap();

    engine_a.start().await.unwrap();
    engine_b.start().await.unwrap();
    assert_ne!(engine_a.instance_id(), engine_b.instance_id());

    let graphql = CacheOptions::new().namespace("graphql");
    cache_a.set("requirement:42", &1, &graphql).await;

    engine_a
        .emit(InvalidationEvent::new("requirement", "42", EntityOperation::Update))
        .await;

    assert!(
        eventually(|| {
            let cache = Arc::clone(&cache_a);
            let opts = graphql.clone();
            async move { !cache.exists("requirement:42", &opts).await }
        })
        .await,
        "peer instance did not invalidate"
    );

    assert!(
        eventually(|| {
            let engine = engine_b.clone();
            async move { engine.metrics().rules_executed == 1 }
        })
        .await
    );

    // A never replays its own echo
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine_a.metrics().events_processed, 1);
    assert_eq!(engine_b.metrics().events_processed, 1);

    engine_a.stop();
    engine_b.stop();
    assert!(!engine_a.is_running());
}

#[tokio::test]
async fn test_malformed_bus_message_is_dropped() {
    let backend = MemoryBackend::new();
    let cache_a = cache_over(&backend);
    let cache_b = cache_over(&backend);

    let engine_a = InvalidationEngine::new(Arc::clone(&cache_a));
    let engine_b = InvalidationEngine::new(Arc::clone(&cache_b));
    engine_b.add_rule(requirement_rule()).await.unwrap();
    engine_a.start().await.unwrap();
    engine_b.start().await.unwrap();

    backend.publish(INVALIDATION_CHANNEL, "not json").await.unwrap();
    backend
        .publish(INVALIDATION_CHANNEL, r#"{"entityType": 7}"#)
        .await
        .unwrap();

    cache_a.set("requirement:req:42", &1, &neo4j()).await;
    engine_a
        .emit(InvalidationEvent::new("requirement", "42", EntityOperation::Update))
        .await;

    assert!(
        eventually(|| {
            let cache = Arc::clone(&cache_a);
            async move { !cache.exists("requirement:req:42", &neo4j()).await }
        })
        .await,
        "subscriber stopped after a malformed message"
    );
    assert!(engine_b.is_running());
    assert_eq!(engine_b.metrics().events_processed, 1);

    engine_a.stop();
    engine_b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fired_timers_leave_no_pending_entries() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::new(Arc::clone(&cache));
    engine
        .add_rule(requirement_rule().delay(Duration::from_millis(1)))
        .await
        .unwrap();

    for id in 0..50 {
        engine
            .emit(InvalidationEvent::new(
                "requirement",
                id.to_string(),
                EntityOperation::Update,
            ))
            .await;
    }

    assert!(
        eventually(|| {
            let engine = engine.clone();
            async move { engine.metrics().rules_executed == 50 }
        })
        .await
    );
    assert_eq!(engine.pending_timers(), 0);
    assert_eq!(engine.metrics().pending_timers, 0);
}

#[tokio::test]
async fn test_process_event_does_not_publish() {
    let backend = MemoryBackend::new();
    let engine_a = InvalidationEngine::new(cache_over(&backend));
    let engine_b = InvalidationEngine::new(cache_over(&backend));
    engine_b.start().await.unwrap();

    engine_a
        .process_event(InvalidationEvent::new("requirement", "1", EntityOperation::Update))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine_a.metrics().events_processed, 1);
    assert_eq!(engine_b.metrics().events_processed, 0);
    engine_b.stop();
}

#[tokio::test]
async fn test_observers_receive_peer_events() {
    let backend = MemoryBackend::new();
    let engine_a = InvalidationEngine::new(cache_over(&backend));
    let engine_b = InvalidationEngine::new(cache_over(&backend));
    engine_b.start().await.unwrap();
    let mut observed = engine_b.subscribe();

    engine_a
        .emit(
            InvalidationEvent::new("project", "p1", EntityOperation::Delete).with_user("alice"),
        )
        .await;

    let event = tokio::time::timeout(Duration::from_secs(1), observed.recv())
        .await
        .expect("peer event not observed")
        .unwrap();
    assert_eq!(event.event_type, "project.deleted");
    assert_eq!(event.entity_id, "p1");
    assert_eq!(event.user_id.as_deref(), Some("alice"));
    assert_eq!(event.origin.as_deref(), Some(engine_a.instance_id()));
    engine_b.stop();
}

#[tokio::test]
async fn test_default_rules_cover_project_deletion() {
    let backend = MemoryBackend::new();
    let cache = cache_over(&backend);
    let engine = InvalidationEngine::with_default_rules(Arc::clone(&cache));
    assert!(!engine.rules().await.is_empty());

    cache.set("project:p1:summary", &1, &neo4j()).await;
    cache.set("project:p2:summary", &1, &neo4j()).await;

    engine
        .emit(
            InvalidationEvent::new("project", "p1", EntityOperation::Delete)
                .with_data(json!({"projectId": "p1"})),
        )
        .await;

    assert!(!cache.exists("project:p1:summary", &neo4j()).await);
    assert!(cache.exists("project:p2:summary", &neo4j()).await);
}
