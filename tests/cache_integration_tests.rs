//! Integration tests for the tiered cache store
//!
//! These tests verify the store against the in-memory backend:
//! - Tier TTL ordering
//! - Versioning isolation
//! - Pattern invalidation completeness
//! - Compression round-trip
//! - Corrupted entries and batch operations

use ouroboros_cache::backend::{KvBackend, MemoryBackend};
use ouroboros_cache::cache::{CacheEntry, CacheOptions, CacheTier, TieredCache};
use ouroboros_cache::CacheSettings;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (TieredCache, MemoryBackend) {
    let backend = MemoryBackend::new();
    let settings = CacheSettings::builder()
        .key_prefix("it")
        .default_namespace("default")
        .build();
    (TieredCache::new(Arc::new(backend.clone()), &settings), backend)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Requirement {
    id: String,
    title: String,
    description: String,
    tags: Vec<String>,
}

async fn remaining(cache: &TieredCache, tier: CacheTier) -> Duration {
    cache
        .ttl(&format!("tier:{}", tier), &CacheOptions::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_tier_ttl_ordering() {
    let (cache, _) = setup();

    for tier in [CacheTier::Hot, CacheTier::Warm, CacheTier::Cold] {
        let opts = CacheOptions::new().tier(tier);
        assert!(cache.set(&format!("tier:{}", tier), &"value", &opts).await);
    }

    let hot = remaining(&cache, CacheTier::Hot).await;
    let warm = remaining(&cache, CacheTier::Warm).await;
    let cold = remaining(&cache, CacheTier::Cold).await;

    assert!(cold > warm, "cold {:?} <= warm {:?}", cold, warm);
    assert!(warm > hot, "warm {:?} <= hot {:?}", warm, hot);
    assert!(hot <= Duration::from_secs(300));
}

#[tokio::test]
async fn test_explicit_ttl_overrides_tier() {
    let (cache, _) = setup();
    let opts = CacheOptions::new()
        .tier(CacheTier::Cold)
        .ttl(Duration::from_secs(30));

    cache.set("short", &1, &opts).await;
    let ttl = cache.ttl("short", &opts).await.unwrap();
    assert!(ttl <= Duration::from_secs(30));
}

#[tokio::test]
async fn test_overwrite_reasserts_tier() {
    let (cache, _) = setup();

    cache
        .set("key", &1, &CacheOptions::new().tier(CacheTier::Cold))
        .await;
    cache
        .set("key", &2, &CacheOptions::new().tier(CacheTier::Hot))
        .await;

    let ttl = cache.ttl("key", &CacheOptions::new()).await.unwrap();
    assert!(ttl <= Duration::from_secs(300));
    let value: Option<i32> = cache.get("key", &CacheOptions::new()).await;
    assert_eq!(value, Some(2));
}

#[tokio::test]
async fn test_versioning_isolation() {
    let (cache, _) = setup();
    let v1 = CacheOptions::new().version("1.0");
    let v2 = CacheOptions::new().version("2.0");

    cache.set("schema", &json!({"fields": 1}), &v1).await;
    cache.set("schema", &json!({"fields": 2}), &v2).await;
    cache.set("schema", &json!({"fields": 0}), &CacheOptions::new()).await;

    let one: Option<Value> = cache.get("schema", &v1).await;
    let two: Option<Value> = cache.get("schema", &v2).await;
    assert_eq!(one, Some(json!({"fields": 1})));
    assert_eq!(two, Some(json!({"fields": 2})));

    assert_eq!(cache.invalidate_version("1.0", None).await, 1);

    let one: Option<Value> = cache.get("schema", &v1).await;
    let two: Option<Value> = cache.get("schema", &v2).await;
    let unversioned: Option<Value> = cache.get("schema", &CacheOptions::new()).await;
    assert!(one.is_none());
    assert_eq!(two, Some(json!({"fields": 2})));
    assert_eq!(unversioned, Some(json!({"fields": 0})));
}

#[tokio::test]
async fn test_pattern_invalidation_matches_versioned_keys() {
    let (cache, _) = setup();
    cache.set("user:1", &1, &CacheOptions::new()).await;
    cache
        .set("user:1", &1, &CacheOptions::new().version("3"))
        .await;

    assert_eq!(cache.invalidate_pattern("user:1*", None).await, 2);
}

#[tokio::test]
async fn test_pattern_invalidation_completeness() {
    let (cache, _) = setup();
    let opts = CacheOptions::new().namespace("neo4j");

    // more than one scan page of matching keys
    let matching = 250;
    let others = 40;
    for i in 0..matching {
        cache.set(&format!("project:p1:req:{}", i), &i, &opts).await;
    }
    for i in 0..others {
        cache.set(&format!("project:p2:req:{}", i), &i, &opts).await;
    }
    cache
        .set("project:p1:req:0", &0, &CacheOptions::new().namespace("graphql"))
        .await;

    let removed = cache.invalidate_pattern("project:p1:*", Some("neo4j")).await;
    assert_eq!(removed, matching as u64);

    for i in 0..others {
        assert!(cache.exists(&format!("project:p2:req:{}", i), &opts).await);
    }
    assert!(
        cache
            .exists("project:p1:req:0", &CacheOptions::new().namespace("graphql"))
            .await
    );
    assert_eq!(cache.invalidate_pattern("project:p1:*", Some("neo4j")).await, 0);
}

#[tokio::test]
async fn test_pattern_invalidation_treats_namespace_literally() {
    let (cache, _) = setup();
    let starred = CacheOptions::new().namespace("n*");
    let sibling = CacheOptions::new().namespace("nx");

    cache.set("project:p1", &1, &starred).await;
    cache.set("project:p1", &2, &sibling).await;

    assert_eq!(cache.invalidate_pattern("project:*", Some("n*")).await, 1);
    assert!(!cache.exists("project:p1", &starred).await);
    assert!(cache.exists("project:p1", &sibling).await);
}

#[tokio::test]
async fn test_pattern_invalidation_notifies_peers_only_when_keys_removed() {
    let (cache, backend) = setup();
    let mut notices = backend
        .subscribe(&["pattern-invalidation".to_string()])
        .await
        .unwrap();

    assert_eq!(cache.invalidate_pattern("nothing:*", None).await, 0);

    cache.set("something:1", &1, &CacheOptions::new()).await;
    assert_eq!(cache.invalidate_pattern("something:*", None).await, 1);

    use futures::StreamExt;
    let message = notices.next().await.unwrap();
    let payload: Value = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(payload["pattern"], "something:*");
    assert_eq!(payload["namespace"], "default");
}

#[tokio::test]
async fn test_versioned_write_publishes_key_invalidation() {
    let (cache, backend) = setup();
    let mut notices = backend
        .subscribe(&["key-invalidation".to_string()])
        .await
        .unwrap();

    cache.set("plain", &1, &CacheOptions::new()).await;
    cache
        .set("doc", &1, &CacheOptions::new().namespace("graphql").version("7"))
        .await;

    use futures::StreamExt;
    let message = notices.next().await.unwrap();
    let payload: Value = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(payload["key"], "doc");
    assert_eq!(payload["namespace"], "graphql");
    assert_eq!(payload["version"], "7");
}

#[tokio::test]
async fn test_compression_round_trip() {
    let (cache, backend) = setup();
    let requirement = Requirement {
        id: "req-1".to_string(),
        title: "Large requirement".to_string(),
        description: "The system shall cache query results. ".repeat(600),
        tags: (0..100).map(|i| format!("tag-{}", i)).collect(),
    };

    assert!(cache.set("big", &requirement, &CacheOptions::new()).await);

    let raw = backend.get("it:default:big").await.unwrap().unwrap();
    let entry = CacheEntry::from_bytes(&raw).unwrap();
    assert!(entry.compressed);
    assert!(raw.len() < requirement.description.len());

    let back: Option<Requirement> = cache.get("big", &CacheOptions::new()).await;
    assert_eq!(back, Some(requirement));
}

#[tokio::test]
async fn test_forced_compression_of_small_value() {
    let (cache, backend) = setup();
    cache
        .set("small", &json!({"a": 1}), &CacheOptions::new().compress(true))
        .await;

    let raw = backend.get("it:default:small").await.unwrap().unwrap();
    assert!(CacheEntry::from_bytes(&raw).unwrap().compressed);

    let back: Option<Value> = cache.get("small", &CacheOptions::new()).await;
    assert_eq!(back, Some(json!({"a": 1})));
}

#[tokio::test]
async fn test_corrupted_compressed_entry_reads_as_miss_and_is_evicted() {
    let (cache, backend) = setup();
    let corrupt = json!({
        "payload": "bm90IGd6aXA=",
        "version": null,
        "createdAt": "2024-01-01T00:00:00Z",
        "tier": "WARM",
        "compressed": true
    });
    backend
        .put_raw("it:default:broken", serde_json::to_vec(&corrupt).unwrap())
        .await;

    let value: Option<Value> = cache.get("broken", &CacheOptions::new()).await;
    assert!(value.is_none());
    assert!(!backend.exists("it:default:broken").await.unwrap());

    let metrics = cache.metrics(Some("default")).unwrap();
    assert_eq!(metrics.misses, 1);
}

#[tokio::test]
async fn test_type_mismatch_reads_as_miss() {
    let (cache, _) = setup();
    cache.set("number", &42, &CacheOptions::new()).await;

    let value: Option<Requirement> = cache.get("number", &CacheOptions::new()).await;
    assert!(value.is_none());
}

#[tokio::test]
async fn test_multi_get_and_multi_set() {
    let (cache, _) = setup();
    let opts = CacheOptions::new().namespace("graphql").tier(CacheTier::Hot);

    let entries: Vec<(String, Value)> = (0..5)
        .map(|i| (format!("q:{}", i), json!({ "n": i })))
        .collect();
    assert_eq!(cache.multi_set(&entries, &opts).await, 5);

    let keys: Vec<String> = vec!["q:0".into(), "missing".into(), "q:4".into()];
    let values: Vec<Option<Value>> = cache.multi_get(&keys, &opts).await;
    assert_eq!(values, vec![Some(json!({"n": 0})), None, Some(json!({"n": 4}))]);

    let metrics = cache.metrics(Some("graphql")).unwrap();
    assert_eq!(metrics.hits, 2);
    assert_eq!(metrics.misses, 1);

    let empty: Vec<Option<Value>> = cache.multi_get(&[], &opts).await;
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_metrics_per_namespace() {
    let (cache, _) = setup();
    let neo4j = CacheOptions::new().namespace("neo4j");
    let graphql = CacheOptions::new().namespace("graphql");

    cache.set("a", &1, &neo4j).await;
    let _: Option<i32> = cache.get("a", &neo4j).await;
    let _: Option<i32> = cache.get("a", &neo4j).await;
    let _: Option<i32> = cache.get("b", &neo4j).await;
    let _: Option<i32> = cache.get("a", &graphql).await;

    let neo4j_metrics = cache.metrics(Some("neo4j")).unwrap();
    assert_eq!(neo4j_metrics.total_requests, 3);
    assert!((neo4j_metrics.hit_ratio - 2.0 / 3.0).abs() < 1e-9);

    let aggregate = cache.metrics(None).unwrap();
    assert_eq!(aggregate.total_requests, 4);
    assert_eq!(aggregate.hits, 2);

    assert!(cache.metrics(Some("similarity")).is_none());
    assert_eq!(cache.all_metrics().len(), 2);

    cache.reset_metrics();
    assert!(cache.all_metrics().is_empty());
}

#[tokio::test]
async fn test_delete_and_flush() {
    let (cache, backend) = setup();
    cache.set("a", &1, &CacheOptions::new()).await;
    cache.set("b", &1, &CacheOptions::new()).await;
    cache.set("c", &1, &CacheOptions::new().namespace("keep")).await;

    assert!(cache.delete("a", &CacheOptions::new()).await);
    assert!(!cache.delete("a", &CacheOptions::new()).await);

    assert_eq!(cache.flush(None).await.unwrap(), 1);
    assert_eq!(backend.len().await, 1);
    assert_eq!(cache.flush(Some("keep")).await.unwrap(), 1);
    assert!(backend.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_entries_expire_with_their_tier() {
    let (cache, _) = setup();
    cache
        .set("hot", &1, &CacheOptions::new().tier(CacheTier::Hot))
        .await;
    cache
        .set("warm", &1, &CacheOptions::new().tier(CacheTier::Warm))
        .await;

    tokio::time::advance(Duration::from_secs(301)).await;

    assert!(!cache.exists("hot", &CacheOptions::new()).await);
    assert!(cache.exists("warm", &CacheOptions::new()).await);
}
