//! Cache Demo Application
//!
//! Drives a `CacheManager` over the in-memory backend: cache a requirement,
//! read it back, invalidate it through the default rules, then print the
//! health report and metrics. No Redis or Neo4j needed.
//!
//! Usage:
//!   cargo run --example cache_demo
//!
//! Environment variables:
//!   RUST_LOG - log filter (default: info)

use ouroboros_cache::telemetry::init_tracing;
use ouroboros_cache::{
    CacheManager, CacheOptions, CacheSettings, CacheTier, EntityOperation, MemoryBackend,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    info!("=== Tiered Cache Demo ===");

    let settings = CacheSettings::builder().key_prefix("demo").build();
    let manager = CacheManager::with_backend(settings, Arc::new(MemoryBackend::new()), None);
    manager.start().await?;

    let cache = manager.cache();
    let opts = CacheOptions::new().namespace("neo4j").tier(CacheTier::Hot);

    info!("\n--- Write and read ---");
    cache
        .set(
            "requirement:req:42",
            &json!({"id": "req-42", "title": "Login", "status": "active"}),
            &opts,
        )
        .await;
    cache
        .set("project:p1:requirements", &json!(["req-42"]), &opts)
        .await;

    let cached: Option<Value> = cache.get("requirement:req:42", &opts).await;
    info!("requirement:req:42 -> {:?}", cached);
    let missing: Option<Value> = cache.get("requirement:req:404", &opts).await;
    info!("requirement:req:404 -> {:?}", missing);

    info!("\n--- Invalidate through the default rules ---");
    manager
        .invalidate_requirement("42", EntityOperation::Update, Some("p1"))
        .await;

    let after: Option<Value> = cache.get("requirement:req:42", &opts).await;
    info!("requirement:req:42 after update -> {:?}", after);
    info!(
        "project:p1:requirements still cached: {}",
        cache.exists("project:p1:requirements", &opts).await
    );

    info!("\n--- Health ---");
    let health = manager.health_check().await;
    info!("{}", serde_json::to_string_pretty(&health)?);

    info!("\n--- Metrics ---");
    let snapshot = manager.metrics_snapshot();
    info!("{}", snapshot.aggregate);
    for namespace in &snapshot.namespaces {
        info!("{}", namespace);
    }
    info!(
        "rules executed: {}, keys invalidated: {}",
        snapshot.invalidation.rules_executed, snapshot.invalidation.keys_invalidated
    );

    manager.shutdown().await;
    info!("\n=== Demo Complete ===");
    Ok(())
}
