//! # Ouroboros Cache (ouroboros-cache)
//!
//! Multi-tier caching for the requirements/architecture graph: a tiered
//! Redis store, a rule-driven invalidation engine and a scheduled cache
//! warmer, sharing one key-value backend and a pub/sub bus.
//!
//! ## Features
//!
//! - HOT / WARM / COLD tiers with per-tier TTL defaults
//! - Versioned keys and glob-pattern invalidation per namespace
//! - Transparent gzip compression of large payloads
//! - Event-triggered, templated, debounced invalidation rules
//! - Cross-instance invalidation over Redis pub/sub
//! - Startup, interval and cron warming strategies
//! - Single-node and cluster Redis, or an in-memory backend
//!
//! ## Tiered Store
//!
//! ```no_run
//! use ouroboros_cache::{CacheManager, CacheOptions, CacheSettings, CacheTier};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = CacheManager::connect(CacheSettings::from_env()?).await?;
//!     manager.start().await?;
//!
//!     let opts = CacheOptions::new().namespace("neo4j").tier(CacheTier::Hot);
//!     manager
//!         .cache()
//!         .set("requirement:req:42", &serde_json::json!({"status": "active"}), &opts)
//!         .await;
//!
//!     let cached: Option<serde_json::Value> =
//!         manager.cache().get("requirement:req:42", &opts).await;
//!     println!("Cached: {:?}", cached);
//!     Ok(())
//! }
//! ```
//!
//! ## Invalidation
//!
//! Domain writes emit events; matching rules delete every cached key their
//! templates resolve to, on this instance and on its peers.
//!
//! ```no_run
//! use ouroboros_cache::{CacheManager, CacheSettings, EntityOperation};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = CacheManager::connect(CacheSettings::from_env()?).await?;
//!     manager.start().await?;
//!
//!     manager
//!         .invalidate_requirement("42", EntityOperation::Update, Some("p1"))
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Warming
//!
//! ```no_run
//! use ouroboros_cache::{CacheManager, CacheSettings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = CacheManager::connect(CacheSettings::from_env()?).await?;
//!     manager.start().await?;
//!
//!     let metrics = manager.warm_project("p1").await?;
//!     println!("Warmed: {}", metrics);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod invalidation;
pub mod manager;
pub mod telemetry;
pub mod warming;

// Re-export main types for convenience
pub use backend::{KvBackend, MemoryBackend, RedisBackend, RetryPolicy};
pub use cache::{CacheEntry, CacheKey, CacheOptions, CacheTier, NamespaceMetrics, TieredCache};
pub use config::{CacheSettings, CacheSettingsBuilder, Neo4jSettings, RedisSettings, TierTtls, WarmingSettings};
pub use error::{CacheError, Result};
pub use graph::GraphQueryExecutor;
pub use invalidation::{
    EntityOperation, InvalidationEngine, InvalidationEvent, InvalidationMetrics, InvalidationRule,
    RuleCondition,
};
pub use manager::{CacheManager, HealthReport, MetricsSnapshot};
pub use warming::{
    QueryExecutor, QueryResult, Schedule, WarmingMetrics, WarmingQuery, WarmingScheduler,
    WarmingStrategy,
};
