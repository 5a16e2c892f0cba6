//! # Tiered Cache Store
//!
//! Namespaced, versioned cache entries over a shared [`KvBackend`](crate::backend::KvBackend).
//!
//! ## Features
//!
//! - **Tier-Based TTL**: HOT / WARM / COLD policy defaults, overridable per write
//! - **Versioning**: versioned keys never collide with unversioned lookups
//! - **Compression**: gzip + base64 above a size threshold
//! - **Pattern Invalidation**: paged scan with pipelined delete per page
//! - **Metrics**: per-namespace hit/miss counters with derived hit ratio
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_cache::backend::MemoryBackend;
//! use ouroboros_cache::cache::{CacheOptions, CacheTier, TieredCache};
//! use ouroboros_cache::CacheSettings;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = CacheSettings::builder().key_prefix("app").build();
//! let cache = TieredCache::new(Arc::new(MemoryBackend::new()), &settings);
//!
//! let opts = CacheOptions::new().namespace("neo4j").tier(CacheTier::Hot);
//! cache.set("requirement:req:42", &serde_json::json!({"status": "active"}), &opts).await;
//!
//! let value: Option<serde_json::Value> = cache.get("requirement:req:42", &opts).await;
//! assert!(value.is_some());
//!
//! cache.invalidate_pattern("*requirement*42*", Some("neo4j")).await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod metrics;
pub mod store;
pub mod types;

pub use entry::CacheEntry;
pub use metrics::{MetricsRegistry, NamespaceMetrics, AGGREGATE_NAMESPACE};
pub use store::TieredCache;
pub use types::{
    escape_glob, CacheKey, CacheOptions, CacheTier, KeyInvalidation, PatternInvalidation,
    INVALIDATION_CHANNEL, KEY_INVALIDATION_CHANNEL, PATTERN_INVALIDATION_CHANNEL,
};
