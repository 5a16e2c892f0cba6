//! Tiered cache store over a shared key-value backend
//!
//! Keys are laid out as `{prefix}:{namespace}:{key}` with an optional
//! `:v:{version}` suffix. Reads and writes never fail the caller: backend
//! errors are logged and degrade to a miss or `false`, so a cache that is
//! down behaves like one that is cold.

use crate::backend::{KvBackend, ScanCursor};
use crate::cache::entry::CacheEntry;
use crate::cache::metrics::{MetricsRegistry, NamespaceMetrics};
use crate::cache::types::{
    escape_glob, CacheKey, CacheOptions, CacheTier, KeyInvalidation, PatternInvalidation,
    KEY_INVALIDATION_CHANNEL, PATTERN_INVALIDATION_CHANNEL, VERSION_SEPARATOR,
};
use crate::config::{CacheSettings, TierTtls};
use crate::error::{CacheError, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reserved key segment for persisted metrics snapshots
const METRICS_SEGMENT: &str = "__metrics";

/// Reserved key segment for health probes
const HEALTH_SEGMENT: &str = "__health";

/// Tiered cache store
///
/// Stateless apart from the per-namespace metrics; cheap to share behind an
/// `Arc` between the invalidation engine, the warming scheduler and callers.
pub struct TieredCache {
    backend: Arc<dyn KvBackend>,
    key_prefix: String,
    default_namespace: String,
    tier_ttls: TierTtls,
    compression_threshold: usize,
    scan_page_size: usize,
    metrics_persist_every: u64,
    metrics: MetricsRegistry,
}

impl TieredCache {
    /// Create a store over the given backend
    pub fn new(backend: Arc<dyn KvBackend>, settings: &CacheSettings) -> Self {
        info!(
            backend = backend.kind(),
            prefix = %settings.key_prefix,
            namespace = %settings.default_namespace,
            "Initializing tiered cache"
        );

        Self {
            backend,
            key_prefix: settings.key_prefix.clone(),
            default_namespace: settings.default_namespace.clone(),
            tier_ttls: settings.tier_ttls,
            compression_threshold: settings.compression_threshold,
            scan_page_size: settings.scan_page_size,
            metrics_persist_every: settings.metrics_persist_every,
            metrics: MetricsRegistry::new(),
        }
    }

    /// The shared backend
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Logical key for a caller key under the given options
    pub fn cache_key(&self, key: &str, opts: &CacheOptions) -> CacheKey {
        let namespace = opts
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        CacheKey {
            namespace,
            key: key.to_string(),
            version: opts.version.clone(),
        }
    }

    /// Physical backend key for a caller key under the given options
    pub fn physical_key(&self, key: &str, opts: &CacheOptions) -> String {
        self.cache_key(key, opts).to_physical(&self.key_prefix)
    }

    /// TTL applied to a write: explicit non-zero TTL, else the tier default,
    /// else the WARM default
    pub fn resolve_ttl(&self, opts: &CacheOptions) -> Duration {
        match opts.ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.tier_ttls.for_tier(opts.tier.unwrap_or(CacheTier::Warm)),
        }
    }

    /// Read a value; any failure is reported as a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &str, opts: &CacheOptions) -> Option<T> {
        let cache_key = self.cache_key(key, opts);
        let physical = cache_key.to_physical(&self.key_prefix);
        let start = Instant::now();

        let raw = match self.backend.get(&physical).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %physical, error = %e, "Cache GET failed");
                let total = self.metrics.record_error(&cache_key.namespace, start.elapsed());
                self.maybe_persist_metrics(&cache_key.namespace, total);
                return None;
            }
        };

        let value = match raw {
            Some(bytes) => self.decode_or_evict(&physical, &bytes).await,
            None => None,
        };

        let hit = value.is_some();
        let total = self
            .metrics
            .record(&cache_key.namespace, hit, start.elapsed());
        self.maybe_persist_metrics(&cache_key.namespace, total);
        debug!(key = %physical, hit, "cache get");
        value
    }

    /// Write a value; returns `false` if it could not be stored.
    ///
    /// When the caller supplies a version, a `key-invalidation` notice is
    /// published so version-aware peers can react.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, opts: &CacheOptions) -> bool {
        let cache_key = self.cache_key(key, opts);
        let physical = cache_key.to_physical(&self.key_prefix);
        let ttl = self.resolve_ttl(opts);

        let bytes = match self.encode(value, opts) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %physical, error = %e, "Cache value could not be serialized");
                return false;
            }
        };

        if let Err(e) = self.backend.set(&physical, &bytes, ttl).await {
            warn!(key = %physical, error = %e, "Cache SET failed");
            return false;
        }
        debug!(key = %physical, ttl_secs = ttl.as_secs(), "cache set");

        if let Some(version) = &cache_key.version {
            let notice = KeyInvalidation {
                key: cache_key.key.clone(),
                namespace: cache_key.namespace.clone(),
                version: version.clone(),
                timestamp: Utc::now(),
            };
            self.publish(KEY_INVALIDATION_CHANNEL, &notice).await;
        }

        true
    }

    /// Read several values; entries that fail individually read as misses
    pub async fn multi_get<T: DeserializeOwned>(
        &self,
        keys: &[String],
        opts: &CacheOptions,
    ) -> Vec<Option<T>> {
        if keys.is_empty() {
            return Vec::new();
        }

        let namespace = self.cache_key("", opts).namespace;
        let physical: Vec<String> = keys.iter().map(|k| self.physical_key(k, opts)).collect();
        let start = Instant::now();

        let raw = match self.backend.mget(&physical).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(count = keys.len(), error = %e, "Cache MGET failed");
                let latency = start.elapsed() / keys.len() as u32;
                let mut total = 0;
                for _ in keys {
                    total = self.metrics.record_error(&namespace, latency);
                }
                self.maybe_persist_metrics(&namespace, total);
                return keys.iter().map(|_| None).collect();
            }
        };

        let mut values = Vec::with_capacity(keys.len());
        for (physical_key, bytes) in physical.iter().zip(raw) {
            let value = match bytes {
                Some(bytes) => self.decode_or_evict(physical_key, &bytes).await,
                None => None,
            };
            values.push(value);
        }

        let latency = start.elapsed() / keys.len() as u32;
        let mut total = 0;
        for value in &values {
            total = self.metrics.record(&namespace, value.is_some(), latency);
        }
        self.maybe_persist_metrics(&namespace, total);
        values
    }

    /// Write several values with the same options; returns how many were stored.
    ///
    /// Entries that fail to serialize are skipped. If the batched write fails
    /// the entries are retried one by one so a single bad entry cannot sink
    /// the batch.
    pub async fn multi_set<T: Serialize>(&self, entries: &[(String, T)], opts: &CacheOptions) -> usize {
        let ttl = self.resolve_ttl(opts);
        let mut batch = Vec::with_capacity(entries.len());

        for (key, value) in entries {
            let physical = self.physical_key(key, opts);
            match self.encode(value, opts) {
                Ok(bytes) => batch.push((physical, bytes, ttl)),
                Err(e) => warn!(key = %physical, error = %e, "Skipping unserializable cache entry"),
            }
        }

        if batch.is_empty() {
            return 0;
        }

        match self.backend.mset(&batch).await {
            Ok(()) => batch.len(),
            Err(e) => {
                warn!(count = batch.len(), error = %e, "Cache MSET failed, writing entries individually");
                let mut written = 0;
                for (key, bytes, ttl) in &batch {
                    match self.backend.set(key, bytes, *ttl).await {
                        Ok(()) => written += 1,
                        Err(e) => warn!(key = %key, error = %e, "Cache SET failed"),
                    }
                }
                written
            }
        }
    }

    /// Delete a single entry; returns whether it existed
    pub async fn delete(&self, key: &str, opts: &CacheOptions) -> bool {
        let physical = self.physical_key(key, opts);
        match self.backend.delete(std::slice::from_ref(&physical)).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(key = %physical, error = %e, "Cache DEL failed");
                false
            }
        }
    }

    /// Whether an entry exists
    pub async fn exists(&self, key: &str, opts: &CacheOptions) -> bool {
        let physical = self.physical_key(key, opts);
        self.backend.exists(&physical).await.unwrap_or_else(|e| {
            warn!(key = %physical, error = %e, "Cache EXISTS failed");
            false
        })
    }

    /// Remaining TTL of an entry
    pub async fn ttl(&self, key: &str, opts: &CacheOptions) -> Option<Duration> {
        let physical = self.physical_key(key, opts);
        self.backend.ttl(&physical).await.unwrap_or_else(|e| {
            warn!(key = %physical, error = %e, "Cache TTL failed");
            None
        })
    }

    /// Delete every key matching a glob within a namespace; returns the count
    /// and never fails (errors are logged and reported as 0)
    pub async fn invalidate_pattern(&self, pattern: &str, namespace: Option<&str>) -> u64 {
        match self.try_invalidate_pattern(pattern, namespace).await {
            Ok(count) => count,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Pattern invalidation failed");
                0
            }
        }
    }

    /// Delete every key matching a glob within a namespace.
    ///
    /// Keys are scanned page by page and each page is deleted in one
    /// pipelined round trip, so memory stays bounded however many keys
    /// match. A `pattern-invalidation` notice is published only when at
    /// least one key was removed.
    pub async fn try_invalidate_pattern(&self, pattern: &str, namespace: Option<&str>) -> Result<u64> {
        let namespace = namespace.unwrap_or(&self.default_namespace);
        // only the caller's pattern is a glob; the namespace matches literally
        let full_pattern = format!("{}:{}:{}", self.key_prefix, escape_glob(namespace), pattern);
        let removed = self.delete_matching(&full_pattern).await?;

        if removed > 0 {
            info!(pattern = %full_pattern, removed, "Invalidated cache entries");
            let notice = PatternInvalidation {
                pattern: pattern.to_string(),
                namespace: namespace.to_string(),
                timestamp: Utc::now(),
            };
            self.publish(PATTERN_INVALIDATION_CHANNEL, &notice).await;
        } else {
            debug!(pattern = %full_pattern, "No cache entries matched");
        }

        Ok(removed)
    }

    /// Delete every entry written under a version (default namespace when
    /// none is given)
    pub async fn invalidate_version(&self, version: &str, namespace: Option<&str>) -> u64 {
        let pattern = format!("*{}{}", VERSION_SEPARATOR, escape_glob(version));
        self.invalidate_pattern(&pattern, namespace).await
    }

    /// Delete a whole namespace, or the default namespace when none is
    /// given. Never flushes the backend as a whole.
    pub async fn flush(&self, namespace: Option<&str>) -> Result<u64> {
        let namespace = namespace.unwrap_or(&self.default_namespace);
        let full_pattern = format!("{}:{}:*", self.key_prefix, escape_glob(namespace));
        let removed = self.delete_matching(&full_pattern).await?;
        info!(namespace = %namespace, removed, "Flushed cache namespace");
        Ok(removed)
    }

    /// Metrics snapshot of one namespace, or aggregated over all when `None`
    pub fn metrics(&self, namespace: Option<&str>) -> Option<NamespaceMetrics> {
        match namespace {
            Some(ns) => self.metrics.snapshot(ns),
            None => Some(self.aggregate_metrics()),
        }
    }

    /// Metrics aggregated over every namespace
    pub fn aggregate_metrics(&self) -> NamespaceMetrics {
        self.metrics.aggregate()
    }

    /// Snapshots of every namespace read so far
    pub fn all_metrics(&self) -> Vec<NamespaceMetrics> {
        self.metrics.all()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Write, read back and delete a probe key
    pub async fn health_probe(&self) -> Result<()> {
        let probe = format!(
            "{}:{}:{}",
            self.key_prefix,
            HEALTH_SEGMENT,
            uuid::Uuid::new_v4()
        );
        let token = Utc::now().timestamp_millis().to_string();

        self.backend
            .set(&probe, token.as_bytes(), Duration::from_secs(10))
            .await?;
        let read = self.backend.get(&probe).await?;
        self.backend.delete(std::slice::from_ref(&probe)).await?;

        if read.as_deref() == Some(token.as_bytes()) {
            Ok(())
        } else {
            Err(CacheError::Other("health probe read back a different value".to_string()))
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T, opts: &CacheOptions) -> Result<Vec<u8>> {
        CacheEntry::encode(
            value,
            opts.tier.unwrap_or(CacheTier::Warm),
            opts.version.clone(),
            opts.compress,
            self.compression_threshold,
        )?
        .to_bytes()
    }

    /// Decode a raw entry; on failure the entry is evicted and treated as a miss
    async fn decode_or_evict<T: DeserializeOwned>(&self, physical: &str, bytes: &[u8]) -> Option<T> {
        match CacheEntry::from_bytes(bytes).and_then(|entry| entry.decode()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %physical, error = %e, "Corrupted cache entry, evicting");
                if let Err(e) = self.backend.delete(&[physical.to_string()]).await {
                    warn!(key = %physical, error = %e, "Failed to evict corrupted entry");
                }
                None
            }
        }
    }

    async fn delete_matching(&self, full_pattern: &str) -> Result<u64> {
        let mut cursor = ScanCursor::Start;
        let mut removed = 0;

        loop {
            let page = self
                .backend
                .scan(cursor, full_pattern, self.scan_page_size)
                .await?;
            if !page.keys.is_empty() {
                removed += self.backend.delete(&page.keys).await?;
            }
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }

        Ok(removed)
    }

    async fn publish<T: Serialize>(&self, channel: &str, notice: &T) {
        let payload = match serde_json::to_string(notice) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel, error = %e, "Failed to encode notification");
                return;
            }
        };
        if let Err(e) = self.backend.publish(channel, &payload).await {
            warn!(channel, error = %e, "Failed to publish notification");
        }
    }

    fn maybe_persist_metrics(&self, namespace: &str, total_requests: u64) {
        if self.metrics_persist_every == 0 || total_requests % self.metrics_persist_every != 0 {
            return;
        }
        let Some(snapshot) = self.metrics.snapshot(namespace) else {
            return;
        };
        let key = format!("{}:{}:{}", self.key_prefix, METRICS_SEGMENT, namespace);
        let ttl = self.tier_ttls.cold;
        let backend = Arc::clone(&self.backend);

        tokio::spawn(async move {
            match serde_json::to_vec(&snapshot) {
                Ok(bytes) => {
                    if let Err(e) = backend.set(&key, &bytes, ttl).await {
                        debug!(key = %key, error = %e, "Failed to persist cache metrics");
                    }
                }
                Err(e) => debug!(error = %e, "Failed to encode cache metrics"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::{json, Value};

    fn store_with(backend: MemoryBackend) -> TieredCache {
        let settings = CacheSettings::builder()
            .key_prefix("test")
            .default_namespace("default")
            .build();
        TieredCache::new(Arc::new(backend), &settings)
    }

    #[tokio::test]
    async fn test_basic_set_and_get() {
        let cache = store_with(MemoryBackend::new());
        let opts = CacheOptions::new();

        assert!(cache.set("key1", &json!({"v": 1}), &opts).await);
        let value: Option<Value> = cache.get("key1", &opts).await;
        assert_eq!(value, Some(json!({"v": 1})));

        let metrics = cache.metrics(Some("default")).unwrap();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 0);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let cache = store_with(MemoryBackend::new());
        let value: Option<Value> = cache.get("nonexistent", &CacheOptions::new()).await;
        assert!(value.is_none());
        assert_eq!(cache.metrics(Some("default")).unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_resolve_ttl() {
        let cache = store_with(MemoryBackend::new());
        assert_eq!(cache.resolve_ttl(&CacheOptions::new()), Duration::from_secs(3600));
        assert_eq!(
            cache.resolve_ttl(&CacheOptions::new().tier(CacheTier::Hot)),
            Duration::from_secs(300)
        );
        assert_eq!(
            cache.resolve_ttl(&CacheOptions::new().tier(CacheTier::Cold).ttl(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            cache.resolve_ttl(&CacheOptions::new().ttl(Duration::ZERO)),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_evicted() {
        let backend = MemoryBackend::new();
        let cache = store_with(backend.clone());
        let opts = CacheOptions::new();

        cache.set("broken", &"value", &opts).await;
        backend.put_raw("test:default:broken", b"{not an entry".to_vec()).await;

        let value: Option<String> = cache.get("broken", &opts).await;
        assert!(value.is_none());
        assert!(!backend.exists("test:default:broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_only_touches_namespace() {
        let backend = MemoryBackend::new();
        let cache = store_with(backend.clone());

        cache.set("a", &1, &CacheOptions::new()).await;
        cache.set("b", &2, &CacheOptions::new()).await;
        cache.set("c", &3, &CacheOptions::new().namespace("graphql")).await;

        assert_eq!(cache.flush(None).await.unwrap(), 2);
        assert!(cache.exists("c", &CacheOptions::new().namespace("graphql")).await);
    }

    #[tokio::test]
    async fn test_health_probe() {
        let backend = MemoryBackend::new();
        let cache = store_with(backend.clone());
        cache.health_probe().await.unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_metrics_persisted_every_n_requests() {
        let backend = MemoryBackend::new();
        let settings = CacheSettings::builder()
            .key_prefix("test")
            .metrics_persist_every(3)
            .build();
        let cache = TieredCache::new(Arc::new(backend.clone()), &settings);

        for _ in 0..3 {
            let _: Option<Value> = cache.get("missing", &CacheOptions::new()).await;
        }
        // persistence runs on a spawned task
        for _ in 0..10 {
            if backend.exists("test:__metrics:default").await.unwrap() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let raw = backend.get("test:__metrics:default").await.unwrap().unwrap();
        let persisted: NamespaceMetrics = serde_json::from_slice(&raw).unwrap();
        assert_eq!(persisted.misses, 3);
    }
}
