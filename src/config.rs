//! Configuration for the caching subsystem
//!
//! Settings are normally read from the environment (optionally via a
//! `.env` file) with [`CacheSettings::from_env`]; tests and embedders use
//! the builder.

use crate::backend::RetryPolicy;
use crate::cache::CacheTier;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Payloads above this many serialized bytes are compressed
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 10 * 1024;

/// Keys examined per SCAN page during pattern invalidation
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Namespace metrics are persisted every this many requests
pub const DEFAULT_METRICS_PERSIST_EVERY: u64 = 100;

/// Connection settings for the key-value backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Connection URL; a cluster may list several comma-separated seed URLs
    pub url: String,

    /// Credential applied when the URL does not embed one
    pub password: Option<String>,

    /// Cluster topology (also enabled by `?cluster=true` on the URL)
    pub cluster: bool,

    /// Backoff for connection establishment
    pub retry: RetryPolicy,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            cluster: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Seed node URLs with the `cluster` query flag stripped, and whether
    /// the cluster topology is selected
    pub fn node_urls(&self) -> (Vec<String>, bool) {
        let mut cluster = self.cluster;
        let urls = self
            .url
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| {
                let (base, query) = match u.split_once('?') {
                    Some((base, query)) => (base, query),
                    None => return u.to_string(),
                };
                let kept: Vec<&str> = query
                    .split('&')
                    .filter(|param| match param.split_once('=') {
                        Some(("cluster", value)) => {
                            cluster |= matches!(value, "true" | "1" | "yes");
                            false
                        }
                        _ => !param.is_empty(),
                    })
                    .collect();
                if kept.is_empty() {
                    base.to_string()
                } else {
                    format!("{}?{}", base, kept.join("&"))
                }
            })
            .collect();
        (urls, cluster)
    }
}

/// Default time-to-live per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTtls {
    pub hot: Duration,
    pub warm: Duration,
    pub cold: Duration,
}

impl Default for TierTtls {
    fn default() -> Self {
        Self {
            hot: Duration::from_secs(300),
            warm: Duration::from_secs(3600),
            cold: Duration::from_secs(86400),
        }
    }
}

impl TierTtls {
    pub fn for_tier(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Hot => self.hot,
            CacheTier::Warm => self.warm,
            CacheTier::Cold => self.cold,
        }
    }
}

/// Cache warming behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmingSettings {
    /// Whether recurring strategies are scheduled at all
    pub enabled: bool,

    /// Whether `OnStartup` strategies run when the scheduler starts
    pub run_on_startup: bool,

    /// Queries executed concurrently within one strategy batch
    pub batch_size: usize,
}

impl Default for WarmingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            run_on_startup: true,
            batch_size: 5,
        }
    }
}

/// Connection settings for the graph query executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Complete configuration of the caching subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Backend connection; `None` selects the in-memory backend
    pub redis: Option<RedisSettings>,

    /// Prefix of every physical key
    pub key_prefix: String,

    /// Namespace used when callers do not name one
    pub default_namespace: String,

    /// TTL per tier
    pub tier_ttls: TierTtls,

    /// Serialized size above which payloads are compressed
    pub compression_threshold: usize,

    /// Keys examined per SCAN page
    pub scan_page_size: usize,

    /// Persist namespace metrics every N requests (0 disables)
    pub metrics_persist_every: u64,

    /// Period of the metrics report task
    pub metrics_interval: Duration,

    /// Cache warming behaviour
    pub warming: WarmingSettings,

    /// Graph executor connection, when configured
    pub neo4j: Option<Neo4jSettings>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis: None,
            key_prefix: "reqarch".to_string(),
            default_namespace: "default".to_string(),
            tier_ttls: TierTtls::default(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            metrics_persist_every: DEFAULT_METRICS_PERSIST_EVERY,
            metrics_interval: Duration::from_secs(60),
            warming: WarmingSettings::default(),
            neo4j: None,
        }
    }
}

impl CacheSettings {
    /// Create a new builder for cache settings
    pub fn builder() -> CacheSettingsBuilder {
        CacheSettingsBuilder::default()
    }

    /// Load settings from the process environment (and `.env`, if present).
    ///
    /// `REDIS_URL` and a credential (`REDIS_PASSWORD` or one embedded in the
    /// URL) are required; every missing variable is reported at once.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let url = get("REDIS_URL");
        let password = get("REDIS_PASSWORD");
        let mut missing = Vec::new();
        if url.is_none() {
            missing.push("REDIS_URL".to_string());
        }
        let embedded_credential = url.as_deref().is_some_and(url_has_credential);
        if password.is_none() && !embedded_credential {
            missing.push("REDIS_PASSWORD".to_string());
        }
        if !missing.is_empty() {
            return Err(CacheError::MissingEnvironment(missing));
        }

        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: parse_var(&get, "CACHE_CONNECT_MAX_ATTEMPTS", 5)?,
            ..RetryPolicy::default()
        };
        let redis = RedisSettings {
            url: url.unwrap_or_default(),
            password,
            cluster: parse_var(&get, "REDIS_CLUSTER", false)?,
            retry,
        };

        let neo4j = match (get("NEO4J_URI"), get("NEO4J_PASSWORD")) {
            (Some(uri), Some(password)) => Some(Neo4jSettings {
                uri,
                user: get("NEO4J_USER").unwrap_or_else(|| "neo4j".to_string()),
                password,
                database: get("NEO4J_DATABASE").unwrap_or_else(|| "neo4j".to_string()),
            }),
            _ => None,
        };

        let settings = Self {
            redis: Some(redis),
            key_prefix: get("CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            default_namespace: get("CACHE_DEFAULT_NAMESPACE").unwrap_or(defaults.default_namespace),
            tier_ttls: TierTtls {
                hot: Duration::from_secs(parse_var(&get, "CACHE_TTL_HOT", 300)?),
                warm: Duration::from_secs(parse_var(&get, "CACHE_TTL_WARM", 3600)?),
                cold: Duration::from_secs(parse_var(&get, "CACHE_TTL_COLD", 86400)?),
            },
            compression_threshold: parse_var(
                &get,
                "CACHE_COMPRESSION_THRESHOLD",
                DEFAULT_COMPRESSION_THRESHOLD,
            )?,
            scan_page_size: defaults.scan_page_size,
            metrics_persist_every: defaults.metrics_persist_every,
            metrics_interval: Duration::from_secs(parse_var(&get, "CACHE_METRICS_INTERVAL_SECS", 60)?),
            warming: WarmingSettings {
                enabled: parse_var(&get, "CACHE_WARMING_ENABLED", true)?,
                run_on_startup: parse_var(&get, "CACHE_WARMING_ON_STARTUP", true)?,
                batch_size: parse_var(&get, "CACHE_WARMING_BATCH_SIZE", 5)?,
            },
            neo4j,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(CacheError::ConfigError("key_prefix must not be empty".to_string()));
        }

        if self.default_namespace.is_empty() {
            return Err(CacheError::ConfigError(
                "default_namespace must not be empty".to_string(),
            ));
        }

        let ttls = &self.tier_ttls;
        if ttls.hot.is_zero() || ttls.warm.is_zero() || ttls.cold.is_zero() {
            return Err(CacheError::ConfigError(
                "tier TTLs must be greater than 0".to_string(),
            ));
        }

        if self.scan_page_size == 0 {
            return Err(CacheError::ConfigError(
                "scan_page_size must be greater than 0".to_string(),
            ));
        }

        if self.warming.batch_size == 0 {
            return Err(CacheError::ConfigError(
                "warming batch_size must be greater than 0".to_string(),
            ));
        }

        if self.metrics_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "metrics_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Default TTL of a tier under these settings
    pub fn ttl_for(&self, tier: CacheTier) -> Duration {
        self.tier_ttls.for_tier(tier)
    }
}

fn url_has_credential(url: &str) -> bool {
    url.split_once("://")
        .map(|(_, rest)| rest.split('/').next().unwrap_or_default().contains('@'))
        .unwrap_or(false)
}

fn parse_var<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CacheError::ConfigError(format!("{} has invalid value '{}': {}", name, raw, e))),
        None => Ok(default),
    }
}

/// Builder for cache settings with validation
#[derive(Debug, Default)]
pub struct CacheSettingsBuilder {
    redis: Option<RedisSettings>,
    key_prefix: Option<String>,
    default_namespace: Option<String>,
    tier_ttls: Option<TierTtls>,
    compression_threshold: Option<usize>,
    scan_page_size: Option<usize>,
    metrics_persist_every: Option<u64>,
    metrics_interval: Option<Duration>,
    warming: Option<WarmingSettings>,
    neo4j: Option<Neo4jSettings>,
}

impl CacheSettingsBuilder {
    /// Use a Redis backend
    pub fn redis(mut self, redis: RedisSettings) -> Self {
        self.redis = Some(redis);
        self
    }

    /// Set the physical key prefix
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the default namespace
    pub fn default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = Some(namespace.into());
        self
    }

    /// Override the per-tier TTLs
    pub fn tier_ttls(mut self, ttls: TierTtls) -> Self {
        self.tier_ttls = Some(ttls);
        self
    }

    /// Set the compression threshold in bytes
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }

    /// Set the SCAN page size
    pub fn scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = Some(size);
        self
    }

    /// Persist namespace metrics every N requests (0 disables)
    pub fn metrics_persist_every(mut self, every: u64) -> Self {
        self.metrics_persist_every = Some(every);
        self
    }

    /// Set the metrics report period
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    /// Set warming behaviour
    pub fn warming(mut self, warming: WarmingSettings) -> Self {
        self.warming = Some(warming);
        self
    }

    /// Configure the graph executor connection
    pub fn neo4j(mut self, neo4j: Neo4jSettings) -> Self {
        self.neo4j = Some(neo4j);
        self
    }

    /// Build the cache settings
    pub fn build(self) -> CacheSettings {
        let defaults = CacheSettings::default();

        CacheSettings {
            redis: self.redis.or(defaults.redis),
            key_prefix: self.key_prefix.unwrap_or(defaults.key_prefix),
            default_namespace: self.default_namespace.unwrap_or(defaults.default_namespace),
            tier_ttls: self.tier_ttls.unwrap_or(defaults.tier_ttls),
            compression_threshold: self
                .compression_threshold
                .unwrap_or(defaults.compression_threshold),
            scan_page_size: self.scan_page_size.unwrap_or(defaults.scan_page_size),
            metrics_persist_every: self
                .metrics_persist_every
                .unwrap_or(defaults.metrics_persist_every),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
            warming: self.warming.unwrap_or(defaults.warming),
            neo4j: self.neo4j.or(defaults.neo4j),
        }
    }
}
