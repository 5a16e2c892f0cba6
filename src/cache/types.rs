//! Core type definitions for the cache system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Channel carrying JSON-encoded invalidation events
pub const INVALIDATION_CHANNEL: &str = "invalidation";

/// Channel announcing completed pattern invalidations
pub const PATTERN_INVALIDATION_CHANNEL: &str = "pattern-invalidation";

/// Channel announcing versioned writes
pub const KEY_INVALIDATION_CHANNEL: &str = "key-invalidation";

/// Separator between a key and its version suffix
pub(crate) const VERSION_SEPARATOR: &str = ":v:";

/// TTL policy class assigned to an entry at write time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheTier {
    /// Frequently changing data (5 minutes by default)
    Hot,

    /// Regular data (1 hour by default)
    #[default]
    Warm,

    /// Rarely changing data (24 hours by default)
    Cold,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Hot => write!(f, "HOT"),
            CacheTier::Warm => write!(f, "WARM"),
            CacheTier::Cold => write!(f, "COLD"),
        }
    }
}

impl FromStr for CacheTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(CacheTier::Hot),
            "warm" => Ok(CacheTier::Warm),
            "cold" => Ok(CacheTier::Cold),
            other => Err(format!("unknown cache tier: {}", other)),
        }
    }
}

/// Logical address of a cached value: namespace, key and optional version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub key: String,
    pub version: Option<String>,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Physical key: `{prefix}:{namespace}:{key}[:v:{version}]`
    pub fn to_physical(&self, prefix: &str) -> String {
        match &self.version {
            Some(version) => format!(
                "{}:{}:{}{}{}",
                prefix, self.namespace, self.key, VERSION_SEPARATOR, version
            ),
            None => format!("{}:{}:{}", prefix, self.namespace, self.key),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}@{}", self.namespace, self.key, v),
            None => write!(f, "{}:{}", self.namespace, self.key),
        }
    }
}

/// Per-call options for reads and writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Namespace; the store's default when absent
    pub namespace: Option<String>,

    /// TTL policy class; WARM when absent
    pub tier: Option<CacheTier>,

    /// Explicit TTL, overriding the tier default (zero is ignored)
    pub ttl: Option<Duration>,

    /// Version suffix of the key
    pub version: Option<String>,

    /// Compress regardless of payload size
    pub compress: bool,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn tier(mut self, tier: CacheTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Payload of the `pattern-invalidation` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternInvalidation {
    pub pattern: String,
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload of the `key-invalidation` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInvalidation {
    pub key: String,
    pub namespace: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Escape glob metacharacters so a literal can be embedded in a pattern
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
