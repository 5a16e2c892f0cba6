//! Query executor seam used by the warming scheduler

use crate::cache::CacheTier;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Opaque query descriptor warmed into the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingQuery {
    /// Query text, passed through to the executor unchanged
    pub query: String,

    #[serde(default)]
    pub params: Map<String, Value>,

    /// Tier the result is cached at
    #[serde(default)]
    pub tier: CacheTier,

    #[serde(default)]
    pub description: String,
}

impl WarmingQuery {
    pub fn new(query: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Map::new(),
            tier: CacheTier::default(),
            description: description.into(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn tier(mut self, tier: CacheTier) -> Self {
        self.tier = tier;
        self
    }
}

/// Outcome of one query execution
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub data: Value,
    /// Served from the cache rather than the source
    pub from_cache: bool,
    pub execution_time: Duration,
}

/// Executes a query, caching its result at the given tier.
///
/// With `skip_cache` the cache is neither read nor written. Warming always
/// passes `false`, so results land in the cache even if the executor's
/// own defaults would skip it.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        query: &str,
        params: &Map<String, Value>,
        tier: CacheTier,
        skip_cache: bool,
    ) -> Result<QueryResult>;
}
