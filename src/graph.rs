//! Neo4j query executor with read-through caching
//!
//! Results are cached in the `neo4j` namespace under keys that spell out
//! the query parameters, e.g. `query:<digest>:projectId=p1`, so invalidation
//! patterns such as `*project*p1*` reach every cached query about that
//! project without knowing the query text.

use crate::backend::RetryPolicy;
use crate::cache::{CacheOptions, CacheTier, TieredCache};
use crate::config::Neo4jSettings;
use crate::error::{CacheError, Result};
use crate::invalidation::NEO4J_NAMESPACE;
use crate::warming::{QueryExecutor, QueryResult};
use async_trait::async_trait;
use neo4rs::{query, BoltList, BoltMap, BoltNull, BoltString, BoltType, ConfigBuilder, Graph};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Graph query executor over neo4rs
pub struct GraphQueryExecutor {
    graph: Graph,
    cache: Arc<TieredCache>,
    namespace: String,
}

impl GraphQueryExecutor {
    /// Connect with exponential backoff
    pub async fn connect(settings: &Neo4jSettings, cache: Arc<TieredCache>) -> Result<Self> {
        let policy = RetryPolicy::default();
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            match connect_graph(settings).await {
                Ok(graph) => return Ok(Self::new(graph, cache)),
                Err(e @ CacheError::ConfigError(_)) => return Err(e),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < policy.max_attempts {
                        let delay = policy.delay_for(attempt);
                        warn!(
                            "Neo4j connection failed (attempt {}/{}), retrying after {:?}: {}",
                            attempt, policy.max_attempts, delay, last_error
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(CacheError::RetriesExhausted {
            attempts: policy.max_attempts,
            last_error,
        })
    }

    pub fn new(graph: Graph, cache: Arc<TieredCache>) -> Self {
        Self {
            graph,
            cache,
            namespace: NEO4J_NAMESPACE.to_string(),
        }
    }

    /// Get a reference to the underlying Neo4j Graph instance
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Simple health check using RETURN 1
    pub async fn health_check(&self) -> Result<bool> {
        debug!("Executing graph health check (RETURN 1)");
        self.graph
            .run(query("RETURN 1"))
            .await
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;
        Ok(true)
    }

    async fn run_query(&self, cypher: &str, params: &Map<String, Value>) -> Result<Value> {
        let mut q = query(cypher);
        for (name, value) in params {
            q = q.param(name, json_to_bolt(value));
        }

        let mut stream = self
            .graph
            .execute(q)
            .await
            .map_err(|e| CacheError::QueryError(e.to_string()))?;

        let mut rows = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| CacheError::QueryError(e.to_string()))?
        {
            let value: Value = row
                .to()
                .map_err(|e| CacheError::QueryError(format!("failed to decode row: {}", e)))?;
            rows.push(value);
        }
        Ok(Value::Array(rows))
    }
}

#[async_trait]
impl QueryExecutor for GraphQueryExecutor {
    async fn execute(
        &self,
        cypher: &str,
        params: &Map<String, Value>,
        tier: CacheTier,
        skip_cache: bool,
    ) -> Result<QueryResult> {
        let start = Instant::now();
        let key = query_cache_key(cypher, params);
        let opts = CacheOptions::new().namespace(self.namespace.clone()).tier(tier);

        if !skip_cache {
            if let Some(data) = self.cache.get::<Value>(&key, &opts).await {
                return Ok(QueryResult {
                    data,
                    from_cache: true,
                    execution_time: start.elapsed(),
                });
            }
        }

        let data = self.run_query(cypher, params).await?;

        if !skip_cache && !self.cache.set(&key, &data, &opts).await {
            debug!(key = %key, "Query result not cached");
        }

        Ok(QueryResult {
            data,
            from_cache: false,
            execution_time: start.elapsed(),
        })
    }
}

async fn connect_graph(settings: &Neo4jSettings) -> Result<Graph> {
    info!(
        "Connecting to Neo4j at {} (database: {})",
        settings.uri, settings.database
    );

    let config = ConfigBuilder::default()
        .uri(settings.uri.as_str())
        .user(settings.user.as_str())
        .password(settings.password.as_str())
        .db(settings.database.as_str())
        .fetch_size(500)
        .max_connections(16)
        .build()
        .map_err(|e| CacheError::ConfigError(e.to_string()))?;

    let graph = Graph::connect(config)
        .await
        .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

    info!("Successfully connected to Neo4j");
    Ok(graph)
}

/// Cache key for a query: a digest of the text plus every scalar parameter
/// as `name=value`, sorted by name
pub fn query_cache_key(cypher: &str, params: &Map<String, Value>) -> String {
    let mut canonical = String::from(cypher);
    let mut readable = Vec::with_capacity(params.len());

    let mut names: Vec<&String> = params.keys().collect();
    names.sort();
    for name in names {
        let value = &params[name.as_str()];
        canonical.push('\u{1f}');
        canonical.push_str(name);
        canonical.push('=');
        canonical.push_str(&value.to_string());

        match value {
            Value::String(s) => readable.push(format!("{}={}", name, s)),
            Value::Number(_) | Value::Bool(_) => readable.push(format!("{}={}", name, value)),
            _ => {}
        }
    }

    let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, canonical.as_bytes()).simple();
    if readable.is_empty() {
        format!("query:{}", digest)
    } else {
        format!("query:{}:{}", digest, readable.join(":"))
    }
}

fn json_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => BoltType::from(s.as_str()),
        Value::Array(items) => {
            let mut list = BoltList::new();
            for item in items {
                list.push(json_to_bolt(item));
            }
            BoltType::List(list)
        }
        Value::Object(fields) => {
            let mut map = BoltMap::new();
            for (name, field) in fields {
                map.put(BoltString::from(name.as_str()), json_to_bolt(field));
            }
            BoltType::Map(map)
        }
    }
}
