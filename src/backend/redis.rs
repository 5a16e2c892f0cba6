//! Redis backend (single node and cluster)
//!
//! Request/response traffic goes through a `ConnectionManager` (single node)
//! or a `ClusterConnection`. Subscriptions open their own connection: a
//! blocking SUBSCRIBE cannot share a multiplexed request connection. In a
//! cluster PUBLISH is broadcast to every node, so subscribing through the
//! first seed node receives all messages.
//!
//! Key scans in a cluster visit every master. The master set is read with
//! `CLUSTER NODES` at connect time and re-read at the start of every scan,
//! so a single seed URL is enough and resharding is picked up.

use super::{KvBackend, MessageStream, PubSubMessage, ScanCursor, ScanPage};
use crate::config::RedisSettings;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{Client, ConnectionInfo, FromRedisValue, IntoConnectionInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Exponential backoff for connection establishment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before giving up (at least one)
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), with up to 10% jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        capped.mul_f64(1.0 + jitter).min(self.max_delay)
    }
}

enum Topology {
    Single(ConnectionManager),
    Cluster {
        conn: ClusterConnection,
        /// One connection per master, sorted by address, used for per-node SCAN
        masters: RwLock<Vec<ClusterNode>>,
    },
}

struct ClusterNode {
    address: String,
    manager: ConnectionManager,
}

/// Redis-backed implementation of [`KvBackend`]
pub struct RedisBackend {
    topology: Topology,
    /// Connection details for dedicated pub/sub connections
    subscribe_info: ConnectionInfo,
}

impl RedisBackend {
    /// Connect once, without retries
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let (urls, cluster) = settings.node_urls();
        let infos = urls
            .iter()
            .map(|url| connection_info(url, settings.password.as_deref()))
            .collect::<Result<Vec<_>>>()?;
        let subscribe_info = infos
            .first()
            .cloned()
            .ok_or_else(|| CacheError::ConfigError("REDIS_URL lists no nodes".to_string()))?;

        let topology = if cluster {
            let mut builder = ClusterClientBuilder::new(infos.clone());
            if let Some(password) = settings.password.as_deref() {
                builder = builder.password(password.to_string());
            }
            let conn = builder
                .build()
                .map_err(|e| CacheError::ConnectionError(e.to_string()))?
                .get_async_connection()
                .await
                .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

            let masters = match discover_masters(&conn, &subscribe_info).await {
                Ok(masters) => masters,
                Err(e) => {
                    warn!(error = %e, "Cluster master discovery failed, scanning seed nodes only");
                    let mut seeds = Vec::with_capacity(infos.len());
                    for info in infos {
                        seeds.push(ClusterNode {
                            address: info.addr.to_string(),
                            manager: manager_for(info).await?,
                        });
                    }
                    seeds
                }
            };
            info!(masters = masters.len(), "Connected to Redis cluster");
            Topology::Cluster {
                conn,
                masters: RwLock::new(masters),
            }
        } else {
            let manager = manager_for(subscribe_info.clone()).await?;
            info!("Connected to Redis");
            Topology::Single(manager)
        };

        Ok(Self {
            topology,
            subscribe_info,
        })
    }

    /// Whether this backend talks to a cluster
    pub fn is_cluster(&self) -> bool {
        matches!(self.topology, Topology::Cluster { .. })
    }

    /// Addresses of the masters a key scan visits; empty for a single node
    pub async fn cluster_masters(&self) -> Vec<String> {
        match &self.topology {
            Topology::Single(_) => Vec::new(),
            Topology::Cluster { masters, .. } => masters
                .read()
                .await
                .iter()
                .map(|node| node.address.clone())
                .collect(),
        }
    }

    /// Re-read the master set and swap it in when it changed
    async fn refresh_masters(&self) {
        let Topology::Cluster { conn, masters } = &self.topology else {
            return;
        };
        let current: Vec<String> = masters
            .read()
            .await
            .iter()
            .map(|node| node.address.clone())
            .collect();

        let raw: String = match redis::cmd("CLUSTER")
            .arg("NODES")
            .query_async(&mut conn.clone())
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "CLUSTER NODES failed, keeping known masters");
                return;
            }
        };
        let discovered = parse_cluster_masters(&raw);
        let addresses: Vec<String> = discovered
            .iter()
            .map(|(host, port)| format!("{}:{}", host, port))
            .collect();
        if discovered.is_empty() || addresses == current {
            return;
        }

        match connect_masters(&discovered, &self.subscribe_info).await {
            Ok(nodes) => {
                info!(before = ?current, after = ?addresses, "Cluster masters changed");
                *masters.write().await = nodes;
            }
            Err(e) => warn!(error = %e, "Failed to connect to new cluster masters"),
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let value = match &self.topology {
            Topology::Single(manager) => cmd.query_async(&mut manager.clone()).await?,
            Topology::Cluster { conn, .. } => cmd.query_async(&mut conn.clone()).await?,
        };
        Ok(value)
    }

    /// Run the same single-key command for many keys.
    ///
    /// Single node: one pipeline. Cluster: keys may hash to different slots,
    /// so commands are issued concurrently and routed individually.
    async fn fan_out<T: FromRedisValue + Send>(&self, cmds: Vec<redis::Cmd>) -> Result<Vec<T>> {
        match &self.topology {
            Topology::Single(manager) => {
                let mut pipe = redis::pipe();
                for cmd in &cmds {
                    pipe.add_command(cmd.clone());
                }
                Ok(pipe.query_async(&mut manager.clone()).await?)
            }
            Topology::Cluster { conn, .. } => {
                let results = join_all(cmds.iter().map(|cmd| {
                    let mut conn = conn.clone();
                    async move {
                        let reply: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
                        reply
                    }
                }))
                .await;
                results
                    .into_iter()
                    .collect::<redis::RedisResult<Vec<T>>>()
                    .map_err(CacheError::from)
            }
        }
    }
}

/// Connect with exponential backoff, failing after `policy.max_attempts`
pub async fn connect_with_retry(settings: &RedisSettings) -> Result<RedisBackend> {
    let policy = &settings.retry;
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match RedisBackend::connect(settings).await {
            Ok(backend) => {
                if attempt > 1 {
                    info!(attempt, "Redis connection established after retry");
                }
                return Ok(backend);
            }
            Err(e @ CacheError::ConfigError(_)) => return Err(e),
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Redis connection failed (attempt {}/{}), retrying after {:?}: {}",
                        attempt, attempts, delay, last_error
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(CacheError::RetriesExhausted {
        attempts,
        last_error,
    })
}

fn connection_info(url: &str, password: Option<&str>) -> Result<ConnectionInfo> {
    let mut info = url
        .into_connection_info()
        .map_err(|e| CacheError::ConfigError(format!("invalid Redis URL: {}", e)))?;
    if info.redis.password.is_none() {
        info.redis.password = password.map(str::to_string);
    }
    Ok(info)
}

/// `host:port` of every reachable master in `CLUSTER NODES` output, sorted
fn parse_cluster_masters(output: &str) -> Vec<(String, u16)> {
    let mut masters: Vec<(String, u16)> = output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            let address = fields.next()?;
            let flags = fields.next()?;

            let flags: Vec<&str> = flags.split(',').collect();
            let unusable = ["fail", "fail?", "handshake", "noaddr"];
            if !flags.contains(&"master") || flags.iter().any(|f| unusable.contains(f)) {
                return None;
            }

            // ip:port@cport[,hostname]
            let address = address.split(['@', ',']).next()?;
            let (host, port) = address.rsplit_once(':')?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        })
        .collect();
    masters.sort();
    masters.dedup();
    masters
}

async fn discover_masters(conn: &ClusterConnection, template: &ConnectionInfo) -> Result<Vec<ClusterNode>> {
    let raw: String = redis::cmd("CLUSTER")
        .arg("NODES")
        .query_async(&mut conn.clone())
        .await?;
    let masters = parse_cluster_masters(&raw);
    if masters.is_empty() {
        return Err(CacheError::ConnectionError(
            "CLUSTER NODES reported no reachable masters".to_string(),
        ));
    }
    connect_masters(&masters, template).await
}

/// Connect to each master with the seed's credentials and TLS mode
async fn connect_masters(masters: &[(String, u16)], template: &ConnectionInfo) -> Result<Vec<ClusterNode>> {
    let scheme = if matches!(template.addr, redis::ConnectionAddr::Tcp(..)) {
        "redis"
    } else {
        "rediss"
    };

    let mut nodes = Vec::with_capacity(masters.len());
    for (host, port) in masters {
        let host_part = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.clone()
        };
        let mut info = template.clone();
        info.addr = connection_info(&format!("{}://{}:{}", scheme, host_part, port), None)?.addr;
        nodes.push(ClusterNode {
            address: format!("{}:{}", host, port),
            manager: manager_for(info).await?,
        });
    }
    Ok(nodes)
}

async fn manager_for(info: ConnectionInfo) -> Result<ConnectionManager> {
    let client = Client::open(info).map_err(|e| CacheError::ConnectionError(e.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| CacheError::ConnectionError(e.to_string()))
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.query(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(super::ttl_secs(ttl)),
        )
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let cmds = keys
            .iter()
            .map(|key| {
                let mut cmd = redis::cmd("DEL");
                cmd.arg(key);
                cmd
            })
            .collect();
        let removed: Vec<u64> = self.fan_out(cmds).await?;
        Ok(removed.into_iter().sum())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let count: u64 = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated: u64 = self
            .query(redis::cmd("EXPIRE").arg(key).arg(super::ttl_secs(ttl)))
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        // -2: missing, -1: no expiry
        let secs: i64 = self.query(redis::cmd("TTL").arg(key)).await?;
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        match &self.topology {
            Topology::Single(_) => self.query(redis::cmd("MGET").arg(keys)).await,
            Topology::Cluster { .. } => {
                let cmds = keys
                    .iter()
                    .map(|key| {
                        let mut cmd = redis::cmd("GET");
                        cmd.arg(key);
                        cmd
                    })
                    .collect();
                self.fan_out(cmds).await
            }
        }
    }

    async fn mset(&self, entries: &[(String, Vec<u8>, Duration)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // Per-entry TTLs rule out MSET; SET EX in one pipeline instead
        let cmds = entries
            .iter()
            .map(|(key, value, ttl)| {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(value).arg("EX").arg(super::ttl_secs(*ttl));
                cmd
            })
            .collect();
        let _: Vec<redis::Value> = self.fan_out(cmds).await?;
        Ok(())
    }

    async fn scan(&self, cursor: ScanCursor, pattern: &str, count: usize) -> Result<ScanPage> {
        let (node, position) = match cursor {
            ScanCursor::Start => (0, 0),
            ScanCursor::Node { node, cursor } => (node, cursor),
            ScanCursor::AfterKey(_) => {
                return Err(CacheError::Other(
                    "key cursor passed to Redis backend".to_string(),
                ))
            }
        };

        let mut cmd = redis::cmd("SCAN");
        cmd.arg(position)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1));

        if node == 0 && position == 0 {
            self.refresh_masters().await;
        }

        let (next_position, keys, node_count): (u64, Vec<String>, usize) = match &self.topology {
            Topology::Single(manager) => {
                let (next, keys) = cmd.query_async(&mut manager.clone()).await?;
                (next, keys, 1)
            }
            Topology::Cluster { masters, .. } => {
                let (mut manager, node_count) = {
                    let masters = masters.read().await;
                    match masters.get(node) {
                        Some(master) => (master.manager.clone(), masters.len()),
                        None => {
                            // the master set shrank mid-scan
                            warn!(node, masters = masters.len(), "Scan cursor past the last master");
                            return Ok(ScanPage::default());
                        }
                    }
                };
                let (next, keys) = cmd.query_async(&mut manager).await?;
                (next, keys, node_count)
            }
        };

        let next = if next_position != 0 {
            Some(ScanCursor::Node {
                node,
                cursor: next_position,
            })
        } else if node + 1 < node_count {
            Some(ScanCursor::Node {
                node: node + 1,
                cursor: 0,
            })
        } else {
            None
        };

        Ok(ScanPage { keys, next })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.query(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        let client = Client::open(self.subscribe_info.clone())
            .map_err(|e| CacheError::ConnectionError(format!("failed to create Redis client: {}", e)))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::ConnectionError(format!("failed to get pub/sub connection: {}", e)))?;

        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(channels = ?channels, "Subscribed to Redis channels");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    warn!(error = %e, "failed to read pub/sub message payload");
                    None
                }
            }
        });
        let stream: MessageStream = Box::pin(stream);
        Ok(stream)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        match self.topology {
            Topology::Single(_) => "redis",
            Topology::Cluster { .. } => "redis-cluster",
        }
    }
}
