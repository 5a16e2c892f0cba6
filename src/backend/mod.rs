//! Key-value backend abstraction
//!
//! The tiered store, the invalidation engine and the warming scheduler share
//! one backend instance, passed in explicitly as `Arc<dyn KvBackend>`.
//! Two implementations are provided:
//!
//! - [`RedisBackend`]: single node or cluster, selected by configuration
//! - [`MemoryBackend`]: in-process map with the same glob, TTL and pub/sub
//!   semantics, for single-instance deployments and tests
//!
//! Subscriptions always use a dedicated connection, separate from the one
//! serving request/response traffic.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::{connect_with_retry, RedisBackend, RetryPolicy};

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Continuation token for cursor-based key scans.
///
/// Each backend only produces and consumes its own variants; callers start
/// with [`ScanCursor::Start`] and pass back whatever [`ScanPage::next`]
/// returned until it is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanCursor {
    /// Beginning of the keyspace
    #[default]
    Start,

    /// Server-side cursor on one node of the topology
    Node { node: usize, cursor: u64 },

    /// Resume after this key (ordered in-memory keyspace)
    AfterKey(String),
}

/// One page of a key scan
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    /// Keys matched in this page (may be empty even when more pages follow)
    pub keys: Vec<String>,

    /// Cursor for the next page, `None` when the scan is complete
    pub next: Option<ScanCursor>,
}

/// A message delivered on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages from a dedicated subscription connection.
///
/// The stream ends when the subscription connection is lost.
pub type MessageStream = BoxStream<'static, PubSubMessage>;

/// Operations the caching subsystem needs from a key-value store.
///
/// Values are opaque bytes; TTLs are whole seconds on the wire and a zero
/// duration is rounded up to one second.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value with an expiry
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete keys in one pipelined round trip, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Check whether a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Reset the expiry of an existing key, `false` if the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live; `None` when the key is absent or persistent
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Fetch several values; the result is positionally aligned with `keys`
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Store several values, each with its own expiry, in one pipeline
    async fn mset(&self, entries: &[(String, Vec<u8>, Duration)]) -> Result<()>;

    /// Scan one page of keys matching a glob pattern
    async fn scan(&self, cursor: ScanCursor, pattern: &str, count: usize) -> Result<ScanPage>;

    /// Publish a payload on a channel, returning the receiver count when known
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// Open a dedicated subscription to the given channels
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream>;

    /// Round-trip liveness probe
    async fn ping(&self) -> Result<()>;

    /// Short backend label used in logs and health reports
    fn kind(&self) -> &'static str;
}

/// Convert a TTL to the whole seconds sent on the wire (at least one)
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
