//! In-process key-value backend
//!
//! Keeps keys in an ordered map so scans can resume after the last key
//! examined, which stays correct when the caller deletes keys between pages.
//! Expiry uses `tokio::time::Instant`, so tests can drive it with a paused
//! clock.

use super::{KvBackend, MessageStream, PubSubMessage, ScanCursor, ScanPage};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory backend with Redis-compatible glob matching and pub/sub
#[derive(Clone)]
pub struct MemoryBackend {
    entries: Arc<RwLock<BTreeMap<String, StoredValue>>>,
    bus: broadcast::Sender<PubSubMessage>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            bus,
        }
    }

    /// Number of live keys (expired keys are not counted)
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|v| !v.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Raw key listing for assertions and debugging
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(k, v)| !v.is_expired(now) && matcher.is_match(k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// Overwrite a raw value without touching its expiry (test hook for corruption)
    pub async fn put_raw(&self, key: &str, data: Vec<u8>) {
        let mut entries = self.entries.write().await;
        let expires_at = entries.get(key).and_then(|v| v.expires_at);
        entries.insert(key.to_string(), StoredValue { data, expires_at });
    }

    async fn live_value(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(v) if !v.is_expired(now) => return Some(v.clone()),
                None => return None,
                Some(_) => {}
            }
        }
        // Expired: purge lazily, unless a writer replaced it meanwhile
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|v| v.is_expired(now)) {
            entries.remove(key);
        }
        None
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live_value(key).await.map(|v| v.data))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + Duration::from_secs(super::ttl_secs(ttl));
        self.entries.write().await.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(v) = entries.remove(key) {
                if !v.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_value(key).await.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(v) if !v.is_expired(now) => {
                v.expires_at = Some(now + Duration::from_secs(super::ttl_secs(ttl)));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .live_value(key)
            .await
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|k| {
                entries
                    .get(k)
                    .filter(|v| !v.is_expired(now))
                    .map(|v| v.data.clone())
            })
            .collect())
    }

    async fn mset(&self, items: &[(String, Vec<u8>, Duration)]) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        for (key, data, ttl) in items {
            entries.insert(
                key.clone(),
                StoredValue {
                    data: data.clone(),
                    expires_at: Some(now + Duration::from_secs(super::ttl_secs(*ttl))),
                },
            );
        }
        Ok(())
    }

    async fn scan(&self, cursor: ScanCursor, pattern: &str, count: usize) -> Result<ScanPage> {
        let matcher = glob_to_regex(pattern)?;
        let lower = match cursor {
            ScanCursor::Start => Bound::Unbounded,
            ScanCursor::AfterKey(key) => Bound::Excluded(key),
            ScanCursor::Node { .. } => {
                return Err(CacheError::Other(
                    "node cursor passed to memory backend".to_string(),
                ))
            }
        };

        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut examined = entries.range((lower, Bound::Unbounded)).peekable();
        let mut page = ScanPage::default();
        let mut last = None;

        for _ in 0..count.max(1) {
            let Some((key, value)) = examined.next() else {
                break;
            };
            if !value.is_expired(now) && matcher.is_match(key) {
                page.keys.push(key.clone());
            }
            last = Some(key.clone());
        }

        if examined.peek().is_some() {
            page.next = last.map(ScanCursor::AfterKey);
        }
        Ok(page)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let message = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // No subscribers is not an error, same as PUBLISH returning 0
        Ok(self.bus.send(message).map(|n| n as u64).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let receiver = self.bus.subscribe();
        debug!(channels = ?channels, "memory backend subscription opened");

        let stream = futures::stream::unfold(
            (receiver, wanted),
            |(mut receiver, wanted)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) if wanted.contains(&message.channel) => {
                            return Some((message, (receiver, wanted)))
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "memory subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );
        let stream: MessageStream = Box::pin(stream);
        Ok(stream)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// Translate a Redis glob (`*`, `?`, `[...]`, `\` escapes) into an anchored regex
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?s)^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => out.push_str(r"\\"),
            },
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    match inner {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                out.push('\\');
                                out.push(escaped);
                            }
                        }
                        '[' | '&' | '~' => {
                            out.push('\\');
                            out.push(inner);
                        }
                        other => out.push(other),
                    }
                }
                if !closed {
                    return Err(CacheError::Other(format!(
                        "unterminated character class in pattern: {}",
                        pattern
                    )));
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Regex::new(&out).map_err(|e| CacheError::Other(format!("invalid pattern {}: {}", pattern, e)))
}
