//! Rule-driven invalidation engine
//!
//! ## How It Works
//!
//! ```text
//! emit(event)
//!   ├─ local dispatch: match rules → invalidate now, or arm a debounce timer
//!   └─ PUBLISH invalidation <event json>
//!
//! peer instance
//!   └─ subscriber task receives <event json> → local dispatch
//! ```
//!
//! Delayed rules keep one pending timer per `(rule id, entity id)`. A new
//! event for the same pair aborts the pending timer and arms a fresh one,
//! so a burst of updates collapses into a single invalidation.

use crate::backend::{MessageStream, RetryPolicy};
use crate::cache::types::INVALIDATION_CHANNEL;
use crate::cache::TieredCache;
use crate::error::{CacheError, Result};
use crate::invalidation::event::InvalidationEvent;
use crate::invalidation::rule::InvalidationRule;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the local observer channel
const OBSERVER_CAPACITY: usize = 256;

/// Counters accumulated across rule executions
#[derive(Debug, Default)]
struct EngineCounters {
    events_processed: u64,
    rules_executed: u64,
    keys_invalidated: u64,
    failures: u64,
    total_latency_us: u64,
    per_rule: HashMap<String, u64>,
}

/// Snapshot of engine activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMetrics {
    /// Events dispatched locally, whether or not any rule matched
    pub events_processed: u64,
    /// Rule executions, immediate or after a debounce delay
    pub rules_executed: u64,
    /// Keys removed across every execution
    pub keys_invalidated: u64,
    /// `(namespace, pattern)` pairs that failed
    pub failures: u64,
    /// Mean wall time of one rule execution
    pub average_latency_ms: f64,
    /// Executions per rule id
    pub rule_invalidations: BTreeMap<String, u64>,
    /// Debounce timers currently armed
    pub pending_timers: usize,
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerKey = (String, String);

struct EngineInner {
    cache: Arc<TieredCache>,
    instance_id: String,
    rules: RwLock<Vec<InvalidationRule>>,
    pending: DashMap<TimerKey, PendingTimer>,
    generation: AtomicU64,
    observers: broadcast::Sender<InvalidationEvent>,
    counters: Mutex<EngineCounters>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
    reconnect: RetryPolicy,
}

/// Invalidation engine; cheap to clone, clones share state
#[derive(Clone)]
pub struct InvalidationEngine {
    inner: Arc<EngineInner>,
}

impl InvalidationEngine {
    /// Engine with no rules
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self::with_rules(cache, Vec::new())
    }

    /// Engine preloaded with the requirements-domain rule set
    pub fn with_default_rules(cache: Arc<TieredCache>) -> Self {
        Self::with_rules(cache, crate::invalidation::defaults::default_rules())
    }

    /// Engine with an initial rule table (not validated)
    pub fn with_rules(cache: Arc<TieredCache>, rules: Vec<InvalidationRule>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        let instance_id = uuid::Uuid::new_v4().to_string();
        debug!(instance = %instance_id, rules = rules.len(), "Creating invalidation engine");

        Self {
            inner: Arc::new(EngineInner {
                cache,
                instance_id,
                rules: RwLock::new(rules),
                pending: DashMap::new(),
                generation: AtomicU64::new(0),
                observers,
                counters: Mutex::new(EngineCounters::default()),
                subscriber: Mutex::new(None),
                reconnect: RetryPolicy {
                    max_attempts: u32::MAX,
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(300),
                },
            }),
        }
    }

    /// Identifier stamped on events this instance publishes
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Register a rule
    pub async fn add_rule(&self, rule: InvalidationRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.inner.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CacheError::DuplicateRule(rule.id));
        }
        info!(rule = %rule.id, trigger = %rule.trigger_event, "Added invalidation rule");
        rules.push(rule);
        Ok(())
    }

    /// Remove a rule, cancelling its pending timers
    pub async fn remove_rule(&self, id: &str) -> Result<InvalidationRule> {
        let removed = {
            let mut rules = self.inner.rules.write().await;
            let index = rules
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| CacheError::RuleNotFound(id.to_string()))?;
            rules.remove(index)
        };
        let cancelled = self.inner.cancel_timers(id);
        info!(rule = %id, cancelled, "Removed invalidation rule");
        Ok(removed)
    }

    pub async fn enable_rule(&self, id: &str) -> Result<()> {
        self.set_enabled(id, true).await
    }

    /// Disable a rule; timers it already armed are cancelled
    pub async fn disable_rule(&self, id: &str) -> Result<()> {
        self.set_enabled(id, false).await?;
        let cancelled = self.inner.cancel_timers(id);
        if cancelled > 0 {
            debug!(rule = %id, cancelled, "Cancelled pending invalidations");
        }
        Ok(())
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.inner.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CacheError::RuleNotFound(id.to_string()))?;
        rule.enabled = enabled;
        info!(rule = %id, enabled, "Updated invalidation rule");
        Ok(())
    }

    pub async fn rule(&self, id: &str) -> Option<InvalidationRule> {
        self.inner.rules.read().await.iter().find(|r| r.id == id).cloned()
    }

    pub async fn rules(&self) -> Vec<InvalidationRule> {
        self.inner.rules.read().await.clone()
    }

    /// Receive every event dispatched on this instance
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.inner.observers.subscribe()
    }

    /// Dispatch an event locally, then publish it to peers.
    ///
    /// Publishing is best-effort: a bus failure is logged and local
    /// invalidation has already happened.
    pub async fn emit(&self, mut event: InvalidationEvent) {
        if event.origin.is_none() {
            event.origin = Some(self.inner.instance_id.clone());
        }

        Arc::clone(&self.inner).dispatch(event.clone()).await;

        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = self
                    .inner
                    .cache
                    .backend()
                    .publish(INVALIDATION_CHANNEL, &payload)
                    .await
                {
                    warn!(event = %event.event_type, error = %e, "Failed to publish invalidation event");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode invalidation event"),
        }
    }

    /// Dispatch an event locally without publishing it
    pub async fn process_event(&self, event: InvalidationEvent) {
        Arc::clone(&self.inner).dispatch(event).await;
    }

    /// Subscribe to peer events on a dedicated connection.
    ///
    /// The first subscription is made before returning, so events published
    /// afterwards are not missed. If the subscription drops it is re-opened
    /// with exponential backoff. Calling `start` again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let stream = self
            .inner
            .cache
            .backend()
            .subscribe(&[INVALIDATION_CHANNEL.to_string()])
            .await?;
        info!(instance = %self.inner.instance_id, "Subscribed to {} channel", INVALIDATION_CHANNEL);

        let handle = tokio::spawn(Arc::clone(&self.inner).run_subscriber(stream));
        let mut slot = lock(&self.inner.subscriber);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.subscriber)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the subscriber and cancel every pending timer
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.subscriber).take() {
            handle.abort();
        }
        let keys: Vec<TimerKey> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, timer)) = self.inner.pending.remove(&key) {
                timer.handle.abort();
            }
        }
        info!(instance = %self.inner.instance_id, "Invalidation engine stopped");
    }

    /// Number of armed debounce timers
    pub fn pending_timers(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn metrics(&self) -> InvalidationMetrics {
        let counters = lock(&self.inner.counters);
        InvalidationMetrics {
            events_processed: counters.events_processed,
            rules_executed: counters.rules_executed,
            keys_invalidated: counters.keys_invalidated,
            failures: counters.failures,
            average_latency_ms: if counters.rules_executed == 0 {
                0.0
            } else {
                counters.total_latency_us as f64 / counters.rules_executed as f64 / 1000.0
            },
            rule_invalidations: counters
                .per_rule
                .iter()
                .map(|(id, count)| (id.clone(), *count))
                .collect(),
            pending_timers: self.inner.pending.len(),
        }
    }

    pub fn reset_metrics(&self) {
        *lock(&self.inner.counters) = EngineCounters::default();
    }
}

impl EngineInner {
    async fn dispatch(self: Arc<Self>, event: InvalidationEvent) {
        lock(&self.counters).events_processed += 1;
        // no observers is fine
        let _ = self.observers.send(event.clone());

        let matched: Vec<InvalidationRule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|rule| rule.matches(&event))
            .cloned()
            .collect();

        if matched.is_empty() {
            debug!(event = %event.event_type, entity = %event.entity_id, "No invalidation rules matched");
            return;
        }

        let mut immediate = Vec::new();
        for rule in matched {
            match rule.delay {
                Some(delay) => Arc::clone(&self).arm_timer(rule, event.clone(), delay),
                None => immediate.push(rule),
            }
        }

        join_all(immediate.iter().map(|rule| self.execute_rule(rule, &event))).await;
    }

    fn arm_timer(self: Arc<Self>, rule: InvalidationRule, event: InvalidationEvent, delay: Duration) {
        let key: TimerKey = (rule.id.clone(), event.entity_id.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self);
        let task_key = key.clone();

        // the entry holds the shard lock, so the task's own removal cannot
        // run before its timer is recorded
        let slot = self.pending.entry(key);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // once fired the execution can no longer be cancelled by a re-arm
            inner
                .pending
                .remove_if(&task_key, |_, timer| timer.generation == generation);
            inner.execute_rule(&rule, &event).await;
        });

        match slot {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(PendingTimer { generation, handle });
                previous.handle.abort();
                debug!("Replaced pending invalidation timer");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingTimer { generation, handle });
            }
        }
    }

    fn cancel_timers(&self, rule_id: &str) -> usize {
        let keys: Vec<TimerKey> = self
            .pending
            .iter()
            .filter(|entry| entry.key().0 == rule_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, timer)) = self.pending.remove(&key) {
                timer.handle.abort();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Invalidate every `(namespace, pattern)` pair of a rule concurrently
    async fn execute_rule(&self, rule: &InvalidationRule, event: &InvalidationEvent) -> u64 {
        let start = Instant::now();
        let pairs = rule.resolve(event);

        let results = join_all(pairs.iter().map(|(namespace, pattern)| async move {
            let outcome = self
                .cache
                .try_invalidate_pattern(pattern, Some(namespace.as_str()))
                .await;
            (namespace, pattern, outcome)
        }))
        .await;

        let mut removed = 0;
        let mut failures = 0;
        for (namespace, pattern, outcome) in results {
            match outcome {
                Ok(count) => removed += count,
                Err(e) => {
                    failures += 1;
                    warn!(
                        rule = %rule.id,
                        namespace = %namespace,
                        pattern = %pattern,
                        error = %e,
                        "Pattern invalidation failed"
                    );
                }
            }
        }

        let elapsed = start.elapsed();
        {
            let mut counters = lock(&self.counters);
            counters.rules_executed += 1;
            counters.keys_invalidated += removed;
            counters.failures += failures;
            counters.total_latency_us += elapsed.as_micros().min(u64::MAX as u128) as u64;
            *counters.per_rule.entry(rule.id.clone()).or_insert(0) += 1;
        }

        debug!(
            rule = %rule.id,
            entity = %event.entity_id,
            removed,
            failures,
            elapsed_ms = elapsed.as_millis() as u64,
            "Executed invalidation rule"
        );
        removed
    }

    async fn handle_bus_message(self: &Arc<Self>, payload: &str) {
        let event: InvalidationEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable invalidation message");
                return;
            }
        };

        if event.origin.as_deref() == Some(self.instance_id.as_str()) {
            return;
        }

        debug!(event = %event.event_type, entity = %event.entity_id, "Received peer invalidation event");
        Arc::clone(self).dispatch(event).await;
    }

    async fn run_subscriber(self: Arc<Self>, mut stream: MessageStream) {
        let channels = [INVALIDATION_CHANNEL.to_string()];

        loop {
            while let Some(message) = stream.next().await {
                self.handle_bus_message(&message.payload).await;
            }

            error!("Invalidation subscription closed, reconnecting");
            let mut attempt = 0u32;
            stream = loop {
                attempt = attempt.saturating_add(1);
                let backoff = self.reconnect.delay_for(attempt);
                tokio::time::sleep(backoff).await;

                match self.cache.backend().subscribe(&channels).await {
                    Ok(stream) => {
                        info!(attempt, "Re-subscribed to {} channel", INVALIDATION_CHANNEL);
                        break stream;
                    }
                    Err(e) => warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Invalidation subscription failed"
                    ),
                }
            };
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
