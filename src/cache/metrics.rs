//! Per-namespace read metrics
//!
//! Only raw counters are stored. Hit ratio and average latency are derived
//! when a snapshot is taken, so they can never drift from the counters.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits: u64,
    misses: u64,
    errors: u64,
    total_latency_us: u64,
}

impl Counters {
    fn total(&self) -> u64 {
        self.hits + self.misses
    }

    fn merge(&mut self, other: &Counters) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.errors += other.errors;
        self.total_latency_us += other.total_latency_us;
    }

    fn snapshot(&self, namespace: &str) -> NamespaceMetrics {
        let total = self.total();
        NamespaceMetrics {
            namespace: namespace.to_string(),
            hits: self.hits,
            misses: self.misses,
            errors: self.errors,
            total_requests: total,
            hit_ratio: if total == 0 {
                0.0
            } else {
                self.hits as f64 / total as f64
            },
            average_latency_ms: if total == 0 {
                0.0
            } else {
                self.total_latency_us as f64 / total as f64 / 1000.0
            },
        }
    }
}

/// Point-in-time copy of a namespace's metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMetrics {
    pub namespace: String,
    pub hits: u64,
    pub misses: u64,
    /// Reads that failed in the backend (also counted as misses)
    pub errors: u64,
    pub total_requests: u64,
    /// Hits over total requests, 0.0 to 1.0
    pub hit_ratio: f64,
    /// True mean latency of reads in milliseconds
    pub average_latency_ms: f64,
}

impl fmt::Display for NamespaceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{ hits: {}, misses: {}, hit_ratio: {:.2}%, requests: {}, avg_latency: {:.3}ms }}",
            self.namespace,
            self.hits,
            self.misses,
            self.hit_ratio * 100.0,
            self.total_requests,
            self.average_latency_ms
        )
    }
}

/// Name used for the aggregate over all namespaces
pub const AGGREGATE_NAMESPACE: &str = "*";

/// Lazily populated metrics table, one row per namespace
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    namespaces: DashMap<String, Counters>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one read and return the namespace's request total after it
    pub fn record(&self, namespace: &str, hit: bool, latency: Duration) -> u64 {
        let mut counters = self.namespaces.entry(namespace.to_string()).or_default();
        if hit {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        counters.total_latency_us += latency.as_micros().min(u64::MAX as u128) as u64;
        counters.total()
    }

    /// Record a backend failure on a read (counted as a miss)
    pub fn record_error(&self, namespace: &str, latency: Duration) -> u64 {
        let mut counters = self.namespaces.entry(namespace.to_string()).or_default();
        counters.misses += 1;
        counters.errors += 1;
        counters.total_latency_us += latency.as_micros().min(u64::MAX as u128) as u64;
        counters.total()
    }

    /// Snapshot of one namespace, `None` if it has never been read
    pub fn snapshot(&self, namespace: &str) -> Option<NamespaceMetrics> {
        self.namespaces
            .get(namespace)
            .map(|counters| counters.snapshot(namespace))
    }

    /// Snapshot aggregated over every namespace
    pub fn aggregate(&self) -> NamespaceMetrics {
        let mut total = Counters::default();
        for row in self.namespaces.iter() {
            total.merge(row.value());
        }
        total.snapshot(AGGREGATE_NAMESPACE)
    }

    /// Snapshots of every namespace, sorted by name
    pub fn all(&self) -> Vec<NamespaceMetrics> {
        let mut rows: Vec<NamespaceMetrics> = self
            .namespaces
            .iter()
            .map(|row| row.value().snapshot(row.key()))
            .collect();
        rows.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        rows
    }

    pub fn reset(&self) {
        self.namespaces.clear();
    }
}
