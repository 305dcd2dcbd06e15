//! Per-operation call metrics.
//!
//! The collector is an observer: every `record_*` call is a handful of
//! relaxed atomic increments and never fails. Each record is also forwarded
//! to the [`metrics`] facade so an installed exporter (Prometheus, statsd)
//! sees the same numbers.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::class::FailureClass;
use crate::histogram::{LatencyHistogram, LatencySummary};

pub const CALLS_TOTAL: &str = "apiguard_calls_total";
pub const CACHE_HITS_TOTAL: &str = "apiguard_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "apiguard_cache_misses_total";
pub const FAILURES_TOTAL: &str = "apiguard_failures_total";
pub const RETRIES_TOTAL: &str = "apiguard_retries_total";
pub const CALL_LATENCY_SECONDS: &str = "apiguard_call_latency_seconds";

/// Default cap on distinct operation names.
pub const DEFAULT_MAX_OPERATIONS: usize = 1024;

/// Register descriptions with the installed `metrics` recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(CALLS_TOTAL, "Completed logical calls per operation");
    metrics::describe_counter!(CACHE_HITS_TOTAL, "Calls answered from the cache");
    metrics::describe_counter!(CACHE_MISSES_TOTAL, "Cache lookups that missed");
    metrics::describe_counter!(FAILURES_TOTAL, "Failed calls by failure class");
    metrics::describe_counter!(RETRIES_TOTAL, "Extra attempts made by the retry executor");
    metrics::describe_histogram!(
        CALL_LATENCY_SECONDS,
        metrics::Unit::Seconds,
        "End-to-end call latency including cache, breaker and retries"
    );
}

#[derive(Debug, Default)]
struct OperationStats {
    calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_corruptions: AtomicU64,
    successes: AtomicU64,
    retries: AtomicU64,
    failures: [AtomicU64; FailureClass::COUNT],
    latency: LatencyHistogram,
}

impl OperationStats {
    fn snapshot(&self) -> OperationSnapshot {
        let failures = FailureClass::ALL
            .iter()
            .filter_map(|class| {
                let n = self.failures[class.index()].load(Ordering::Relaxed);
                (n > 0).then_some((*class, n))
            })
            .collect();
        OperationSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_corruptions: self.cache_corruptions.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures,
            latency: self.latency.summary(),
        }
    }
}

/// Counters for one operation at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_corruptions: u64,
    pub successes: u64,
    /// Attempts beyond the first.
    pub retries: u64,
    /// Non-zero failure counts only.
    pub failures: BTreeMap<FailureClass, u64>,
    pub latency: LatencySummary,
}

impl OperationSnapshot {
    pub fn failures_of(&self, class: FailureClass) -> u64 {
        self.failures.get(&class).copied().unwrap_or(0)
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }
}

/// Copy of every tracked operation's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationSnapshot>,
    /// Records dropped because the operation cap was reached.
    pub dropped_records: u64,
}

impl MetricsSnapshot {
    pub fn operation(&self, name: &str) -> Option<&OperationSnapshot> {
        self.operations.get(name)
    }
}

/// Collects call metrics keyed by operation name.
#[derive(Debug)]
pub struct MetricsCollector {
    operations: DashMap<String, Arc<OperationStats>>,
    max_operations: usize,
    dropped: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPERATIONS)
    }
}

impl MetricsCollector {
    pub fn new(max_operations: usize) -> Self {
        Self {
            operations: DashMap::new(),
            max_operations: max_operations.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn stats(&self, operation: &str) -> Option<Arc<OperationStats>> {
        if let Some(stats) = self.operations.get(operation) {
            return Some(Arc::clone(stats.value()));
        }
        if self.operations.len() >= self.max_operations {
            if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                tracing::warn!(
                    operation,
                    max_operations = self.max_operations,
                    "operation cap reached, dropping metrics for new operations"
                );
            }
            return None;
        }
        Some(Arc::clone(
            self.operations
                .entry(operation.to_owned())
                .or_default()
                .value(),
        ))
    }

    pub fn record_cache_hit(&self, operation: &str) {
        if let Some(stats) = self.stats(operation) {
            stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(CACHE_HITS_TOTAL, "operation" => operation.to_owned()).increment(1);
        }
    }

    pub fn record_cache_miss(&self, operation: &str) {
        if let Some(stats) = self.stats(operation) {
            stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(CACHE_MISSES_TOTAL, "operation" => operation.to_owned())
                .increment(1);
        }
    }

    /// A cached entry could not be decoded and was evicted.
    pub fn record_cache_corruption(&self, operation: &str) {
        if let Some(stats) = self.stats(operation) {
            stats.cache_corruptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A call completed successfully after `attempts` remote attempts
    /// (zero when served from the cache).
    pub fn record_success(&self, operation: &str, latency: Duration, attempts: u32) {
        if let Some(stats) = self.stats(operation) {
            stats.successes.fetch_add(1, Ordering::Relaxed);
            self.record_completion(operation, &stats, latency, attempts);
        }
    }

    pub fn record_failure(
        &self,
        operation: &str,
        class: FailureClass,
        latency: Duration,
        attempts: u32,
    ) {
        if let Some(stats) = self.stats(operation) {
            stats.failures[class.index()].fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                FAILURES_TOTAL,
                "operation" => operation.to_owned(),
                "class" => class.as_str()
            )
            .increment(1);
            self.record_completion(operation, &stats, latency, attempts);
        }
    }

    fn record_completion(
        &self,
        operation: &str,
        stats: &OperationStats,
        latency: Duration,
        attempts: u32,
    ) {
        let retries = u64::from(attempts.saturating_sub(1));
        stats.calls.fetch_add(1, Ordering::Relaxed);
        stats.retries.fetch_add(retries, Ordering::Relaxed);
        stats.latency.record(latency);

        metrics::counter!(CALLS_TOTAL, "operation" => operation.to_owned()).increment(1);
        if retries > 0 {
            metrics::counter!(RETRIES_TOTAL, "operation" => operation.to_owned())
                .increment(retries);
        }
        metrics::histogram!(CALL_LATENCY_SECONDS, "operation" => operation.to_owned())
            .record(latency.as_secs_f64());
    }

    /// Copy of the counters for one operation.
    pub fn operation(&self, operation: &str) -> Option<OperationSnapshot> {
        self.operations
            .get(operation)
            .map(|stats| stats.value().snapshot())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self
                .operations
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().snapshot()))
                .collect(),
            dropped_records: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Forget every operation.
    pub fn reset(&self) {
        self.operations.clear();
        self.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_hits_and_failures_per_operation() {
        let collector = MetricsCollector::default();
        collector.record_cache_miss("list-hosts");
        collector.record_success("list-hosts", Duration::from_millis(20), 1);
        collector.record_cache_hit("list-hosts");
        collector.record_success("list-hosts", Duration::from_micros(50), 0);
        collector.record_failure(
            "get-host",
            FailureClass::TransientRemoteError,
            Duration::from_millis(300),
            3,
        );

        let snapshot = collector.snapshot();
        let hosts = snapshot.operation("list-hosts").unwrap();
        assert_eq!(hosts.calls, 2);
        assert_eq!(hosts.successes, 2);
        assert_eq!(hosts.cache_hits, 1);
        assert_eq!(hosts.cache_misses, 1);
        assert_eq!(hosts.total_failures(), 0);
        assert_eq!(hosts.latency.count, 2);

        let host = snapshot.operation("get-host").unwrap();
        assert_eq!(host.calls, 1);
        assert_eq!(host.retries, 2);
        assert_eq!(host.failures_of(FailureClass::TransientRemoteError), 1);
        assert_eq!(host.failures_of(FailureClass::CircuitOpen), 0);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let collector = MetricsCollector::default();
        collector.record_success("list-hosts", Duration::from_millis(1), 1);
        let before = collector.snapshot();
        collector.record_success("list-hosts", Duration::from_millis(1), 1);
        assert_eq!(before.operation("list-hosts").unwrap().calls, 1);
        assert_eq!(collector.operation("list-hosts").unwrap().calls, 2);
    }

    #[test]
    fn operations_beyond_the_cap_are_dropped() {
        let collector = MetricsCollector::new(2);
        collector.record_success("a", Duration::from_millis(1), 1);
        collector.record_success("b", Duration::from_millis(1), 1);
        collector.record_success("c", Duration::from_millis(1), 1);
        collector.record_success("a", Duration::from_millis(1), 1);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.operations.len(), 2);
        assert!(snapshot.operation("c").is_none());
        assert_eq!(snapshot.operation("a").unwrap().calls, 2);
        assert_eq!(snapshot.dropped_records, 1);
    }

    #[test]
    fn snapshot_serializes_with_class_names() {
        let collector = MetricsCollector::default();
        collector.record_failure("list-hosts", FailureClass::CircuitOpen, Duration::ZERO, 0);
        let json = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(json["operations"]["list-hosts"]["failures"]["circuit_open"], 1);
    }

    #[test]
    fn records_reach_the_metrics_facade() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let collector = MetricsCollector::default();

        metrics::with_local_recorder(&recorder, || {
            collector.record_cache_hit("list-hosts");
            collector.record_success("list-hosts", Duration::from_millis(2), 0);
            collector.record_success("list-hosts", Duration::from_millis(4), 2);
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"apiguard_calls_total{operation="list-hosts"} 2"#), "{rendered}");
        assert!(rendered.contains(r#"apiguard_cache_hits_total{operation="list-hosts"} 1"#));
        assert!(rendered.contains(r#"apiguard_retries_total{operation="list-hosts"} 1"#));
        assert!(rendered.contains("apiguard_call_latency_seconds"));
    }

    #[test]
    fn reset_forgets_everything() {
        let collector = MetricsCollector::default();
        collector.record_success("list-hosts", Duration::from_millis(1), 1);
        collector.reset();
        assert!(collector.snapshot().operations.is_empty());
    }
}
