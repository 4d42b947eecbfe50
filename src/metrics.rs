//! Thread-safe collection and aggregation of runtime telemetry.
//!
//! Three bounded FIFO arenas hold request, component, and cache metrics.
//! Every arena has a hard capacity (default 10 000); recording past it
//! evicts the oldest entry, so memory use is flat no matter how long the
//! process runs. All mutation is serialized under a single mutex, and the
//! mutex is never held across I/O: serialization snapshots the arenas under
//! the lock and writes after releasing it.
//!
//! Aggregation produces counts, error rates, average/min/max timings,
//! p95/p99 percentiles, and memory-delta summaries, either across all
//! requests or restricted to one endpoint, component type, or cache store.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Error;

/// Default per-arena entry cap.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Per-endpoint recent-timing window cap.
const ENDPOINT_WINDOW_CAP: usize = 1_000;

/// One completed request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub processing_time_ms: f64,
    pub memory_before: u64,
    pub memory_after: u64,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
}

impl RequestMetric {
    pub fn memory_delta(&self) -> i64 {
        self.memory_after as i64 - self.memory_before as i64
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Lifecycle events a live component reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentEvent {
    Mount,
    Unmount,
    Refresh,
    EventHandler,
}

/// One component lifecycle observation.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentMetric {
    pub component_id: String,
    pub component_type: String,
    pub event: ComponentEvent,
    pub processing_time_ms: Option<f64>,
    pub memory_before: Option<u64>,
    pub memory_after: Option<u64>,
    /// Component age at the time of the event, in seconds.
    pub age_at_event_secs: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// One instrumented cache operation.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetric {
    pub key: String,
    pub operation: String,
    pub store_type: String,
    pub processing_time_ms: f64,
    /// `Some` for reads: whether the key was found.
    pub hit: Option<bool>,
    pub key_size: usize,
    /// `Some` for operations that carry a value payload.
    pub value_size: Option<usize>,
    pub ttl_secs: Option<u64>,
    pub error: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Arenas {
    requests: VecDeque<RequestMetric>,
    components: VecDeque<ComponentMetric>,
    caches: VecDeque<CacheMetric>,
    endpoint_windows: HashMap<String, VecDeque<f64>>,
    cache_op_counts: HashMap<String, u64>,
    cache_error_counts: HashMap<String, u64>,
}

/// Aggregate over a set of request metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub avg_memory_delta: f64,
    pub peak_memory_delta: i64,
    /// Sum of positive memory deltas across the set, in bytes.
    pub total_allocated: i64,
}

/// Aggregate over component lifecycle observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentStats {
    pub count: usize,
    pub mounts: usize,
    pub unmounts: usize,
    pub refreshes: usize,
    pub event_handlers: usize,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Aggregate over cache operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub hit_rate: Option<f64>,
    pub avg_value_size: Option<f64>,
    pub total_data_written: u64,
}

/// Per-operation cache breakdown entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheOpStats {
    pub count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub hit_rate: Option<f64>,
    pub avg_value_size: Option<f64>,
    pub total_data_written: Option<u64>,
}

/// Owned copy of the arenas, serialized outside the lock.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: Vec<RequestMetric>,
    pub components: Vec<ComponentMetric>,
    pub caches: Vec<CacheMetric>,
}

/// Bounded, mutex-guarded metric storage.
pub struct MetricsEngine {
    capacity: usize,
    inner: Mutex<Arenas>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Arenas::default()),
        }
    }

    /// Appends a request metric, evicting the oldest entry at capacity and
    /// updating the endpoint's recent-timing window.
    pub fn record_request(&self, metric: RequestMetric) {
        let mut inner = self.inner.lock();
        let window = inner
            .endpoint_windows
            .entry(metric.endpoint.clone())
            .or_default();
        window.push_back(metric.processing_time_ms);
        if window.len() > ENDPOINT_WINDOW_CAP {
            window.pop_front();
        }

        inner.requests.push_back(metric);
        if inner.requests.len() > self.capacity {
            inner.requests.pop_front();
        }
    }

    pub fn record_component(&self, metric: ComponentMetric) {
        let mut inner = self.inner.lock();
        inner.components.push_back(metric);
        if inner.components.len() > self.capacity {
            inner.components.pop_front();
        }
    }

    pub fn record_cache(&self, metric: CacheMetric) {
        let mut inner = self.inner.lock();
        *inner
            .cache_op_counts
            .entry(metric.operation.clone())
            .or_default() += 1;
        if metric.error {
            *inner
                .cache_error_counts
                .entry(metric.operation.clone())
                .or_default() += 1;
        }

        inner.caches.push_back(metric);
        if inner.caches.len() > self.capacity {
            inner.caches.pop_front();
        }
    }

    /// Aggregates request metrics recorded at or after `since` (all of them
    /// when `since` is `None`).
    pub fn aggregate(&self, since: Option<DateTime<Utc>>) -> AggregateStats {
        let selected: Vec<RequestMetric> = {
            let inner = self.inner.lock();
            inner
                .requests
                .iter()
                .filter(|m| since.is_none_or(|s| m.timestamp >= s))
                .cloned()
                .collect()
        };
        aggregate_requests(&selected)
    }

    /// Like [`aggregate`](Self::aggregate), restricted to one endpoint.
    pub fn endpoint_stats(&self, endpoint: &str, since: Option<DateTime<Utc>>) -> AggregateStats {
        let selected: Vec<RequestMetric> = {
            let inner = self.inner.lock();
            inner
                .requests
                .iter()
                .filter(|m| m.endpoint == endpoint)
                .filter(|m| since.is_none_or(|s| m.timestamp >= s))
                .cloned()
                .collect()
        };
        aggregate_requests(&selected)
    }

    /// Component aggregation, optionally restricted to one component type.
    pub fn component_stats(
        &self,
        component_type: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> ComponentStats {
        let selected: Vec<ComponentMetric> = {
            let inner = self.inner.lock();
            inner
                .components
                .iter()
                .filter(|m| component_type.is_none_or(|t| m.component_type == t))
                .filter(|m| since.is_none_or(|s| m.timestamp >= s))
                .cloned()
                .collect()
        };

        let mut stats = ComponentStats {
            count: selected.len(),
            ..ComponentStats::default()
        };
        for metric in &selected {
            match metric.event {
                ComponentEvent::Mount => stats.mounts += 1,
                ComponentEvent::Unmount => stats.unmounts += 1,
                ComponentEvent::Refresh => stats.refreshes += 1,
                ComponentEvent::EventHandler => stats.event_handlers += 1,
            }
        }

        let mut times: Vec<f64> = selected
            .iter()
            .filter_map(|m| m.processing_time_ms)
            .collect();
        if !times.is_empty() {
            times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            stats.avg_ms = times.iter().sum::<f64>() / times.len() as f64;
            stats.max_ms = *times.last().unwrap_or(&0.0);
            stats.p95_ms = percentile(&times, 0.95);
            stats.p99_ms = percentile(&times, 0.99);
        }
        stats
    }

    /// Cache aggregation, optionally restricted to one store type.
    pub fn cache_stats(
        &self,
        store_type: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> CacheStats {
        let selected: Vec<CacheMetric> = {
            let inner = self.inner.lock();
            inner
                .caches
                .iter()
                .filter(|m| store_type.is_none_or(|t| m.store_type == t))
                .filter(|m| since.is_none_or(|s| m.timestamp >= s))
                .cloned()
                .collect()
        };
        let base = aggregate_cache(&selected);
        CacheStats {
            count: base.count,
            error_count: base.error_count,
            error_rate: base.error_rate,
            avg_ms: base.avg_ms,
            min_ms: base.min_ms,
            max_ms: base.max_ms,
            hit_rate: base.hit_rate,
            avg_value_size: base.avg_value_size,
            total_data_written: base.total_data_written.unwrap_or(0),
        }
    }

    /// Per-operation cache breakdown.
    pub fn cache_operation_breakdown(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> BTreeMap<String, CacheOpStats> {
        let selected: Vec<CacheMetric> = {
            let inner = self.inner.lock();
            inner
                .caches
                .iter()
                .filter(|m| since.is_none_or(|s| m.timestamp >= s))
                .cloned()
                .collect()
        };

        let mut by_op: BTreeMap<String, Vec<CacheMetric>> = BTreeMap::new();
        for metric in selected {
            by_op.entry(metric.operation.clone()).or_default().push(metric);
        }
        by_op
            .into_iter()
            .map(|(op, metrics)| (op, aggregate_cache(&metrics)))
            .collect()
    }

    /// The most recent request metrics, newest first.
    pub fn recent_requests(&self, limit: usize) -> Vec<RequestMetric> {
        let inner = self.inner.lock();
        inner.requests.iter().rev().take(limit).cloned().collect()
    }

    /// Total cumulative cache-operation counters (not bounded by the arena).
    pub fn cache_operation_counts(&self) -> HashMap<String, u64> {
        self.inner.lock().cache_op_counts.clone()
    }

    /// Drops every recorded metric and counter.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Arenas::default();
    }

    /// Clones the arenas for serialization.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        MetricsSnapshot {
            requests: inner.requests.iter().cloned().collect(),
            components: inner.components.iter().cloned().collect(),
            caches: inner.caches.iter().cloned().collect(),
        }
    }

    /// Serializes a snapshot as JSON. The arena lock is released before any
    /// byte is written.
    pub fn to_json<W: std::io::Write>(&self, writer: W) -> Result<(), Error> {
        let snapshot = self.snapshot();
        serde_json::to_writer(writer, &snapshot)
            .map_err(|e| Error::internal(format!("failed to serialize metrics: {e}")))
    }

    #[cfg(test)]
    fn arena_sizes(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (
            inner.requests.len(),
            inner.components.len(),
            inner.caches.len(),
        )
    }
}

fn aggregate_requests(selected: &[RequestMetric]) -> AggregateStats {
    if selected.is_empty() {
        return AggregateStats::default();
    }

    let mut times: Vec<f64> = selected.iter().map(|m| m.processing_time_ms).collect();
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let error_count = selected.iter().filter(|m| m.is_error()).count();
    let deltas: Vec<i64> = selected.iter().map(RequestMetric::memory_delta).collect();

    AggregateStats {
        count: selected.len(),
        error_count,
        error_rate: error_count as f64 / selected.len() as f64,
        avg_ms: times.iter().sum::<f64>() / times.len() as f64,
        min_ms: *times.first().unwrap_or(&0.0),
        max_ms: *times.last().unwrap_or(&0.0),
        p95_ms: percentile(&times, 0.95),
        p99_ms: percentile(&times, 0.99),
        avg_memory_delta: deltas.iter().sum::<i64>() as f64 / deltas.len() as f64,
        peak_memory_delta: deltas.iter().copied().max().unwrap_or(0),
        total_allocated: deltas.iter().filter(|d| **d > 0).sum(),
    }
}

fn aggregate_cache(selected: &[CacheMetric]) -> CacheOpStats {
    if selected.is_empty() {
        return CacheOpStats::default();
    }

    let mut times: Vec<f64> = selected.iter().map(|m| m.processing_time_ms).collect();
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let error_count = selected.iter().filter(|m| m.error).count();

    let reads: Vec<bool> = selected.iter().filter_map(|m| m.hit).collect();
    let hit_rate = if reads.is_empty() {
        None
    } else {
        Some(reads.iter().filter(|hit| **hit).count() as f64 / reads.len() as f64)
    };

    let sizes: Vec<usize> = selected.iter().filter_map(|m| m.value_size).collect();
    let avg_value_size = if sizes.is_empty() {
        None
    } else {
        Some(sizes.iter().sum::<usize>() as f64 / sizes.len() as f64)
    };
    let total_data_written = if sizes.is_empty() {
        None
    } else {
        Some(sizes.iter().map(|s| *s as u64).sum())
    };

    CacheOpStats {
        count: selected.len(),
        error_count,
        error_rate: error_count as f64 / selected.len() as f64,
        avg_ms: times.iter().sum::<f64>() / times.len() as f64,
        min_ms: *times.first().unwrap_or(&0.0),
        max_ms: *times.last().unwrap_or(&0.0),
        hit_rate,
        avg_value_size,
        total_data_written,
    }
}

/// Percentile of a sorted slice: the element at `floor(p * (N - 1))`.
/// An empty slice yields 0; a single element is every percentile.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request_metric(endpoint: &str, time_ms: f64, status: u16) -> RequestMetric {
        RequestMetric {
            endpoint: endpoint.to_string(),
            method: "GET".to_string(),
            path: format!("/{endpoint}"),
            processing_time_ms: time_ms,
            memory_before: 1_000,
            memory_after: 1_500,
            status_code: status,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    fn cache_metric(op: &str, hit: Option<bool>, value_size: Option<usize>, error: bool) -> CacheMetric {
        CacheMetric {
            key: "k".to_string(),
            operation: op.to_string(),
            store_type: "memory".to_string(),
            processing_time_ms: 0.5,
            hit,
            key_size: 1,
            value_size,
            ttl_secs: None,
            error,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn percentile_boundaries_hold() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[7.0], 0.99), 7.0);
    }

    #[test]
    fn percentile_is_monotonic_in_p() {
        let sorted: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut last = f64::MIN;
        for step in 0..=100 {
            let p = step as f64 / 100.0;
            let value = percentile(&sorted, p);
            assert!(value >= last, "p={p} regressed: {value} < {last}");
            last = value;
        }
    }

    #[test]
    fn arenas_never_exceed_capacity() {
        let engine = MetricsEngine::with_capacity(50);
        for i in 0..500 {
            engine.record_request(request_metric("home", i as f64, 200));
            engine.record_component(ComponentMetric {
                component_id: i.to_string(),
                component_type: "Counter".to_string(),
                event: ComponentEvent::Refresh,
                processing_time_ms: Some(0.1),
                memory_before: None,
                memory_after: None,
                age_at_event_secs: None,
                timestamp: Utc::now(),
            });
            engine.record_cache(cache_metric("get", Some(true), None, false));
        }
        assert_eq!(engine.arena_sizes(), (50, 50, 50));

        // Oldest entries were the ones evicted.
        let recent = engine.recent_requests(1);
        assert_eq!(recent[0].processing_time_ms, 499.0);
    }

    #[test]
    fn aggregate_computes_counts_errors_and_percentiles() {
        let engine = MetricsEngine::new();
        for i in 1..=100 {
            let status = if i % 10 == 0 { 500 } else { 200 };
            engine.record_request(request_metric("home", i as f64, status));
        }

        let stats = engine.aggregate(None);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.error_count, 10);
        assert!((stats.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 100.0);
        assert_eq!(stats.p95_ms, 95.0);
        assert_eq!(stats.p99_ms, 99.0);
        assert_eq!(stats.peak_memory_delta, 500);
        assert_eq!(stats.total_allocated, 100 * 500);
    }

    #[test]
    fn endpoint_stats_are_restricted() {
        let engine = MetricsEngine::new();
        engine.record_request(request_metric("home", 10.0, 200));
        engine.record_request(request_metric("admin", 50.0, 200));

        let home = engine.endpoint_stats("home", None);
        assert_eq!(home.count, 1);
        assert_eq!(home.max_ms, 10.0);
        assert_eq!(engine.endpoint_stats("missing", None).count, 0);
    }

    #[test]
    fn since_filters_by_timestamp() {
        let engine = MetricsEngine::new();
        let mut old = request_metric("home", 10.0, 200);
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        engine.record_request(old);
        engine.record_request(request_metric("home", 20.0, 200));

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(engine.aggregate(Some(cutoff)).count, 1);
        assert_eq!(engine.aggregate(None).count, 2);
    }

    #[test]
    fn component_stats_count_lifecycle_events() {
        let engine = MetricsEngine::new();
        let events = [
            ComponentEvent::Mount,
            ComponentEvent::Refresh,
            ComponentEvent::Refresh,
            ComponentEvent::Unmount,
        ];
        for event in events {
            engine.record_component(ComponentMetric {
                component_id: "c1".to_string(),
                component_type: "Counter".to_string(),
                event,
                processing_time_ms: Some(1.0),
                memory_before: None,
                memory_after: None,
                age_at_event_secs: Some(2.0),
                timestamp: Utc::now(),
            });
        }

        let stats = engine.component_stats(Some("Counter"), None);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mounts, 1);
        assert_eq!(stats.refreshes, 2);
        assert_eq!(stats.unmounts, 1);
        assert_eq!(engine.component_stats(Some("Other"), None).count, 0);
    }

    #[test]
    fn cache_breakdown_is_per_operation() {
        let engine = MetricsEngine::new();
        engine.record_cache(cache_metric("get", Some(true), None, false));
        engine.record_cache(cache_metric("get", Some(false), None, false));
        engine.record_cache(cache_metric("set", None, Some(100), false));
        engine.record_cache(cache_metric("set", None, Some(300), true));

        let breakdown = engine.cache_operation_breakdown(None);
        let gets = &breakdown["get"];
        assert_eq!(gets.count, 2);
        assert_eq!(gets.hit_rate, Some(0.5));
        assert_eq!(gets.total_data_written, None);

        let sets = &breakdown["set"];
        assert_eq!(sets.count, 2);
        assert_eq!(sets.error_count, 1);
        assert_eq!(sets.avg_value_size, Some(200.0));
        assert_eq!(sets.total_data_written, Some(400));

        let stats = engine.cache_stats(Some("memory"), None);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.total_data_written, 400);
    }

    #[test]
    fn concurrent_recordings_are_all_kept_up_to_capacity() {
        let engine = Arc::new(MetricsEngine::with_capacity(100_000));
        let mut handles = Vec::new();
        for t in 0..8 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000 {
                    engine.record_request(request_metric("load", (t * 1_000 + i) as f64, 200));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.aggregate(None).count, 8_000);
    }

    #[test]
    fn to_json_serializes_a_snapshot() {
        let engine = MetricsEngine::new();
        engine.record_request(request_metric("home", 1.0, 200));

        let mut out = Vec::new();
        engine.to_json(&mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["requests"][0]["endpoint"], "home");
    }

    #[test]
    fn clear_resets_everything() {
        let engine = MetricsEngine::new();
        engine.record_request(request_metric("home", 1.0, 200));
        engine.record_cache(cache_metric("get", Some(true), None, false));
        engine.clear();
        assert_eq!(engine.aggregate(None).count, 0);
        assert!(engine.cache_operation_counts().is_empty());
    }
}
