//! Request performance monitoring middleware.
//!
//! Wraps the rest of the pipeline: samples process memory before and after,
//! makes sure a request id exists, times the downstream work, and records a
//! request metric no matter how the request ended (the recorded status is
//! the one the client will see, including rescued errors). Requests slower
//! than the configured threshold and memory spikes past the configured
//! delta are logged as warnings.

use std::{sync::Arc, time::{Duration, Instant}};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    config,
    endpoint::ENDPOINT_HEADER,
    error::Error,
    metrics::{AggregateStats, MetricsEngine, RequestMetric},
    pipeline::{Next, Stage},
    types::{Request, StageResult},
};

/// Process-level memory probe.
///
/// Abstracted behind a trait so tests can drive the monitor with a fake.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Resident set size of this process, in bytes.
    fn rss_bytes(&self) -> u64;
}

/// Probe backed by the operating system's process table.
pub struct ProcessMemoryProbe {
    system: Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn rss_bytes(&self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[pid]),
            true,
            sysinfo::ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Pipeline stage feeding the metrics engine.
pub struct PerformanceMonitor {
    metrics: Arc<MetricsEngine>,
    probe: Arc<dyn MemoryProbe>,
    slow_threshold: Duration,
    memory_threshold: u64,
}

impl PerformanceMonitor {
    /// Monitor with the OS probe and thresholds from the active config.
    pub fn new(metrics: Arc<MetricsEngine>) -> Self {
        let config = config::current();
        Self::with_probe(
            metrics,
            Arc::new(ProcessMemoryProbe::new()),
            config.slow_request_threshold,
            config.memory_threshold,
        )
    }

    pub fn with_probe(
        metrics: Arc<MetricsEngine>,
        probe: Arc<dyn MemoryProbe>,
        slow_threshold: Duration,
        memory_threshold: u64,
    ) -> Self {
        Self {
            metrics,
            probe,
            slow_threshold,
            memory_threshold,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsEngine> {
        &self.metrics
    }

    pub fn stats(&self, since: Option<DateTime<Utc>>) -> AggregateStats {
        self.metrics.aggregate(since)
    }

    pub fn endpoint_stats(&self, endpoint: &str, since: Option<DateTime<Utc>>) -> AggregateStats {
        self.metrics.endpoint_stats(endpoint, since)
    }

    pub fn recent_requests(&self, limit: usize) -> Vec<RequestMetric> {
        self.metrics.recent_requests(limit)
    }

    pub fn clear(&self) {
        self.metrics.clear();
    }

    /// Human-readable summary of the aggregate stats.
    pub fn report(&self, since: Option<DateTime<Utc>>) -> String {
        let stats = self.stats(since);
        format!(
            "requests: {}\n\
             errors: {} ({:.1}%)\n\
             response time: avg {:.2}ms min {:.2}ms max {:.2}ms p95 {:.2}ms p99 {:.2}ms\n\
             memory delta: avg {:.0}B peak {}B allocated {}B\n",
            stats.count,
            stats.error_count,
            stats.error_rate * 100.0,
            stats.avg_ms,
            stats.min_ms,
            stats.max_ms,
            stats.p95_ms,
            stats.p99_ms,
            stats.avg_memory_delta,
            stats.peak_memory_delta,
            stats.total_allocated,
        )
    }

    /// JSON rendering of the aggregate stats.
    pub fn json_report(&self, since: Option<DateTime<Utc>>) -> Result<String, Error> {
        serde_json::to_string(&self.stats(since))
            .map_err(|e| Error::internal(format!("failed to serialize report: {e}")))
    }
}

#[async_trait]
impl Stage for PerformanceMonitor {
    async fn call(&self, mut req: Request, next: Next) -> StageResult {
        let memory_before = self.probe.rss_bytes();

        if !req.headers().contains_key("x-request-id") {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = id.parse() {
                req.headers_mut().insert("x-request-id", value);
            }
        }
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let start = Instant::now();
        let result = next.run(req).await;
        let elapsed = start.elapsed();
        let memory_after = self.probe.rss_bytes();

        let (status_code, endpoint) = match &result {
            Ok(res) => (
                res.status().as_u16(),
                res.headers()
                    .get(ENDPOINT_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(&path)
                    .to_string(),
            ),
            Err(err) => (err.status().as_u16(), path.clone()),
        };

        let processing_time_ms = elapsed.as_secs_f64() * 1_000.0;
        self.metrics.record_request(RequestMetric {
            endpoint: endpoint.clone(),
            method,
            path: path.clone(),
            processing_time_ms,
            memory_before,
            memory_after,
            status_code,
            timestamp: Utc::now(),
            request_id,
        });

        if elapsed > self.slow_threshold {
            tracing::warn!(
                endpoint,
                path,
                elapsed_ms = processing_time_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "slow request"
            );
        }
        let delta = memory_after.saturating_sub(memory_before);
        if delta > self.memory_threshold {
            tracing::warn!(endpoint, path, delta, "request memory spike");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::HibanaBody;
    use crate::pipeline::Pipeline;
    use crate::types::Response;

    struct SteppingProbe {
        values: Mutex<Vec<u64>>,
    }

    impl SteppingProbe {
        fn new(values: Vec<u64>) -> Self {
            Self {
                values: Mutex::new(values),
            }
        }
    }

    impl MemoryProbe for SteppingProbe {
        fn rss_bytes(&self) -> u64 {
            let mut values = self.values.lock();
            if values.len() > 1 {
                values.remove(0)
            } else {
                values.first().copied().unwrap_or(0)
            }
        }
    }

    fn monitor_with(
        metrics: Arc<MetricsEngine>,
        probe: Vec<u64>,
    ) -> PerformanceMonitor {
        PerformanceMonitor::with_probe(
            metrics,
            Arc::new(SteppingProbe::new(probe)),
            Duration::from_secs(5),
            u64::MAX,
        )
    }

    fn get(path: &str) -> Request {
        http::Request::builder()
            .method("GET")
            .uri(path)
            .body(HibanaBody::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn successful_requests_are_recorded_with_endpoint_identity() {
        let metrics = Arc::new(MetricsEngine::new());
        let handler = Pipeline::new()
            .with(monitor_with(metrics.clone(), vec![1_000, 3_000]))
            .with_fn(|_req, _next| async move {
                let mut res = Response::new(HibanaBody::from("ok"));
                res.headers_mut()
                    .insert(ENDPOINT_HEADER, "reports.show".parse().unwrap());
                Ok(res)
            })
            .build()
            .unwrap();

        handler.call(get("/reports/1")).await.unwrap();

        let recorded = metrics.recent_requests(1);
        assert_eq!(recorded.len(), 1);
        let metric = &recorded[0];
        assert_eq!(metric.endpoint, "reports.show");
        assert_eq!(metric.status_code, 200);
        assert_eq!(metric.memory_delta(), 2_000);
        assert!(metric.request_id.is_some());
    }

    #[tokio::test]
    async fn failed_requests_are_recorded_with_the_error_status() {
        let metrics = Arc::new(MetricsEngine::new());
        let handler = Pipeline::new()
            .with(monitor_with(metrics.clone(), vec![0]))
            .with_fn(|_req, _next| async move {
                Err(Error::not_found("nothing here"))
            })
            .build()
            .unwrap();

        let result = handler.call(get("/missing")).await;
        assert!(result.is_err());

        let recorded = metrics.recent_requests(1);
        assert_eq!(recorded[0].status_code, 404);
        assert_eq!(recorded[0].endpoint, "/missing");
        assert!(recorded[0].is_error());
    }

    #[tokio::test]
    async fn existing_request_ids_are_preserved() {
        let metrics = Arc::new(MetricsEngine::new());
        let handler = Pipeline::new()
            .with(monitor_with(metrics.clone(), vec![0]))
            .with_fn(|_req, _next| async move {
                Ok(Response::new(HibanaBody::empty()))
            })
            .build()
            .unwrap();

        let req = http::Request::builder()
            .method("GET")
            .uri("/")
            .header("x-request-id", "fixed-id")
            .body(HibanaBody::empty())
            .unwrap();
        handler.call(req).await.unwrap();

        assert_eq!(
            metrics.recent_requests(1)[0].request_id.as_deref(),
            Some("fixed-id")
        );
    }

    #[test]
    fn reports_render_without_panicking() {
        let metrics = Arc::new(MetricsEngine::new());
        let monitor = monitor_with(metrics, vec![0]);
        assert!(monitor.report(None).contains("requests: 0"));
        let json: serde_json::Value =
            serde_json::from_str(&monitor.json_report(None).unwrap()).unwrap();
        assert_eq!(json["count"], 0);
    }
}
