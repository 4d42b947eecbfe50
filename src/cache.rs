//! Cache backend interface and metrics instrumentation.
//!
//! Storage itself is an external collaborator: anything implementing
//! [`CacheStore`] plugs in. [`MeteredStore`] wraps a store and records a
//! cache metric for every operation (timing, hit/miss for reads, payload
//! sizes for writes, error flags), feeding the metrics engine's cache arena
//! and operation counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    error::Error,
    metrics::{CacheMetric, MetricsEngine},
};

/// Backend-agnostic cache interface.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error>;
    async fn delete(&self, key: &str) -> Result<bool, Error>;
    async fn exists(&self, key: &str) -> Result<bool, Error>;
    async fn clear(&self) -> Result<(), Error>;
    async fn increment(&self, key: &str, by: i64) -> Result<i64, Error>;
    async fn decrement(&self, key: &str, by: i64) -> Result<i64, Error>;
}

/// Store wrapper recording one metric per operation.
pub struct MeteredStore<S> {
    inner: S,
    store_type: &'static str,
    metrics: Arc<MetricsEngine>,
}

impl<S: CacheStore> MeteredStore<S> {
    pub fn new(inner: S, store_type: &'static str, metrics: Arc<MetricsEngine>) -> Self {
        Self {
            inner,
            store_type,
            metrics,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        operation: &str,
        key: &str,
        started: Instant,
        hit: Option<bool>,
        value_size: Option<usize>,
        ttl: Option<Duration>,
        error: bool,
    ) {
        self.metrics.record_cache(CacheMetric {
            key: key.to_string(),
            operation: operation.to_string(),
            store_type: self.store_type.to_string(),
            processing_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
            hit,
            key_size: key.len(),
            value_size,
            ttl_secs: ttl.map(|t| t.as_secs()),
            error,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for MeteredStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let started = Instant::now();
        let result = self.inner.get(key).await;
        match &result {
            Ok(value) => self.record("get", key, started, Some(value.is_some()), None, None, false),
            Err(_) => self.record("get", key, started, None, None, None, true),
        }
        result
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let started = Instant::now();
        let result = self.inner.set(key, value, ttl).await;
        self.record(
            "set",
            key,
            started,
            None,
            Some(value.len()),
            ttl,
            result.is_err(),
        );
        result
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let started = Instant::now();
        let result = self.inner.delete(key).await;
        self.record("delete", key, started, None, None, None, result.is_err());
        result
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let started = Instant::now();
        let result = self.inner.exists(key).await;
        match &result {
            Ok(found) => self.record("exists", key, started, Some(*found), None, None, false),
            Err(_) => self.record("exists", key, started, None, None, None, true),
        }
        result
    }

    async fn clear(&self) -> Result<(), Error> {
        let started = Instant::now();
        let result = self.inner.clear().await;
        self.record("clear", "", started, None, None, None, result.is_err());
        result
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, Error> {
        let started = Instant::now();
        let result = self.inner.increment(key, by).await;
        self.record("increment", key, started, None, None, None, result.is_err());
        result
    }

    async fn decrement(&self, key: &str, by: i64) -> Result<i64, Error> {
        let started = Instant::now();
        let result = self.inner.decrement(key, by).await;
        self.record("decrement", key, started, None, None, None, result.is_err());
        result
    }
}
