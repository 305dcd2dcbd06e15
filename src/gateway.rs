//! The façade callers use: one logical call through cache, circuit breaker,
//! retry and transport, with metrics recorded on the way out.

use bytes::Bytes;
use cache::{Arguments, CacheKey, CachePolicy, CacheStats, CacheStore, NoopCache, TtlCache};
use resilience::{
    CircuitBreakerRegistry, CircuitState, RetryPolicy, RetryResult, execute_with_retry,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use telemetry::{MetricsCollector, MetricsSnapshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::batch::{self, BatchItem, BatchOptions, BatchReport};
use crate::config::{ConfigError, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::stream::PageStream;
use crate::transport::Transport;

/// Per-call behaviour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub cache_policy: CachePolicy,
    /// Overrides the gateway's default retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Overrides the gateway's default call deadline.
    pub deadline: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and populate the cache with the default TTL.
    pub fn cached() -> Self {
        Self::default().with_cache_policy(CachePolicy::cached())
    }

    pub fn cached_for(ttl: Duration) -> Self {
        Self::default().with_cache_policy(CachePolicy::cached_for(ttl))
    }

    /// Skip the cached value but store the fresh one.
    pub fn refresh() -> Self {
        Self::default().with_cache_policy(CachePolicy::refresh())
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Outcome of one logical call, with how many remote attempts it took.
#[derive(Debug, Clone)]
pub(crate) struct CallReport<T = Value> {
    pub(crate) result: GatewayResult<T>,
    pub(crate) attempts: u32,
}

impl<T> CallReport<T> {
    fn failed(error: GatewayError) -> Self {
        Self {
            attempts: error.attempts(),
            result: Err(error),
        }
    }
}

/// Times a call and records its outcome exactly once.
struct CallSpan<'a> {
    metrics: &'a MetricsCollector,
    operation: &'a str,
    start: Instant,
}

impl<'a> CallSpan<'a> {
    fn start(metrics: &'a MetricsCollector, operation: &'a str) -> Self {
        Self {
            metrics,
            operation,
            start: Instant::now(),
        }
    }

    fn finish<T>(self, report: CallReport<T>) -> CallReport<T> {
        let latency = self.start.elapsed();
        match &report.result {
            Ok(_) => self
                .metrics
                .record_success(self.operation, latency, report.attempts),
            Err(error) => {
                self.metrics
                    .record_failure(self.operation, error.class(), latency, report.attempts)
            }
        }
        report
    }
}

struct GatewayInner {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheStore>,
    breakers: CircuitBreakerRegistry,
    metrics: Arc<MetricsCollector>,
    config: GatewayConfig,
    sweeper: Option<JoinHandle<()>>,
}

impl Drop for GatewayInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Resilient, cached access to a remote API.
///
/// Cheap to clone; clones share the cache, breakers and metrics.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("cache", &self.inner.cache)
            .field("breakers", &self.inner.breakers.states())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    transport: Arc<dyn Transport>,
    config: GatewayConfig,
    cache: Option<Arc<dyn CacheStore>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl GatewayBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a caller-provided cache instead of a [`TtlCache`] built from the config.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Disable caching entirely.
    pub fn no_cache(self) -> Self {
        self.cache(Arc::new(NoopCache))
    }

    /// Share a metrics collector with other components.
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and assemble the gateway.
    ///
    /// A configured sweep interval starts a background task, which requires a
    /// tokio runtime; without one the gateway relies on lazy expiry.
    pub fn build(self) -> Result<Gateway, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let mut sweeper = None;
        let cache = match self.cache {
            Some(cache) => cache,
            None => {
                let ttl_cache = Arc::new(TtlCache::new(
                    config.cache.capacity,
                    config.cache.shards,
                    config.cache.default_ttl,
                ));
                if let Some(every) = config.cache.sweep_interval {
                    if tokio::runtime::Handle::try_current().is_ok() {
                        sweeper = Some(ttl_cache.spawn_sweeper(every));
                    } else {
                        tracing::warn!("no tokio runtime, cache sweep disabled");
                    }
                }
                ttl_cache as Arc<dyn CacheStore>
            }
        };

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::new(config.metrics.max_operations)));

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                transport: self.transport,
                cache,
                breakers: CircuitBreakerRegistry::new(config.breaker),
                metrics,
                config,
                sweeper,
            }),
        })
    }
}

fn encode(operation: &str, value: &Value) -> Option<Bytes> {
    match serde_json::to_vec(value) {
        Ok(encoded) => Some(Bytes::from(encoded)),
        Err(error) => {
            tracing::warn!(operation, error = %error, "response not cached, encoding failed");
            None
        }
    }
}

fn validate_operation(operation: &str) -> GatewayResult<()> {
    if operation.is_empty() {
        return Err(GatewayError::InvalidRequest("empty operation name".into()));
    }
    if operation.contains(cache::OPERATION_SEPARATOR) {
        return Err(GatewayError::InvalidRequest(format!(
            "operation name `{operation}` contains `{}`",
            cache::OPERATION_SEPARATOR
        )));
    }
    Ok(())
}

impl Gateway {
    pub fn builder<T: Transport + 'static>(transport: T) -> GatewayBuilder {
        GatewayBuilder {
            transport: Arc::new(transport),
            config: GatewayConfig::default(),
            cache: None,
            metrics: None,
        }
    }

    /// Gateway with the given config and a [`TtlCache`].
    pub fn new<T: Transport + 'static>(
        transport: T,
        config: GatewayConfig,
    ) -> Result<Self, ConfigError> {
        Self::builder(transport).config(config).build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    /// Perform one logical operation.
    pub async fn invoke(
        &self,
        operation: &str,
        arguments: &Arguments,
        options: &CallOptions,
    ) -> GatewayResult<Value> {
        self.call(operation, arguments, options).await.result
    }

    /// Perform a state-changing operation, then drop cached reads it may
    /// have made stale.
    ///
    /// The write is never cached. Prefixes are invalidated whenever the remote
    /// was reached, even if the call then failed, since the write may have
    /// been applied.
    pub async fn invoke_write(
        &self,
        operation: &str,
        arguments: &Arguments,
        invalidate_prefixes: &[&str],
    ) -> GatewayResult<Value> {
        let options = CallOptions::new();
        let report = self.call(operation, arguments, &options).await;
        if report.result.is_ok() || report.attempts > 0 {
            let removed: usize = invalidate_prefixes
                .iter()
                .map(|prefix| self.invalidate_by_prefix(prefix))
                .sum();
            tracing::debug!(operation, removed, "invalidated after write");
        }
        report.result
    }

    pub(crate) async fn call(
        &self,
        operation: &str,
        arguments: &Arguments,
        options: &CallOptions,
    ) -> CallReport {
        self.call_with(operation, arguments, options, |value, _| Ok(value))
            .await
    }

    /// One logical call whose response must pass `accept` before it counts.
    ///
    /// `accept` sees the response and the attempts it took. A refused response
    /// is never cached, a refused cache entry is evicted, and either way the
    /// call is recorded as failed.
    pub(crate) async fn call_with<T>(
        &self,
        operation: &str,
        arguments: &Arguments,
        options: &CallOptions,
        accept: impl FnOnce(Value, u32) -> GatewayResult<T>,
    ) -> CallReport<T> {
        let span = CallSpan::start(&self.inner.metrics, operation);
        if let Err(error) = validate_operation(operation) {
            return span.finish(CallReport::failed(error));
        }

        let policy = options.cache_policy;
        let key = policy
            .writes_cache()
            .then(|| CacheKey::new(operation, arguments));

        if let (true, Some(key)) = (policy.reads_cache(), key.as_ref()) {
            if let Some(value) = self.cached_value(operation, key) {
                self.inner.metrics.record_cache_hit(operation);
                tracing::debug!(operation, "cache hit");
                let result = accept(value, 0);
                if let Err(error) = &result {
                    self.inner.cache.invalidate(key);
                    tracing::warn!(operation, key = %key, error = %error, "evicted unusable cache entry");
                }
                return span.finish(CallReport {
                    result,
                    attempts: 0,
                });
            }
            self.inner.metrics.record_cache_miss(operation);
            tracing::debug!(operation, "cache miss");
        }

        let CallReport { result, attempts } =
            self.call_remote(operation, arguments, options).await;
        let result = result.and_then(|value| {
            let encoded = key.as_ref().and_then(|_| encode(operation, &value));
            let accepted = accept(value, attempts)?;
            if let (Some(key), Some(encoded)) = (key, encoded) {
                let ttl = policy.ttl_or(self.inner.config.cache.default_ttl);
                self.inner.cache.put(key, encoded, ttl);
            }
            Ok(accepted)
        });
        span.finish(CallReport { result, attempts })
    }

    /// Decode a cached response; undecodable entries are evicted and count as a miss.
    fn cached_value(&self, operation: &str, key: &CacheKey) -> Option<Value> {
        let bytes = self.inner.cache.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(error) => {
                self.inner.cache.invalidate(key);
                self.inner.metrics.record_cache_corruption(operation);
                tracing::warn!(operation, key = %key, error = %error, "evicted corrupt cache entry");
                None
            }
        }
    }

    /// Breaker, then retries bounded by the call deadline, then the transport.
    async fn call_remote(
        &self,
        operation: &str,
        arguments: &Arguments,
        options: &CallOptions,
    ) -> CallReport {
        let breaker = self.inner.breakers.get_or_create(operation);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                tracing::debug!(
                    operation,
                    state = rejection.state.as_str(),
                    retry_after_ms = rejection.retry_after.as_millis() as u64,
                    "circuit open, call rejected"
                );
                return CallReport::failed(GatewayError::CircuitOpen {
                    operation: operation.to_owned(),
                    retry_after: rejection.retry_after,
                });
            }
        };

        let policy = options
            .retry_policy
            .as_ref()
            .unwrap_or(&self.inner.config.retry);
        let deadline = options.deadline.or(self.inner.config.call_deadline);

        let attempts_made = AtomicU32::new(0);
        let transport = &self.inner.transport;
        let attempts_ref = &attempts_made;
        let retried = execute_with_retry(policy, move |attempt| {
            attempts_ref.store(attempt, Ordering::Relaxed);
            transport.call(operation, arguments)
        });

        let outcome = match deadline {
            Some(limit) => tokio::time::timeout(limit, retried).await.map_err(|_| {
                GatewayError::DeadlineExceeded {
                    deadline: limit,
                    attempts: attempts_made.load(Ordering::Relaxed),
                }
            }),
            None => Ok(retried.await),
        };

        let report = match outcome {
            Ok(RetryResult {
                result: Ok(value),
                attempts,
                ..
            }) => CallReport {
                result: Ok(value),
                attempts,
            },
            Ok(RetryResult {
                result: Err(error),
                attempts,
                ..
            }) => CallReport::failed(GatewayError::from_remote(error, attempts)),
            Err(error) => CallReport::failed(error),
        };

        permit.record(&report.result);
        report
    }

    /// Drop the cached response for one request.
    pub fn invalidate(&self, operation: &str, arguments: &Arguments) -> bool {
        self.inner
            .cache
            .invalidate(&CacheKey::new(operation, arguments))
    }

    /// Drop every cached response whose key starts with `prefix`.
    ///
    /// An operation name matches all of that operation's argument sets.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        self.inner.cache.invalidate_prefix(prefix)
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Copy of the per-operation metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Circuit state of every operation called so far.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.inner.breakers.states()
    }

    /// Circuit state of one operation. Operations never called are closed.
    pub fn breaker_state(&self, operation: &str) -> CircuitState {
        self.inner
            .breakers
            .get(operation)
            .map(|breaker| breaker.current_state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Close every circuit.
    pub fn reset_breakers(&self) {
        self.inner.breakers.reset_all();
        tracing::info!("all circuits reset");
    }

    /// Lazily page through a collection.
    ///
    /// A `page_size` of zero uses the configured default.
    pub fn open_stream(
        &self,
        operation: impl Into<String>,
        base_arguments: Arguments,
        page_size: usize,
    ) -> PageStream {
        let stream_config = &self.inner.config.stream;
        let page_size = if page_size == 0 {
            stream_config.page_size
        } else {
            page_size
        };
        let options = if stream_config.cache_pages {
            CallOptions::cached()
        } else {
            CallOptions::new()
        };
        PageStream::new(
            self.clone(),
            operation.into(),
            base_arguments,
            page_size,
            stream_config.layout.clone(),
            options,
        )
    }

    /// Batch options seeded from the configured defaults.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions::from_config(&self.inner.config.batch)
    }

    /// Run many calls concurrently; one result per item.
    pub async fn submit_batch(&self, items: Vec<BatchItem>, options: BatchOptions) -> BatchReport {
        batch::run(self, items, options).await
    }
}
