use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::batch::{BatchDispatcher, BatchManager, BatchStats};
use crate::cache::{cache_key, CacheStats, RequestCache};
use crate::circuit_breaker::{BreakerMetrics, CircuitBreaker};
use crate::config::RpcMuxConfig;
use crate::endpoint::{Endpoint, EndpointSelector, SelectorStats};
use crate::errors::{RetryPolicy, RpcMuxError};
use crate::hedge::{HedgeStats, HedgedManager};
use crate::pool::{ConnectionPool, PoolStats};
use crate::RpcExecutor;

/// Per-call routing knobs. The defaults dispatch with batching allowed and
/// caching only for methods on the cache's allow-list.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Serve from (and populate) the response cache even if the method is
    /// not on the allow-list
    pub use_cache: bool,

    /// Override the cache's default TTL for this call
    pub cache_ttl: Option<Duration>,

    /// Bypass the cache even for an allow-listed method
    pub skip_cache: bool,

    /// Force a direct dispatch even for a batchable method
    pub skip_batching: bool,

    /// Override the per-attempt timeout for this call
    pub timeout: Option<Duration>,

    /// Override the failover budget for this call. Ignored for calls that
    /// ride a shared batch.
    pub failover_budget: Option<Duration>,
}

impl CallOptions {
    pub fn cached() -> Self {
        Self {
            use_cache: true,
            ..Self::default()
        }
    }

    pub fn cached_for(ttl: Duration) -> Self {
        Self {
            use_cache: true,
            cache_ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn direct() -> Self {
        Self {
            skip_batching: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_failover_budget(mut self, budget: Duration) -> Self {
        self.failover_budget = Some(budget);
        self
    }
}

/// Aggregated snapshot across every component
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub calls_total: u64,
    pub calls_failed: u64,
    pub cache: CacheStats,
    pub breaker: BreakerMetrics,
    pub batch: BatchStats,
    pub hedge: HedgeStats,
    pub selector: SelectorStats,
    pub pool: PoolStats,
}

/// Wire-level dispatch: rotation, per-endpoint admission, hedged racing,
/// and health reporting. Shared between the direct path and the batcher.
pub(crate) struct Dispatcher {
    selector: Arc<EndpointSelector>,
    pool: Arc<ConnectionPool>,
    hedger: Arc<HedgedManager>,
    breaker: Arc<CircuitBreaker>,
    executor: Arc<dyn RpcExecutor>,
    call_timeout: Duration,
    failover_budget: Duration,
    retry_policy: RetryPolicy,
}

impl Dispatcher {
    fn rotation(&self) -> Result<Vec<Arc<Endpoint>>, RpcMuxError> {
        let rotation = self.selector.rotation();
        if rotation.is_empty() {
            let total = self.selector.endpoints().len();
            return Err(RpcMuxError::NoHealthyEndpoints {
                total,
                unhealthy: total,
            });
        }
        Ok(rotation)
    }

    pub(crate) async fn dispatch(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        budget: Option<Duration>,
    ) -> Result<Value, RpcMuxError> {
        let executor = self.executor.clone();
        self.run_with_failover(
            method,
            params,
            timeout.unwrap_or(self.call_timeout),
            budget.unwrap_or(self.failover_budget),
            move |ep, m, p| {
                let executor = executor.clone();
                Box::pin(async move { executor.execute(&ep, &m, p).await })
            },
        )
        .await
    }

    pub(crate) async fn dispatch_batch(
        &self,
        method: &str,
        batch: Vec<Value>,
    ) -> Result<Vec<Value>, RpcMuxError> {
        let executor = self.executor.clone();
        self.run_with_failover(
            method,
            Value::Array(batch),
            self.call_timeout,
            self.failover_budget,
            move |ep, m, p| {
                let executor = executor.clone();
                Box::pin(async move {
                    let batch = match p {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    executor.execute_batch(&ep, &m, batch).await
                })
            },
        )
        .await
    }

    /// Hedged race plus bounded backoff retries, all under one failover
    /// budget. Each retry starts from a fresh rotation so endpoints that
    /// went unhealthy mid-call are excluded.
    async fn run_with_failover<T, E>(
        &self,
        method: &str,
        params: Value,
        call_timeout: Duration,
        budget: Duration,
        execute: E,
    ) -> Result<T, RpcMuxError>
    where
        T: Send + 'static,
        E: Fn(Arc<Endpoint>, String, Value) -> BoxFuture<'static, Result<T, RpcMuxError>>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        let deadline = tokio::time::Instant::now() + budget;
        let mut retries = 0u32;

        loop {
            let rotation = self.rotation()?;
            let tried = rotation.len();
            let attempt = self.attempt_fn(
                execute.clone(),
                method.to_string(),
                params.clone(),
                call_timeout,
            );

            match self.race(rotation, tried, attempt, deadline, budget).await {
                Err(err) if err.is_retryable() => {
                    let delay = match self.retry_policy.calculate_delay(retries) {
                        Some(delay) if tokio::time::Instant::now() + delay < deadline => delay,
                        _ => return Err(err),
                    };
                    retries += 1;
                    debug!(
                        method = method,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                settled => return settled,
            }
        }
    }

    /// Run one hedged race against the budget deadline and settle endpoint
    /// health from the outcome
    async fn race<T, F>(
        &self,
        rotation: Vec<Arc<Endpoint>>,
        tried: usize,
        attempt: F,
        deadline: tokio::time::Instant,
        budget: Duration,
    ) -> Result<T, RpcMuxError>
    where
        T: Send + 'static,
        F: Fn(Arc<Endpoint>) -> BoxFuture<'static, Result<T, RpcMuxError>>,
    {
        let raced = self.hedger.execute(rotation, attempt);
        let outcome = match tokio::time::timeout_at(deadline, raced).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    budget_ms = budget.as_millis() as u64,
                    "failover budget exhausted"
                );
                return Err(RpcMuxError::Timeout {
                    endpoint: "failover-budget".to_string(),
                    timeout_ms: budget.as_millis() as u64,
                });
            }
        };

        match outcome {
            Ok(won) => {
                self.selector
                    .mark_endpoint_success(&won.endpoint, Some(won.latency_ms));
                Ok(won.value)
            }
            // Every endpoint in the rotation rejected the call locally
            Err(RpcMuxError::RateLimited { .. }) => Err(RpcMuxError::RateLimited {
                endpoints_tried: tried,
            }),
            Err(err) => Err(err),
        }
    }

    /// Wrap a raw execution into a per-endpoint attempt: token admission,
    /// pool slot, timeout, and health/breaker reporting. Recording happens
    /// here, per wire attempt, so a fault still reaches the breaker even
    /// when a later retry surfaces a different error.
    fn attempt_fn<T, E>(
        &self,
        execute: E,
        method: String,
        params: Value,
        timeout: Duration,
    ) -> impl Fn(Arc<Endpoint>) -> BoxFuture<'static, Result<T, RpcMuxError>>
    where
        T: Send + 'static,
        E: Fn(Arc<Endpoint>, String, Value) -> BoxFuture<'static, Result<T, RpcMuxError>>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        let pool = self.pool.clone();
        let selector = self.selector.clone();
        let breaker = self.breaker.clone();

        move |ep: Arc<Endpoint>| {
            let pool = pool.clone();
            let selector = selector.clone();
            let breaker = breaker.clone();
            let execute = execute.clone();
            let method = method.clone();
            let params = params.clone();

            Box::pin(async move {
                if !ep.bucket().consume(1) {
                    return Err(RpcMuxError::RateLimited { endpoints_tried: 1 });
                }
                let _slot = pool.acquire(ep.clone())?;

                let result = match tokio::time::timeout(
                    timeout,
                    execute(ep.clone(), method.clone(), params),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RpcMuxError::Timeout {
                        endpoint: ep.url().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };

                match &result {
                    Ok(_) => breaker.record_success(&method),
                    Err(err) if err.is_endpoint_fault() => {
                        selector.mark_endpoint_failed(&ep);
                        breaker.record_failure(&method);
                    }
                    Err(_) => {}
                }
                result
            })
        }
    }
}

/// The front door: routes each logical call through the circuit breaker,
/// the coalescing cache, the micro-batcher, and finally hedged dispatch.
pub struct RpcManager {
    dispatcher: Arc<Dispatcher>,
    selector: Arc<EndpointSelector>,
    pool: Arc<ConnectionPool>,
    hedger: Arc<HedgedManager>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<RequestCache>,
    batcher: Arc<BatchManager>,
    calls_total: AtomicU64,
    calls_failed: AtomicU64,
}

impl RpcManager {
    pub fn new(config: &RpcMuxConfig, executor: Arc<dyn RpcExecutor>) -> Arc<Self> {
        let selector = Arc::new(EndpointSelector::new(
            config.selector.clone(),
            &config.token_bucket,
        ));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let hedger = Arc::new(HedgedManager::new(config.hedge.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let cache = Arc::new(RequestCache::new(config.cache.clone()));

        let dispatcher = Arc::new(Dispatcher {
            selector: selector.clone(),
            pool: pool.clone(),
            hedger: hedger.clone(),
            breaker: breaker.clone(),
            executor,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            failover_budget: Duration::from_millis(config.failover_budget_ms),
            retry_policy: RetryPolicy::default(),
        });

        let batch_dispatch: BatchDispatcher = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |method, params| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move { dispatcher.dispatch_batch(&method, params).await })
            })
        };
        let batcher = Arc::new(BatchManager::new(config.batch.clone(), batch_dispatch));

        Arc::new(Self {
            dispatcher,
            selector,
            pool,
            hedger,
            breaker,
            cache,
            batcher,
            calls_total: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
        })
    }

    /// Issue a call with default options
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcMuxError> {
        self.call_with(method, params, CallOptions::default()).await
    }

    /// Issue a call with explicit routing options
    pub async fn call_with(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcMuxError> {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        // Held across the whole call so a half-open probe slot is returned
        // on every outcome, including cancellation
        let _permit = self.breaker.check(method)?;

        let use_cache =
            !options.skip_cache && (options.use_cache || self.cache.is_cacheable(method));
        let result = if use_cache {
            let key = Self::key_for(method, &params);
            self.cache
                .get_or_fetch(&key, options.cache_ttl, || {
                    self.route(method, params.clone(), &options)
                })
                .await
        } else {
            self.route(method, params, &options).await
        };

        if result.is_err() {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn route(
        &self,
        method: &str,
        params: Value,
        options: &CallOptions,
    ) -> Result<Value, RpcMuxError> {
        if !options.skip_batching && self.batcher.is_batchable(method) {
            debug!(method = method, "routing through batcher");
            self.batcher.submit(method, params).await
        } else {
            self.dispatcher
                .dispatch(method, params, options.timeout, options.failover_budget)
                .await
        }
    }

    fn key_for(method: &str, params: &Value) -> String {
        match params {
            Value::Array(items) => cache_key(method, items),
            Value::Null => cache_key(method, &[]),
            other => cache_key(method, std::slice::from_ref(other)),
        }
    }

    pub fn selector(&self) -> &Arc<EndpointSelector> {
        &self.selector
    }

    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn batcher(&self) -> &Arc<BatchManager> {
        &self.batcher
    }

    pub fn hedger(&self) -> &Arc<HedgedManager> {
        &self.hedger
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            calls_total: self.calls_total.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            breaker: self.breaker.metrics(),
            batch: self.batcher.stats(),
            hedge: self.hedger.stats(),
            selector: self.selector.stats(),
            pool: self.pool.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, CircuitBreakerConfig, TokenBucketConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct MockExecutor {
        calls: AtomicUsize,
        batch_calls: AtomicUsize,
        fail_url: Option<String>,
    }

    impl MockExecutor {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                batch_calls: AtomicUsize::new(0),
                fail_url: None,
            })
        }

        fn failing_on(url: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                batch_calls: AtomicUsize::new(0),
                fail_url: Some(url.to_string()),
            })
        }
    }

    #[async_trait]
    impl RpcExecutor for MockExecutor {
        async fn execute(
            &self,
            endpoint: &Endpoint,
            method: &str,
            params: Value,
        ) -> Result<Value, RpcMuxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_url.as_deref() == Some(endpoint.url()) {
                return Err(RpcMuxError::EndpointUnreachable {
                    endpoint: endpoint.url().to_string(),
                    message: "connection refused".into(),
                });
            }
            Ok(json!({ "method": method, "params": params, "endpoint": endpoint.url() }))
        }

        async fn execute_batch(
            &self,
            endpoint: &Endpoint,
            _method: &str,
            batch: Vec<Value>,
        ) -> Result<Vec<Value>, RpcMuxError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_url.as_deref() == Some(endpoint.url()) {
                return Err(RpcMuxError::EndpointUnreachable {
                    endpoint: endpoint.url().to_string(),
                    message: "connection refused".into(),
                });
            }
            Ok(batch.into_iter().map(|p| json!({ "echo": p })).collect())
        }
    }

    fn config(urls: &[&str]) -> RpcMuxConfig {
        let mut cfg = RpcMuxConfig::from_urls(
            &urls.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        );
        cfg.batch = BatchConfig {
            batch_window_ms: 10,
            max_batch_size: 50,
            enable_batching: true,
            batchable_methods: vec!["getBalance".into()],
        };
        cfg
    }

    #[tokio::test]
    async fn test_direct_call_reaches_executor() {
        let executor = MockExecutor::ok();
        let manager = RpcManager::new(&config(&["https://a.example"]), executor.clone());

        let result = manager.call("getSlot", json!([])).await.unwrap();
        assert_eq!(result["method"], "getSlot");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_call_hits_executor_once() {
        let executor = MockExecutor::ok();
        let manager = RpcManager::new(&config(&["https://a.example"]), executor.clone());

        let opts = CallOptions::cached_for(Duration::from_secs(5));
        let first = manager
            .call_with("getSlot", json!([1]), opts.clone())
            .await
            .unwrap();
        let second = manager
            .call_with("getSlot", json!([1]), opts)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().cache.hits, 1);
    }

    #[tokio::test]
    async fn test_batchable_method_routes_through_batcher() {
        let executor = MockExecutor::ok();
        let manager = RpcManager::new(&config(&["https://a.example"]), executor.clone());

        let mut handles = Vec::new();
        for i in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.call("getBalance", json!([i])).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(executor.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skip_batching_forces_direct_dispatch() {
        let executor = MockExecutor::ok();
        let manager = RpcManager::new(&config(&["https://a.example"]), executor.clone());

        manager
            .call_with("getBalance", json!([1]), CallOptions::direct())
            .await
            .unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.batch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_endpoint_falls_over_to_healthy_one() {
        let executor = MockExecutor::failing_on("https://bad.example");
        let mut cfg = config(&["https://bad.example", "https://good.example"]);
        cfg.selector.selection_strategy = crate::config::SelectionStrategy::RoundRobin;
        let manager = RpcManager::new(&cfg, executor);

        // Whichever endpoint the rotation starts with, the call must settle
        // on the healthy one
        for _ in 0..4 {
            let result = manager.call("getSlot", json!([])).await.unwrap();
            assert_eq!(result["endpoint"], "https://good.example");
        }
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let executor = MockExecutor::failing_on("https://only.example");
        let mut cfg = config(&["https://only.example"]);
        cfg.circuit_breaker.failure_threshold = 3;
        // Keep the endpoint in rotation so the breaker sees every failure
        cfg.selector.failover_threshold = 100;
        let manager = RpcManager::new(&cfg, executor);

        for _ in 0..3 {
            assert!(manager.call("getSlot", json!([])).await.is_err());
        }

        let err = manager.call("getSlot", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcMuxError::CircuitOpen { .. }));
    }

    struct DelayExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl RpcExecutor for DelayExecutor {
        async fn execute(
            &self,
            endpoint: &Endpoint,
            method: &str,
            _params: Value,
        ) -> Result<Value, RpcMuxError> {
            tokio::time::sleep(self.delay).await;
            Ok(json!({ "method": method, "endpoint": endpoint.url() }))
        }

        async fn execute_batch(
            &self,
            _endpoint: &Endpoint,
            _method: &str,
            batch: Vec<Value>,
        ) -> Result<Vec<Value>, RpcMuxError> {
            Ok(batch)
        }
    }

    #[tokio::test]
    async fn test_attempt_faults_reach_breaker_even_when_masked() {
        let executor = MockExecutor::failing_on("https://only.example");
        let mut cfg = config(&["https://only.example"]);
        cfg.circuit_breaker.failure_threshold = 1;
        cfg.selector.failover_threshold = 100;
        // One token total: the first attempt spends it and fails on the
        // wire, the retry then dies on an empty bucket
        cfg.token_bucket = TokenBucketConfig {
            rate_limit: 1,
            max_burst: 1,
            window_ms: 60_000,
        };
        let manager = RpcManager::new(&cfg, executor);

        let err = manager.call("getSlot", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcMuxError::RateLimited { .. }));

        // The masked wire fault must still have opened the circuit
        let err = manager.call("getSlot", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcMuxError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_rate_limited_probe_does_not_wedge_half_open() {
        let executor = MockExecutor::failing_on("https://only.example");
        let mut cfg = config(&["https://only.example"]);
        cfg.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            cooldown_period_ms: 50,
            half_open_tests: 1,
        };
        cfg.selector.failover_threshold = 100;
        // Enough tokens for the opening call's retries, none for the probes
        cfg.token_bucket = TokenBucketConfig {
            rate_limit: 3,
            max_burst: 3,
            window_ms: 60_000,
        };
        let manager = RpcManager::new(&cfg, executor);

        assert!(manager.call("getSlot", json!([])).await.is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The half-open probe dies locally on an empty bucket
        let err = manager.call("getSlot", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcMuxError::RateLimited { .. }));

        // Its slot came back, so the next probe is admitted instead of
        // bouncing off CircuitOpen forever
        let err = manager.call("getSlot", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcMuxError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_per_call_failover_budget_override() {
        let executor = Arc::new(DelayExecutor {
            delay: Duration::from_millis(500),
        });
        let manager = RpcManager::new(&config(&["https://a.example"]), executor);

        let opts = CallOptions::direct().with_failover_budget(Duration::from_millis(50));
        let err = manager
            .call_with("getSlot", json!([]), opts)
            .await
            .unwrap_err();
        match err {
            RpcMuxError::Timeout {
                endpoint,
                timeout_ms,
            } => {
                assert_eq!(endpoint, "failover-budget");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected budget timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_per_call_timeout_override() {
        let executor = Arc::new(DelayExecutor {
            delay: Duration::from_millis(300),
        });
        let mut cfg = config(&["https://a.example"]);
        cfg.selector.failover_threshold = 100;
        let manager = RpcManager::new(&cfg, executor);

        let opts = CallOptions::direct().with_timeout(Duration::from_millis(50));
        let err = manager
            .call_with("getSlot", json!([]), opts)
            .await
            .unwrap_err();
        match err {
            RpcMuxError::Timeout {
                endpoint,
                timeout_ms,
            } => {
                assert_eq!(endpoint, "https://a.example");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected per-attempt timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_allow_listed_method_is_cached_by_default() {
        let executor = MockExecutor::ok();
        let mut cfg = config(&["https://a.example"]);
        cfg.cache.cacheable_methods = vec!["getSlot".into()];
        let manager = RpcManager::new(&cfg, executor.clone());

        manager.call("getSlot", json!([])).await.unwrap();
        manager.call("getSlot", json!([])).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().cache.hits, 1);

        // skip_cache opts an allow-listed method back out
        let opts = CallOptions {
            skip_cache: true,
            ..CallOptions::default()
        };
        manager
            .call_with("getSlot", json!([]), opts)
            .await
            .unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_rotation_reports_endpoints_tried() {
        let executor = MockExecutor::ok();
        let mut cfg = config(&["https://a.example", "https://b.example"]);
        cfg.token_bucket.rate_limit = 1;
        cfg.token_bucket.max_burst = 1;
        cfg.token_bucket.window_ms = 60_000;
        let manager = RpcManager::new(&cfg, executor);

        // Drain both buckets
        manager.call("getSlot", json!([])).await.unwrap();
        manager.call("getSlot", json!([])).await.unwrap();

        let err = manager.call("getSlot", json!([])).await.unwrap_err();
        assert!(matches!(
            err,
            RpcMuxError::RateLimited { endpoints_tried: 2 }
        ));
    }

    #[tokio::test]
    async fn test_no_healthy_endpoints_error() {
        let executor = MockExecutor::ok();
        let cfg = config(&["https://a.example"]);
        let manager = RpcManager::new(&cfg, executor);
        let ep = manager.selector().endpoints()[0].clone();
        for _ in 0..cfg.selector.failover_threshold {
            manager.selector().mark_endpoint_failed(&ep);
        }

        let err = manager.call("getSlot", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcMuxError::NoHealthyEndpoints { .. }));
    }

    #[tokio::test]
    async fn test_stats_aggregate_components() {
        let executor = MockExecutor::ok();
        let manager = RpcManager::new(&config(&["https://a.example"]), executor);

        manager.call("getSlot", json!([])).await.unwrap();
        let stats = manager.stats();
        assert_eq!(stats.calls_total, 1);
        assert_eq!(stats.calls_failed, 0);
        assert_eq!(stats.selector.total_endpoints, 1);
        assert_eq!(stats.hedge.hedged_calls, 1);
    }
}
