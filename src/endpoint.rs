use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SelectionStrategy, SelectorConfig, TokenBucketConfig};
use crate::errors::RpcMuxError;
use crate::token_bucket::TokenBucket;

/// EWMA latency tracker for dynamic endpoint scoring
#[derive(Debug)]
struct EwmaLatency {
    latency_ms: RwLock<f64>,
    alpha: f64,
}

impl EwmaLatency {
    fn new(alpha: f64) -> Self {
        Self {
            latency_ms: RwLock::new(0.0),
            alpha: alpha.clamp(0.01, 0.99),
        }
    }

    fn update(&self, latency_ms: f64) {
        let mut ewma = self.latency_ms.write();
        if *ewma == 0.0 {
            *ewma = latency_ms;
        } else {
            *ewma = self.alpha * latency_ms + (1.0 - self.alpha) * *ewma;
        }
    }

    fn get(&self) -> f64 {
        *self.latency_ms.read()
    }
}

/// A configured RPC endpoint with its rate limiter and health tracking.
///
/// Endpoints are created at startup and live for the process lifetime; they
/// are only ever marked unhealthy and healthy again, never destroyed. All
/// health mutation goes through the selector's success/failure reporting.
#[derive(Debug)]
pub struct Endpoint {
    url: String,
    weight: f64,
    bucket: TokenBucket,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    pub(crate) active_connections: AtomicU32,
    score: RwLock<f64>,
    latency: EwmaLatency,
    unhealthy_since: Mutex<Option<Instant>>,
}

impl Endpoint {
    fn new(url: String, weight: f64, bucket: TokenBucket) -> Self {
        Self {
            url,
            weight,
            bucket,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            score: RwLock::new(100.0),
            latency: EwmaLatency::new(0.2),
            unhealthy_since: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let errors = self.total_errors.load(Ordering::Relaxed);
        (total - errors) as f64 / total as f64
    }

    pub fn score(&self) -> f64 {
        *self.score.read()
    }

    pub fn ewma_latency_ms(&self) -> f64 {
        self.latency.get()
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Score formula: base - latency penalty + success-rate term - streak
    /// penalty, weighted, clamped to 0..100
    fn update_score(&self) {
        let mut score = 100.0;

        let latency = self.latency.get();
        score -= (latency / 10.0).min(40.0);

        score += (self.success_rate() - 0.5) * 40.0;

        let streak = f64::from(self.consecutive_failures.load(Ordering::Relaxed));
        score -= (streak * 10.0).min(30.0);

        score *= self.weight;

        *self.score.write() = score.clamp(0.0, 100.0);
    }

    fn record_success(&self, latency_ms: Option<f64>, failover_threshold: u32) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(ms) = latency_ms {
            self.latency.update(ms);
        }

        if !self.is_healthy() && successes >= failover_threshold {
            self.healthy.store(true, Ordering::Relaxed);
            *self.unhealthy_since.lock() = None;
            info!(url = %self.url, successes = successes, "endpoint recovered");
        }

        self.update_score();
    }

    fn record_failure(&self, failover_threshold: u32) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        if failures >= failover_threshold && self.is_healthy() {
            self.healthy.store(false, Ordering::Relaxed);
            *self.unhealthy_since.lock() = Some(Instant::now());
            warn!(url = %self.url, failures = failures, "endpoint marked unhealthy");
        }

        self.update_score();
    }
}

/// Read-only per-endpoint snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub url: String,
    pub healthy: bool,
    pub score: f64,
    pub success_rate: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub consecutive_failures: u32,
    pub ewma_latency_ms: f64,
    pub active_connections: u32,
}

/// Pool-wide health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SelectorStats {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub unhealthy_endpoints: usize,
    pub selections: u64,
    pub endpoints: Vec<EndpointStats>,
}

/// Health-aware endpoint selector.
///
/// Round-robin (or score-weighted round-robin) restricted to the currently
/// healthy subset. An endpoint that accumulates `failover_threshold`
/// consecutive failures is excluded starting with the very next selection;
/// it re-enters after an equal streak of successes or via the timed recovery
/// pass.
#[derive(Debug)]
pub struct EndpointSelector {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
    config: SelectorConfig,
    selections: AtomicU64,
}

impl EndpointSelector {
    pub fn new(config: SelectorConfig, bucket_config: &TokenBucketConfig) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .map(|ep| {
                let bucket = match ep.rate_limit {
                    Some(rate) => TokenBucket::with_rate(bucket_config, rate),
                    None => TokenBucket::new(bucket_config),
                };
                Arc::new(Endpoint::new(ep.url.clone(), ep.weight, bucket))
            })
            .collect();

        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
            config,
            selections: AtomicU64::new(0),
        }
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn healthy_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|ep| ep.is_healthy())
            .cloned()
            .collect()
    }

    /// Choose the next endpoint among the healthy subset
    pub fn select_endpoint(&self) -> Result<Arc<Endpoint>, RpcMuxError> {
        let healthy = self.healthy_endpoints();
        if healthy.is_empty() {
            return Err(RpcMuxError::NoHealthyEndpoints {
                total: self.endpoints.len(),
                unhealthy: self.endpoints.len(),
            });
        }

        self.selections.fetch_add(1, Ordering::Relaxed);

        let selected = match self.config.selection_strategy {
            SelectionStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx].clone()
            }
            SelectionStrategy::WeightedRoundRobin => Self::weighted_pick(&healthy),
        };

        debug!(url = %selected.url(), score = selected.score(), "selected endpoint");
        Ok(selected)
    }

    /// Healthy endpoints in rotation order starting at the cursor; used by
    /// the router to walk alternatives for rate-limit rotation and hedging
    pub fn rotation(&self) -> Vec<Arc<Endpoint>> {
        let healthy = self.healthy_endpoints();
        if healthy.is_empty() {
            return healthy;
        }
        self.selections.fetch_add(1, Ordering::Relaxed);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let mut ordered = Vec::with_capacity(healthy.len());
        for i in 0..healthy.len() {
            ordered.push(healthy[(start + i) % healthy.len()].clone());
        }
        if self.config.selection_strategy == SelectionStrategy::WeightedRoundRobin {
            ordered.sort_by(|a, b| {
                b.score()
                    .partial_cmp(&a.score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        ordered
    }

    fn weighted_pick(healthy: &[Arc<Endpoint>]) -> Arc<Endpoint> {
        let total: f64 = healthy.iter().map(|ep| ep.score().max(1.0)).sum();
        let mut roll = rand::random::<f64>() * total;
        for ep in healthy {
            roll -= ep.score().max(1.0);
            if roll <= 0.0 {
                return ep.clone();
            }
        }
        healthy[healthy.len() - 1].clone()
    }

    pub fn mark_endpoint_success(&self, endpoint: &Arc<Endpoint>, latency_ms: Option<f64>) {
        endpoint.record_success(latency_ms, self.config.failover_threshold);
    }

    pub fn mark_endpoint_failed(&self, endpoint: &Arc<Endpoint>) {
        endpoint.record_failure(self.config.failover_threshold);
    }

    /// Spawn the timed recovery pass: an endpoint that has been unhealthy for
    /// at least `recovery_check_interval` is re-admitted on probation so it
    /// can earn its way back in (or fail straight back out).
    pub fn start_recovery_task(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.recovery_check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_recovery_pass(interval);
            }
        })
    }

    fn run_recovery_pass(&self, min_downtime: Duration) {
        for endpoint in &self.endpoints {
            if endpoint.is_healthy() {
                continue;
            }
            let eligible = {
                let since = endpoint.unhealthy_since.lock();
                since.map(|t| t.elapsed() >= min_downtime).unwrap_or(true)
            };
            if eligible {
                endpoint.healthy.store(true, Ordering::Relaxed);
                endpoint.consecutive_failures.store(0, Ordering::Relaxed);
                *endpoint.unhealthy_since.lock() = None;
                info!(url = %endpoint.url(), "endpoint re-admitted on probation");
            }
        }
    }

    /// Spawn the periodic health snapshot log
    pub fn start_health_log(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stats = self.stats();
                debug!(
                    total = stats.total_endpoints,
                    healthy = stats.healthy_endpoints,
                    unhealthy = stats.unhealthy_endpoints,
                    selections = stats.selections,
                    "endpoint pool health"
                );
            }
        })
    }

    pub fn stats(&self) -> SelectorStats {
        let endpoints: Vec<EndpointStats> = self
            .endpoints
            .iter()
            .map(|ep| EndpointStats {
                url: ep.url().to_string(),
                healthy: ep.is_healthy(),
                score: ep.score(),
                success_rate: ep.success_rate(),
                total_requests: ep.total_requests.load(Ordering::Relaxed),
                total_errors: ep.total_errors.load(Ordering::Relaxed),
                consecutive_failures: ep.consecutive_failures.load(Ordering::Relaxed),
                ewma_latency_ms: ep.ewma_latency_ms(),
                active_connections: ep.active_connections(),
            })
            .collect();

        let healthy = endpoints.iter().filter(|ep| ep.healthy).count();
        SelectorStats {
            total_endpoints: self.endpoints.len(),
            healthy_endpoints: healthy,
            unhealthy_endpoints: self.endpoints.len() - healthy,
            selections: self.selections.load(Ordering::Relaxed),
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use std::collections::HashMap;

    fn selector(n: usize, failover_threshold: u32) -> EndpointSelector {
        let endpoints = (0..n)
            .map(|i| EndpointConfig {
                url: format!("https://node-{}.example", i),
                weight: 1.0,
                rate_limit: None,
            })
            .collect();
        EndpointSelector::new(
            SelectorConfig {
                endpoints,
                selection_strategy: SelectionStrategy::RoundRobin,
                failover_threshold,
                health_check_interval_ms: 60_000,
                recovery_check_interval_ms: 60_000,
            },
            &TokenBucketConfig::default(),
        )
    }

    #[test]
    fn test_round_robin_uniform_distribution() {
        let s = selector(4, 3);
        let mut counts: HashMap<String, u32> = HashMap::new();

        let total = 4000;
        for _ in 0..total {
            let ep = s.select_endpoint().unwrap();
            *counts.entry(ep.url().to_string()).or_default() += 1;
        }

        let expected = total / 4;
        for (url, count) in &counts {
            let deviation = (*count as f64 - expected as f64).abs() / expected as f64;
            assert!(deviation < 0.05, "{} got {} of {}", url, count, total);
        }
    }

    #[test]
    fn test_failover_takes_effect_on_next_selection() {
        let s = selector(3, 3);
        let victim = s.endpoints()[1].clone();

        for _ in 0..3 {
            s.mark_endpoint_failed(&victim);
        }
        assert!(!victim.is_healthy());

        for _ in 0..100 {
            let ep = s.select_endpoint().unwrap();
            assert_ne!(ep.url(), victim.url());
        }
    }

    #[test]
    fn test_below_threshold_failures_keep_endpoint_in_pool() {
        let s = selector(2, 3);
        let ep = s.endpoints()[0].clone();
        s.mark_endpoint_failed(&ep);
        s.mark_endpoint_failed(&ep);
        assert!(ep.is_healthy());
    }

    #[test]
    fn test_recovery_after_success_streak() {
        let s = selector(2, 2);
        let ep = s.endpoints()[0].clone();

        s.mark_endpoint_failed(&ep);
        s.mark_endpoint_failed(&ep);
        assert!(!ep.is_healthy());

        // Out-of-band successes (e.g. a hedged win) earn the endpoint back in
        s.mark_endpoint_success(&ep, Some(20.0));
        assert!(!ep.is_healthy());
        s.mark_endpoint_success(&ep, Some(20.0));
        assert!(ep.is_healthy());
    }

    #[test]
    fn test_all_unhealthy_returns_error() {
        let s = selector(2, 1);
        for ep in s.endpoints().to_vec() {
            s.mark_endpoint_failed(&ep);
        }

        let err = s.select_endpoint().unwrap_err();
        assert!(matches!(
            err,
            RpcMuxError::NoHealthyEndpoints {
                total: 2,
                unhealthy: 2
            }
        ));
    }

    #[test]
    fn test_recovery_pass_readmits_on_probation() {
        let s = selector(2, 1);
        let ep = s.endpoints()[0].clone();
        s.mark_endpoint_failed(&ep);
        assert!(!ep.is_healthy());

        s.run_recovery_pass(Duration::from_millis(0));
        assert!(ep.is_healthy());
        assert_eq!(ep.consecutive_failures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_rotation_starts_at_cursor_and_covers_all() {
        let s = selector(3, 3);
        let ordered = s.rotation();
        assert_eq!(ordered.len(), 3);

        let urls: std::collections::HashSet<_> =
            ordered.iter().map(|ep| ep.url().to_string()).collect();
        assert_eq!(urls.len(), 3);
    }

    #[test]
    fn test_score_reflects_latency_and_failures() {
        let s = selector(1, 5);
        let ep = s.endpoints()[0].clone();

        s.mark_endpoint_success(&ep, Some(10.0));
        let fast_score = ep.score();

        s.mark_endpoint_failed(&ep);
        s.mark_endpoint_failed(&ep);
        let failing_score = ep.score();

        assert!(failing_score < fast_score);
        assert!((0.0..=100.0).contains(&failing_score));
    }

    #[test]
    fn test_stats_snapshot() {
        let s = selector(3, 1);
        s.mark_endpoint_failed(&s.endpoints()[2].clone());

        let stats = s.stats();
        assert_eq!(stats.total_endpoints, 3);
        assert_eq!(stats.healthy_endpoints, 2);
        assert_eq!(stats.unhealthy_endpoints, 1);
        assert_eq!(stats.endpoints.len(), 3);
    }
}
