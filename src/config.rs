use serde::{Deserialize, Serialize};

use crate::errors::RpcMuxError;

/// Configuration for an individual RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// The RPC endpoint URL
    pub url: String,

    /// Weight for load balancing (higher = more requests)
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Per-endpoint rate limit override (tokens per window); falls back to
    /// the global token bucket settings when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

fn default_weight() -> f64 {
    1.0
}

/// Circuit breaker settings, keyed per service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes in half-open before the circuit closes
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time spent open before probing again, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_period_ms: u64,

    /// Maximum concurrent trial calls admitted while half-open
    #[serde(default = "default_half_open_tests")]
    pub half_open_tests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_half_open_tests() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_period_ms: default_cooldown_ms(),
            half_open_tests: default_half_open_tests(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// Recognized: `RPCMUX_CB_FAILURE_THRESHOLD`, `RPCMUX_CB_SUCCESS_THRESHOLD`,
    /// `RPCMUX_CB_COOLDOWN_MS`, `RPCMUX_CB_HALF_OPEN_TESTS`.
    pub fn from_env() -> Self {
        fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(fallback)
        }

        Self {
            failure_threshold: env_parse("RPCMUX_CB_FAILURE_THRESHOLD", default_failure_threshold()),
            success_threshold: env_parse("RPCMUX_CB_SUCCESS_THRESHOLD", default_success_threshold()),
            cooldown_period_ms: env_parse("RPCMUX_CB_COOLDOWN_MS", default_cooldown_ms()),
            half_open_tests: env_parse("RPCMUX_CB_HALF_OPEN_TESTS", default_half_open_tests()),
        }
    }
}

/// Token bucket rate limiter settings, applied per endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Tokens refilled per window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Refill window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Burst capacity cap
    #[serde(default = "default_max_burst")]
    pub max_burst: u32,
}

fn default_rate_limit() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    1000
}

fn default_max_burst() -> u32 {
    100
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            window_ms: default_window_ms(),
            max_burst: default_max_burst(),
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry capacity; LRU eviction beyond this
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Default TTL in milliseconds when a call supplies none
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Background sweep interval in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Merge concurrent identical misses into one fetch
    #[serde(default = "default_true")]
    pub enable_coalescing: bool,

    /// Methods the router caches by default under `default_ttl_ms`; any
    /// method can still opt in or out per call
    #[serde(default)]
    pub cacheable_methods: Vec<String>,
}

fn default_max_entries() -> usize {
    10_000
}

fn default_ttl_ms() -> u64 {
    2_000
}

fn default_cleanup_interval_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            default_ttl_ms: default_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            enable_coalescing: default_true(),
            cacheable_methods: Vec::new(),
        }
    }
}

/// Request batching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// How long a batch stays open, in milliseconds
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Size at which a batch flushes early
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_true")]
    pub enable_batching: bool,

    /// Allow-list of methods that may be combined; method identity is the
    /// grouping key, there is no cross-method batching
    #[serde(default)]
    pub batchable_methods: Vec<String>,
}

fn default_batch_window_ms() -> u64 {
    20
}

fn default_max_batch_size() -> usize {
    50
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            enable_batching: default_true(),
            batchable_methods: Vec::new(),
        }
    }
}

/// Endpoint selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    WeightedRoundRobin,
}

/// Endpoint selector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Configured endpoints; created once at startup, never destroyed
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default = "default_strategy")]
    pub selection_strategy: SelectionStrategy,

    /// Consecutive failures before an endpoint leaves the healthy pool
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    /// Interval for the periodic health snapshot log, in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Interval after which an unhealthy endpoint is re-admitted on probation,
    /// in milliseconds
    #[serde(default = "default_recovery_check_interval_ms")]
    pub recovery_check_interval_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            selection_strategy: default_strategy(),
            failover_threshold: default_failover_threshold(),
            health_check_interval_ms: default_health_check_interval_ms(),
            recovery_check_interval_ms: default_recovery_check_interval_ms(),
        }
    }
}

fn default_strategy() -> SelectionStrategy {
    SelectionStrategy::RoundRobin
}

fn default_failover_threshold() -> u32 {
    3
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_recovery_check_interval_ms() -> u64 {
    30_000
}

/// Hedged dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base delay before issuing a backup attempt, in milliseconds
    #[serde(default = "default_hedging_delay_ms")]
    pub hedging_delay_ms: u64,

    /// Upper clamp for the adaptive delay, in milliseconds
    #[serde(default = "default_max_hedging_delay_ms")]
    pub max_hedging_delay_ms: u64,

    /// Maximum backup attempts per logical call
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Adapt the delay from this latency percentile once enough samples exist
    #[serde(default = "default_latency_quantile")]
    pub latency_quantile: f64,
}

fn default_hedging_delay_ms() -> u64 {
    100
}

fn default_max_hedging_delay_ms() -> u64 {
    2_000
}

fn default_max_backups() -> usize {
    1
}

fn default_latency_quantile() -> f64 {
    0.95
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            hedging_delay_ms: default_hedging_delay_ms(),
            max_hedging_delay_ms: default_max_hedging_delay_ms(),
            max_backups: default_max_backups(),
            latency_quantile: default_latency_quantile(),
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Global concurrent connection cap
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Per-endpoint concurrent connection cap
    #[serde(default = "default_max_per_endpoint")]
    pub max_per_endpoint: u32,
}

fn default_max_connections() -> u32 {
    512
}

fn default_max_per_endpoint() -> u32 {
    64
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_per_endpoint: default_max_per_endpoint(),
        }
    }
}

/// Top-level configuration for the whole stack.
///
/// Scalar fields come first so TOML serialization emits them before tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMuxConfig {
    /// Default per-call timeout in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Default failover budget per call in milliseconds
    #[serde(default = "default_failover_budget_ms")]
    pub failover_budget_ms: u64,

    pub selector: SelectorConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub token_bucket: TokenBucketConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub hedge: HedgeConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_failover_budget_ms() -> u64 {
    10_000
}

impl RpcMuxConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &str) -> Result<Self, RpcMuxError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RpcMuxError::Configuration(format!("failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&contents)
            .map_err(|e| RpcMuxError::Configuration(format!("failed to parse TOML: {}", e)))
    }

    /// Load configuration from a JSON file
    pub fn from_json_file(path: &str) -> Result<Self, RpcMuxError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RpcMuxError::Configuration(format!("failed to read config file {}: {}", path, e))
        })?;

        serde_json::from_str(&contents)
            .map_err(|e| RpcMuxError::Configuration(format!("failed to parse JSON: {}", e)))
    }

    /// Load configuration from environment variables.
    /// Expected format: `RPCMUX_ENDPOINTS=url1,url2,url3`
    pub fn from_env() -> Result<Self, RpcMuxError> {
        let endpoints_str = std::env::var("RPCMUX_ENDPOINTS").map_err(|_| {
            RpcMuxError::Configuration("missing environment variable RPCMUX_ENDPOINTS".to_string())
        })?;

        let urls: Vec<String> = endpoints_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if urls.is_empty() {
            return Err(RpcMuxError::Configuration(
                "no RPC endpoints provided".to_string(),
            ));
        }

        let mut config = Self::from_urls(&urls);
        config.circuit_breaker = CircuitBreakerConfig::from_env();
        Ok(config)
    }

    /// Create a default configuration from a list of URLs
    pub fn from_urls(urls: &[String]) -> Self {
        let endpoints = urls
            .iter()
            .map(|url| EndpointConfig {
                url: url.clone(),
                weight: default_weight(),
                rate_limit: None,
            })
            .collect();

        Self {
            selector: SelectorConfig {
                endpoints,
                selection_strategy: default_strategy(),
                failover_threshold: default_failover_threshold(),
                health_check_interval_ms: default_health_check_interval_ms(),
                recovery_check_interval_ms: default_recovery_check_interval_ms(),
            },
            circuit_breaker: CircuitBreakerConfig::default(),
            token_bucket: TokenBucketConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            hedge: HedgeConfig::default(),
            pool: PoolConfig::default(),
            call_timeout_ms: default_call_timeout_ms(),
            failover_budget_ms: default_failover_budget_ms(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), RpcMuxError> {
        if self.selector.endpoints.is_empty() {
            return Err(RpcMuxError::Configuration(
                "at least one RPC endpoint must be configured".to_string(),
            ));
        }

        let mut seen_urls = std::collections::HashSet::new();
        for endpoint in &self.selector.endpoints {
            if !seen_urls.insert(&endpoint.url) {
                return Err(RpcMuxError::Configuration(format!(
                    "duplicate RPC URL: {}",
                    endpoint.url
                )));
            }

            if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                return Err(RpcMuxError::Configuration(format!(
                    "invalid URL format: {}",
                    endpoint.url
                )));
            }

            if endpoint.weight <= 0.0 || !endpoint.weight.is_finite() {
                return Err(RpcMuxError::Configuration(format!(
                    "invalid weight for {}: must be > 0",
                    endpoint.url
                )));
            }
        }

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            return Err(RpcMuxError::Configuration(
                "circuit breaker thresholds must be > 0".to_string(),
            ));
        }

        if self.token_bucket.rate_limit == 0 || self.token_bucket.window_ms == 0 {
            return Err(RpcMuxError::Configuration(
                "token bucket rate_limit and window_ms must be > 0".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(RpcMuxError::Configuration(
                "cache max_entries must be > 0".to_string(),
            ));
        }

        if self.batch.max_batch_size == 0 {
            return Err(RpcMuxError::Configuration(
                "batch max_batch_size must be > 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.hedge.latency_quantile) {
            return Err(RpcMuxError::Configuration(
                "hedge latency_quantile must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.selector.failover_threshold == 0 {
            return Err(RpcMuxError::Configuration(
                "failover_threshold must be > 0".to_string(),
            ));
        }

        if self.pool.max_connections == 0 || self.pool.max_per_endpoint == 0 {
            return Err(RpcMuxError::Configuration(
                "connection pool caps must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
