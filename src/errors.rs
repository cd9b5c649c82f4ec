use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the multiplexing client.
///
/// The type is `Clone` so a single failure can be fanned out to every
/// coalesced waiter and every member of a failed batch.
#[derive(Debug, Clone, Error)]
pub enum RpcMuxError {
    /// Circuit breaker is open for the target service key
    #[error("circuit open for service {service} (consecutive failures: {failures})")]
    CircuitOpen { service: String, failures: u32 },

    /// No tokens available on any healthy endpoint
    #[error("rate limited: no tokens available across {endpoints_tried} healthy endpoint(s)")]
    RateLimited { endpoints_tried: usize },

    /// Connection concurrency cap hit
    #[error("connection pool exhausted (in use: {in_use}, cap: {cap})")]
    ConnectionPoolExhausted { in_use: usize, cap: usize },

    /// Transport-level failure (network, connection)
    #[error("endpoint unreachable: {message} (endpoint: {endpoint})")]
    EndpointUnreachable { endpoint: String, message: String },

    /// Caller or internal budget exceeded
    #[error("timeout after {timeout_ms}ms (endpoint: {endpoint})")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// Malformed payload from the executor
    #[error("invalid response: {message} (endpoint: {endpoint})")]
    InvalidResponse { endpoint: String, message: String },

    /// Every configured endpoint is excluded from selection
    #[error("no healthy endpoints available (total: {total}, unhealthy: {unhealthy})")]
    NoHealthyEndpoints { total: usize, unhealthy: usize },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcMuxError {
    /// Whether the router may retry this failure on another healthy endpoint.
    ///
    /// Circuit-open and rate-limited conditions are back-off signals for the
    /// caller and are never retried internally.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcMuxError::EndpointUnreachable { .. } => true,
            RpcMuxError::Timeout { .. } => true,
            RpcMuxError::InvalidResponse { .. } => true,

            RpcMuxError::CircuitOpen { .. } => false,
            RpcMuxError::RateLimited { .. } => false,
            RpcMuxError::ConnectionPoolExhausted { .. } => false,
            RpcMuxError::NoHealthyEndpoints { .. } => false,
            RpcMuxError::Configuration(_) => false,
            RpcMuxError::Internal(_) => false,
        }
    }

    /// Whether this failure should count against the endpoint's health score.
    pub fn is_endpoint_fault(&self) -> bool {
        matches!(
            self,
            RpcMuxError::EndpointUnreachable { .. }
                | RpcMuxError::Timeout { .. }
                | RpcMuxError::InvalidResponse { .. }
        )
    }

    /// Get the endpoint associated with this error, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            RpcMuxError::EndpointUnreachable { endpoint, .. } => Some(endpoint),
            RpcMuxError::Timeout { endpoint, .. } => Some(endpoint),
            RpcMuxError::InvalidResponse { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

/// Retry policy for failover attempts inside the call router
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Base delay in milliseconds
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,

    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            jitter_factor: 0.1,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt number, `None` once attempts are spent
    pub fn calculate_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        // Exponential backoff
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        // Jitter to prevent thundering herd
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        let jittered_delay = (delay_ms * (1.0 + jitter)).max(0.0) as u64;

        Some(Duration::from_millis(jittered_delay))
    }

    /// Retry policy for latency-sensitive call paths
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 20,
            max_delay_ms: 500,
            jitter_factor: 0.15,
            multiplier: 1.5,
        }
    }

    /// Retry policy for background traffic
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_factor: 0.05,
            multiplier: 3.0,
        }
    }
}
