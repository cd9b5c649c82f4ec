//! Resilient multiplexing client for rate-limited, multi-endpoint RPC
//! infrastructure.
//!
//! The crate wires together a health-aware endpoint selector, per-endpoint
//! token buckets, a per-method circuit breaker, a coalescing TTL/LRU response
//! cache, a transparent micro-batcher, and hedged dispatch with adaptive
//! backup delays. Callers plug in the wire protocol by implementing
//! [`RpcExecutor`]; everything above that seam is transport-agnostic.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpcmux::{ComponentFactory, RpcMuxConfig};
//! # use rpcmux::{Endpoint, RpcExecutor, RpcMuxError};
//! # use serde_json::{json, Value};
//! # struct MyExecutor;
//! # #[async_trait::async_trait]
//! # impl RpcExecutor for MyExecutor {
//! #     async fn execute(&self, _: &Endpoint, _: &str, _: Value) -> Result<Value, RpcMuxError> {
//! #         Ok(json!(null))
//! #     }
//! #     async fn execute_batch(&self, _: &Endpoint, _: &str, b: Vec<Value>) -> Result<Vec<Value>, RpcMuxError> {
//! #         Ok(b)
//! #     }
//! # }
//!
//! # async fn run() -> Result<(), RpcMuxError> {
//! let config = RpcMuxConfig::from_urls(&["https://rpc.example".to_string()]);
//! let stack = ComponentFactory::new(config)?.build(Arc::new(MyExecutor));
//! let slot = stack.manager().call("getSlot", json!([])).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;

pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod factory;
pub mod hedge;
pub mod manager;
pub mod observability;
pub mod pool;
pub mod token_bucket;

pub use batch::{BatchManager, BatchStats};
pub use cache::{cache_key, CacheStats, RequestCache};
pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitState, ProbePermit, ServiceStats};
pub use config::{
    BatchConfig, CacheConfig, CircuitBreakerConfig, EndpointConfig, HedgeConfig, PoolConfig,
    RpcMuxConfig, SelectionStrategy, SelectorConfig, TokenBucketConfig,
};
pub use endpoint::{Endpoint, EndpointSelector, EndpointStats, SelectorStats};
pub use errors::{RetryPolicy, RpcMuxError};
pub use factory::{ComponentFactory, RpcStack};
pub use hedge::{HedgeStats, HedgedManager, LatencyWindow};
pub use manager::{CallOptions, ManagerStats, RpcManager};
pub use observability::{init_tracing, init_tracing_json, try_init_tracing};
pub use pool::{ConnectionPool, ConnectionSlot, PoolStats};
pub use token_bucket::{BucketStatus, TokenBucket};

/// The wire seam: executes a single call or a positional batch against one
/// concrete endpoint.
///
/// Implementations should return [`RpcMuxError::EndpointUnreachable`],
/// [`RpcMuxError::Timeout`], or [`RpcMuxError::InvalidResponse`] for faults
/// attributable to the endpoint; those are the errors that drive failover
/// and health accounting.
#[async_trait]
pub trait RpcExecutor: Send + Sync + 'static {
    /// Execute one call against `endpoint`
    async fn execute(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcMuxError>;

    /// Execute a same-method batch against `endpoint`. Results must come
    /// back in request order, one per entry.
    async fn execute_batch(
        &self,
        endpoint: &Endpoint,
        method: &str,
        batch: Vec<Value>,
    ) -> Result<Vec<Value>, RpcMuxError>;
}
