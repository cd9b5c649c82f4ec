use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::PoolConfig;
use crate::endpoint::Endpoint;
use crate::errors::RpcMuxError;

/// Global and per-endpoint in-flight connection accounting.
///
/// Slots are RAII guards: acquiring reserves capacity, dropping the guard
/// releases it, so capacity can never leak across early returns or panics
/// in the caller.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    in_use: AtomicU32,
    acquired_total: AtomicU64,
    rejected_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub in_use: u32,
    pub max_connections: u32,
    pub acquired_total: u64,
    pub rejected_total: u64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            in_use: AtomicU32::new(0),
            acquired_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Reserve a slot against both the global cap and the endpoint's cap
    pub fn acquire(
        self: &Arc<Self>,
        endpoint: Arc<Endpoint>,
    ) -> Result<ConnectionSlot, RpcMuxError> {
        let global = self.in_use.fetch_add(1, Ordering::AcqRel);
        if global >= self.config.max_connections {
            self.in_use.fetch_sub(1, Ordering::AcqRel);
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(RpcMuxError::ConnectionPoolExhausted {
                in_use: global as usize,
                cap: self.config.max_connections as usize,
            });
        }

        let per_endpoint = endpoint.active_connections.fetch_add(1, Ordering::AcqRel);
        if per_endpoint >= self.config.max_per_endpoint {
            endpoint.active_connections.fetch_sub(1, Ordering::AcqRel);
            self.in_use.fetch_sub(1, Ordering::AcqRel);
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            debug!(url = %endpoint.url(), in_use = per_endpoint, "endpoint connection cap hit");
            return Err(RpcMuxError::ConnectionPoolExhausted {
                in_use: per_endpoint as usize,
                cap: self.config.max_per_endpoint as usize,
            });
        }

        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        Ok(ConnectionSlot {
            pool: self.clone(),
            endpoint,
        })
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.in_use(),
            max_connections: self.config.max_connections,
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }
}

/// RAII reservation against the pool; dropping it frees both counters
#[derive(Debug)]
pub struct ConnectionSlot {
    pool: Arc<ConnectionPool>,
    endpoint: Arc<Endpoint>,
}

impl ConnectionSlot {
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.endpoint.active_connections.fetch_sub(1, Ordering::AcqRel);
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}
