use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;
use crate::errors::RpcMuxError;

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: on the Nth consecutive failure (`failure_threshold`)
/// - `Open` -> `HalfOpen`: once `cooldown_period` has elapsed, evaluated
///   lazily on the next gate check rather than by a timer
/// - `HalfOpen` -> `Closed`: after `success_threshold` consecutive successes
/// - `HalfOpen` -> `Open`: on any failure, resetting the cooldown clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInternalState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Probe permits currently live while half-open
    half_open_admitted: u32,
}

impl CircuitInternalState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_admitted: 0,
        }
    }
}

#[derive(Debug)]
struct ServiceCircuit {
    inner: Mutex<CircuitInternalState>,
    executions: AtomicU64,
}

impl ServiceCircuit {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CircuitInternalState::new()),
            executions: AtomicU64::new(0),
        }
    }
}

/// Gate pass handed out by [`CircuitBreaker::check`].
///
/// While the circuit is half-open the permit occupies one of the limited
/// probe slots; dropping it returns the slot whatever became of the call,
/// including local rejections and caller cancellation that never reach
/// `record_success`/`record_failure`.
#[must_use]
#[derive(Debug)]
pub struct ProbePermit {
    slot: Option<Arc<ServiceCircuit>>,
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        if let Some(circuit) = self.slot.take() {
            let mut inner = circuit.inner.lock();
            inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
        }
    }
}

/// Read-only per-service snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub executions: u64,
}

/// Aggregate breaker counters
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub total_executions: u64,
    pub total_rejections: u64,
    pub total_transitions: u64,
    pub services: usize,
}

/// Per-service-key failure isolator.
///
/// One `CircuitInternalState` per service key, created lazily on first use
/// and never dropped for the process lifetime. Keys are independent: state
/// on one service never affects another. Each key's state sits under its own
/// mutex inside a sharded concurrent map, so unrelated services do not
/// contend.
#[derive(Debug)]
pub struct CircuitBreaker {
    services: DashMap<String, Arc<ServiceCircuit>>,
    config: CircuitBreakerConfig,
    total_executions: AtomicU64,
    total_rejections: AtomicU64,
    total_transitions: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            services: DashMap::new(),
            config,
            total_executions: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_transitions: AtomicU64::new(0),
        }
    }

    /// Build with thresholds taken from environment variables (ops override)
    pub fn from_env() -> Self {
        Self::new(CircuitBreakerConfig::from_env())
    }

    fn service(&self, key: &str) -> Arc<ServiceCircuit> {
        if let Some(existing) = self.services.get(key) {
            return existing.clone();
        }
        self.services
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ServiceCircuit::new()))
            .clone()
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_period_ms)
    }

    /// Gate a call on `service`. Fails fast with `CircuitOpen` when the
    /// circuit is open (and the cooldown has not elapsed) or when the
    /// half-open probe budget is spent. The returned permit must be held
    /// for the duration of the call; its drop releases the probe slot.
    pub fn check(&self, service: &str) -> Result<ProbePermit, RpcMuxError> {
        let circuit = self.service(service);
        let mut inner = circuit.inner.lock();

        // Lazy Open -> HalfOpen transition on access
        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.cooldown() {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_admitted = 0;
                self.total_transitions.fetch_add(1, Ordering::Relaxed);
                warn!(service = %service, "circuit transitioning to half-open");
            }
        }

        match inner.state {
            CircuitState::Closed => Ok(ProbePermit { slot: None }),
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_tests {
                    inner.half_open_admitted += 1;
                    Ok(ProbePermit {
                        slot: Some(circuit.clone()),
                    })
                } else {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(RpcMuxError::CircuitOpen {
                        service: service.to_string(),
                        failures: inner.consecutive_failures,
                    })
                }
            }
            CircuitState::Open => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                Err(RpcMuxError::CircuitOpen {
                    service: service.to_string(),
                    failures: inner.consecutive_failures,
                })
            }
        }
    }

    pub fn record_success(&self, service: &str) {
        let circuit = self.service(service);
        circuit.executions.fetch_add(1, Ordering::Relaxed);
        self.total_executions.fetch_add(1, Ordering::Relaxed);

        let mut inner = circuit.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    inner.half_open_admitted = 0;
                    self.total_transitions.fetch_add(1, Ordering::Relaxed);
                    debug!(service = %service, "circuit closed after recovery");
                }
            }
            // A success observed while open (e.g. a straggling in-flight
            // call) does not move the state machine
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, service: &str) {
        let circuit = self.service(service);
        circuit.executions.fetch_add(1, Ordering::Relaxed);
        self.total_executions.fetch_add(1, Ordering::Relaxed);

        let mut inner = circuit.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.total_transitions.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        service = %service,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_failures += 1;
                inner.consecutive_successes = 0;
                inner.opened_at = Some(Instant::now());
                inner.half_open_admitted = 0;
                self.total_transitions.fetch_add(1, Ordering::Relaxed);
                warn!(service = %service, "circuit reopened from half-open");
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    /// Gate, run, and record in one step
    pub async fn execute<F, Fut, T>(&self, service: &str, operation: F) -> Result<T, RpcMuxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RpcMuxError>>,
    {
        let _permit = self.check(service)?;
        match operation().await {
            Ok(value) => {
                self.record_success(service);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(service);
                Err(e)
            }
        }
    }

    /// Current state for `service`, applying the lazy cooldown transition
    pub fn state(&self, service: &str) -> CircuitState {
        let circuit = self.service(service);
        let mut inner = circuit.inner.lock();
        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.cooldown() {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_admitted = 0;
                self.total_transitions.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.state
    }

    /// Force `service` back to a pristine closed circuit
    pub fn reset(&self, service: &str) {
        let circuit = self.service(service);
        *circuit.inner.lock() = CircuitInternalState::new();
        debug!(service = %service, "circuit reset");
    }

    pub fn service_stats(&self, service: &str) -> Option<ServiceStats> {
        let circuit = self.services.get(service)?;
        let inner = circuit.inner.lock();
        Some(ServiceStats {
            service: service.to_string(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            executions: circuit.executions.load(Ordering::Relaxed),
        })
    }

    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            total_executions: self.total_executions.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_transitions: self.total_transitions.load(Ordering::Relaxed),
            services: self.services.len(),
        }
    }
}
