use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{select_all, BoxFuture};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::HedgeConfig;
use crate::endpoint::Endpoint;
use crate::errors::RpcMuxError;

/// Samples required before the hedging delay adapts to observed latency
const MIN_ADAPTIVE_SAMPLES: usize = 20;

/// Sliding window of recent call latencies for percentile estimation
#[derive(Debug)]
pub struct LatencyWindow {
    samples: RwLock<VecDeque<f64>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, latency_ms: f64) {
        let mut samples = self.samples.write();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// Nearest-rank quantile over the current window
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let samples = self.samples.read();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx])
    }
}

/// Winning attempt of a hedged call
#[derive(Debug)]
pub struct HedgeOutcome<T> {
    pub value: T,
    pub endpoint: Arc<Endpoint>,
    pub latency_ms: f64,
    pub attempts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HedgeStats {
    pub hedged_calls: u64,
    pub backups_launched: u64,
    pub primary_wins: u64,
    pub backup_wins: u64,
    pub current_delay_ms: u64,
    pub latency_samples: usize,
}

/// Hedged dispatch: race a primary attempt against delayed backups.
///
/// A backup launches only after the adaptive delay elapses with the primary
/// still pending, or immediately when every in-flight attempt has already
/// failed. The first success wins; the losing futures are dropped and only
/// the winner's latency feeds the window.
pub struct HedgedManager {
    config: HedgeConfig,
    latency: LatencyWindow,
    hedged_calls: AtomicU64,
    backups_launched: AtomicU64,
    primary_wins: AtomicU64,
    backup_wins: AtomicU64,
}

impl HedgedManager {
    pub fn new(config: HedgeConfig) -> Self {
        Self {
            config,
            latency: LatencyWindow::new(512),
            hedged_calls: AtomicU64::new(0),
            backups_launched: AtomicU64::new(0),
            primary_wins: AtomicU64::new(0),
            backup_wins: AtomicU64::new(0),
        }
    }

    /// Delay before the next backup attempt. Starts at the configured base
    /// and adapts toward the observed latency quantile once enough samples
    /// exist, clamped between the base and the configured ceiling.
    pub fn current_delay(&self) -> Duration {
        let base = self.config.hedging_delay_ms;
        let ms = if self.latency.len() >= MIN_ADAPTIVE_SAMPLES {
            self.latency
                .quantile(self.config.latency_quantile)
                .map(|p| p.round() as u64)
                .unwrap_or(base)
        } else {
            base
        };
        // A base above the ceiling wins; clamp panics on inverted bounds
        let ceiling = self.config.max_hedging_delay_ms.max(base);
        Duration::from_millis(ms.clamp(base, ceiling))
    }

    /// Race `attempt` across the given endpoint rotation and return the
    /// first success. With hedging disabled, backups still launch on failure
    /// of every in-flight attempt, never on the timer.
    pub async fn execute<T, F>(
        &self,
        endpoints: Vec<Arc<Endpoint>>,
        attempt: F,
    ) -> Result<HedgeOutcome<T>, RpcMuxError>
    where
        T: Send + 'static,
        F: Fn(Arc<Endpoint>) -> BoxFuture<'static, Result<T, RpcMuxError>>,
    {
        if endpoints.is_empty() {
            return Err(RpcMuxError::NoHealthyEndpoints {
                total: 0,
                unhealthy: 0,
            });
        }

        self.hedged_calls.fetch_add(1, Ordering::Relaxed);

        let timed_backup_cap = if self.config.enabled {
            self.config.max_backups
        } else {
            0
        };
        let delay = self.current_delay();
        let started = tokio::time::Instant::now();

        let mut in_flight: Vec<BoxFuture<'static, (usize, Result<T, RpcMuxError>)>> =
            vec![Self::indexed(0, attempt(endpoints[0].clone()))];
        let mut next_idx = 1;
        let mut timed_backups = 0;
        let mut attempts = 1;
        let mut last_err: Option<RpcMuxError> = None;

        loop {
            if in_flight.is_empty() {
                // Every launched attempt has failed; fall straight over to
                // the next endpoint in rotation without waiting for a timer
                if next_idx < endpoints.len() {
                    in_flight.push(Self::indexed(next_idx, attempt(endpoints[next_idx].clone())));
                    next_idx += 1;
                    attempts += 1;
                    continue;
                }
                return Err(last_err.unwrap_or(RpcMuxError::NoHealthyEndpoints {
                    total: endpoints.len(),
                    unhealthy: endpoints.len(),
                }));
            }

            let may_hedge = next_idx < endpoints.len() && timed_backups < timed_backup_cap;
            let mut race = select_all(in_flight);

            let settled = if may_hedge {
                let fire_at = started + delay * (timed_backups as u32 + 1);
                tokio::select! {
                    out = &mut race => Some(out),
                    _ = tokio::time::sleep_until(fire_at) => None,
                }
            } else {
                Some((&mut race).await)
            };

            match settled {
                Some(((winner_idx, Ok(value)), _, _losers)) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.latency.record(latency_ms);
                    if winner_idx == 0 {
                        self.primary_wins.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.backup_wins.fetch_add(1, Ordering::Relaxed);
                    }
                    trace!(
                        endpoint = %endpoints[winner_idx].url(),
                        latency_ms = latency_ms,
                        attempts = attempts,
                        "hedged call settled"
                    );
                    return Ok(HedgeOutcome {
                        value,
                        endpoint: endpoints[winner_idx].clone(),
                        latency_ms,
                        attempts,
                    });
                }
                Some(((failed_idx, Err(err)), _, rest)) => {
                    debug!(endpoint = %endpoints[failed_idx].url(), error = %err, "hedge attempt failed");
                    last_err = Some(err);
                    in_flight = rest;
                }
                None => {
                    in_flight = race.into_inner();
                    in_flight.push(Self::indexed(next_idx, attempt(endpoints[next_idx].clone())));
                    debug!(endpoint = %endpoints[next_idx].url(), delay_ms = delay.as_millis() as u64, "launching backup attempt");
                    next_idx += 1;
                    timed_backups += 1;
                    attempts += 1;
                    self.backups_launched.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn indexed<T: Send + 'static>(
        idx: usize,
        fut: BoxFuture<'static, Result<T, RpcMuxError>>,
    ) -> BoxFuture<'static, (usize, Result<T, RpcMuxError>)> {
        Box::pin(async move { (idx, fut.await) })
    }

    pub fn stats(&self) -> HedgeStats {
        HedgeStats {
            hedged_calls: self.hedged_calls.load(Ordering::Relaxed),
            backups_launched: self.backups_launched.load(Ordering::Relaxed),
            primary_wins: self.primary_wins.load(Ordering::Relaxed),
            backup_wins: self.backup_wins.load(Ordering::Relaxed),
            current_delay_ms: self.current_delay().as_millis() as u64,
            latency_samples: self.latency.len(),
        }
    }
}
