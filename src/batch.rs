use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::errors::RpcMuxError;

/// Executes one flushed batch: same method, one params entry per call,
/// results expected back in the same order
pub type BatchDispatcher = Arc<
    dyn Fn(String, Vec<Value>) -> BoxFuture<'static, Result<Vec<Value>, RpcMuxError>>
        + Send
        + Sync,
>;

struct PendingCall {
    params: Value,
    tx: oneshot::Sender<Result<Value, RpcMuxError>>,
}

#[derive(Default)]
struct MethodQueue {
    calls: Vec<PendingCall>,
    // Bumped on every flush so a stale window timer cannot drain the
    // batch that formed after it
    generation: u64,
}

#[derive(Clone, Copy)]
enum FlushTrigger {
    Window,
    Size,
    Drain,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub batches_flushed: u64,
    pub calls_batched: u64,
    pub window_flushes: u64,
    pub size_flushes: u64,
}

/// Transparent micro-batcher.
///
/// Calls to the same method that arrive within one batch window collapse
/// into a single dispatcher invocation; each caller gets back exactly the
/// result at its own position. A batch flushes when the window elapses or
/// when it reaches `max_batch_size`, whichever comes first.
pub struct BatchManager {
    config: BatchConfig,
    queues: DashMap<String, MethodQueue>,
    dispatcher: BatchDispatcher,
    batches_flushed: AtomicU64,
    calls_batched: AtomicU64,
    window_flushes: AtomicU64,
    size_flushes: AtomicU64,
}

impl BatchManager {
    pub fn new(config: BatchConfig, dispatcher: BatchDispatcher) -> Self {
        Self {
            config,
            queues: DashMap::new(),
            dispatcher,
            batches_flushed: AtomicU64::new(0),
            calls_batched: AtomicU64::new(0),
            window_flushes: AtomicU64::new(0),
            size_flushes: AtomicU64::new(0),
        }
    }

    /// Whether the router should send this method through the batcher at all
    pub fn is_batchable(&self, method: &str) -> bool {
        self.config.enable_batching
            && self
                .config
                .batchable_methods
                .iter()
                .any(|m| m == method)
    }

    /// Enqueue a call and wait for its slice of the batch result
    pub async fn submit(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, RpcMuxError> {
        let (tx, rx) = oneshot::channel();

        let (flush_now, start_timer, generation) = {
            let mut queue = self.queues.entry(method.to_string()).or_default();
            queue.calls.push(PendingCall { params, tx });
            let first = queue.calls.len() == 1;
            let full = queue.calls.len() >= self.config.max_batch_size;
            (full, first && !full, queue.generation)
        };

        if flush_now {
            // Flush in a task of its own: running it inline would tie the
            // whole batch's dispatch to this one caller's lifetime
            let this = self.clone();
            let method = method.to_string();
            tokio::spawn(async move {
                this.flush(&method, Some(generation), FlushTrigger::Size).await;
            });
        } else if start_timer {
            let this = self.clone();
            let method = method.to_string();
            let window = Duration::from_millis(self.config.batch_window_ms);
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                this.flush(&method, Some(generation), FlushTrigger::Window).await;
            });
        }

        rx.await
            .map_err(|_| RpcMuxError::Internal("batch dropped before completion".into()))?
    }

    /// Drain the queue for `method` and dispatch it as one wire call.
    /// `expect_generation` makes stale triggers no-ops against batches that
    /// already flushed; only the trigger that actually drains is counted.
    async fn flush(&self, method: &str, expect_generation: Option<u64>, trigger: FlushTrigger) {
        let calls = {
            let mut queue = match self.queues.get_mut(method) {
                Some(q) => q,
                None => return,
            };
            if let Some(generation) = expect_generation {
                if queue.generation != generation {
                    return;
                }
            }
            if queue.calls.is_empty() {
                return;
            }
            queue.generation += 1;
            std::mem::take(&mut queue.calls)
        };

        let count = calls.len();
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.calls_batched.fetch_add(count as u64, Ordering::Relaxed);
        match trigger {
            FlushTrigger::Window => {
                self.window_flushes.fetch_add(1, Ordering::Relaxed);
            }
            FlushTrigger::Size => {
                self.size_flushes.fetch_add(1, Ordering::Relaxed);
            }
            FlushTrigger::Drain => {}
        }
        debug!(method = method, calls = count, "flushing batch");

        let params: Vec<Value> = calls.iter().map(|c| c.params.clone()).collect();
        match (self.dispatcher)(method.to_string(), params).await {
            Ok(results) if results.len() == count => {
                for (call, result) in calls.into_iter().zip(results) {
                    let _ = call.tx.send(Ok(result));
                }
            }
            Ok(results) => {
                warn!(
                    method = method,
                    expected = count,
                    got = results.len(),
                    "batch result count mismatch"
                );
                for call in calls {
                    let _ = call.tx.send(Err(RpcMuxError::Internal(format!(
                        "batch returned {} results for {} calls",
                        results.len(),
                        count
                    ))));
                }
            }
            Err(err) => {
                for call in calls {
                    let _ = call.tx.send(Err(err.clone()));
                }
            }
        }
    }

    /// Flush every open batch immediately, regardless of window or size.
    /// Used on shutdown so no waiter is left pending.
    pub async fn flush_all(&self) {
        let methods: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        for method in methods {
            self.flush(&method, None, FlushTrigger::Drain).await;
        }
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            calls_batched: self.calls_batched.load(Ordering::Relaxed),
            window_flushes: self.window_flushes.load(Ordering::Relaxed),
            size_flushes: self.size_flushes.load(Ordering::Relaxed),
        }
    }
}
