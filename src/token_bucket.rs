use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::TokenBucketConfig;

/// Snapshot of a bucket's current fill level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStatus {
    pub tokens: f64,
    pub max_tokens: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Per-endpoint token bucket rate limiter.
///
/// Refill is continuous and linear: `rate_limit` tokens accrue per `window`
/// of elapsed wall-clock time, evaluated on each access rather than on a
/// fixed tick, capped at `max_burst`.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_limit: f64,
    window: Duration,
    max_burst: f64,
}

impl TokenBucket {
    pub fn new(config: &TokenBucketConfig) -> Self {
        let max_burst = f64::from(config.max_burst);
        Self {
            state: Mutex::new(BucketState {
                tokens: max_burst,
                last_refill: Instant::now(),
            }),
            rate_limit: f64::from(config.rate_limit),
            window: Duration::from_millis(config.window_ms),
            max_burst,
        }
    }

    /// Build a bucket with an overridden refill rate, keeping the window and
    /// burst semantics of the base config
    pub fn with_rate(config: &TokenBucketConfig, rate_limit: u32) -> Self {
        Self::new(&TokenBucketConfig {
            rate_limit,
            max_burst: config.max_burst.max(rate_limit),
            ..config.clone()
        })
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        if elapsed.is_zero() {
            return;
        }
        let refill = elapsed.as_secs_f64() / self.window.as_secs_f64() * self.rate_limit;
        state.tokens = (state.tokens + refill).min(self.max_burst);
        state.last_refill = Instant::now();
    }

    /// Atomically take `n` tokens. Rejects without side effect when the
    /// bucket holds fewer than `n`.
    pub fn consume(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let needed = f64::from(n);
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Peek whether `n` tokens are currently available, without taking them
    pub fn can_consume(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens >= f64::from(n)
    }

    pub fn status(&self) -> BucketStatus {
        let mut state = self.state.lock();
        self.refill(&mut state);
        BucketStatus {
            tokens: state.tokens,
            max_tokens: self.max_burst,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn bucket(rate_limit: u32, window_ms: u64, max_burst: u32) -> TokenBucket {
        TokenBucket::new(&TokenBucketConfig {
            rate_limit,
            window_ms,
            max_burst,
        })
    }

    #[test]
    fn test_starts_full_and_consumes() {
        let b = bucket(10, 1000, 10);
        assert_eq!(b.status().max_tokens, 10.0);

        for _ in 0..10 {
            assert!(b.consume(1));
        }
        assert!(!b.consume(1));
    }

    #[test]
    fn test_can_consume_does_not_mutate() {
        let b = bucket(10, 1000, 10);
        assert!(b.can_consume(10));
        assert!(b.can_consume(10));
        // Peeking twice left the bucket intact
        assert!(b.consume(10));
        assert!(!b.can_consume(1));
    }

    #[test]
    fn test_rejected_consume_has_no_side_effect() {
        let b = bucket(10, 1000, 10);
        assert!(b.consume(8));
        let before = b.status().tokens;
        assert!(!b.consume(5));
        let after = b.status().tokens;
        // Refill over the nanoseconds between reads is the only drift allowed
        assert!(after >= before);
        assert!(after - before < 0.5);
    }

    #[test]
    fn test_linear_refill_accuracy() {
        // 100 tokens per 100ms window, drained empty
        let b = bucket(100, 100, 100);
        assert!(b.consume(100));

        std::thread::sleep(Duration::from_millis(50));

        // ~50 tokens should have accrued; allow a few percent of slack for
        // scheduler jitter
        let tokens = b.status().tokens;
        assert!(tokens >= 45.0, "tokens = {}", tokens);
        assert!(tokens <= 60.0, "tokens = {}", tokens);
    }

    #[test]
    fn test_refill_capped_at_max_burst() {
        let b = bucket(1000, 10, 5);
        assert!(b.consume(5));
        std::thread::sleep(Duration::from_millis(50));
        let status = b.status();
        assert!(status.tokens <= 5.0);
    }

    #[test]
    fn test_concurrent_consumption_never_oversubscribes() {
        let b = Arc::new(bucket(10, 60_000, 10));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let b = b.clone();
            handles.push(std::thread::spawn(move || {
                let mut taken = 0u32;
                for _ in 0..100 {
                    if b.consume(1) {
                        taken += 1;
                    }
                }
                taken
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Burst of 10 plus at most a token or two of refill over the test's
        // runtime against the 60s window
        assert!(total <= 12, "total consumed = {}", total);
    }

    proptest! {
        #[test]
        fn prop_consume_bounded_by_burst(requests in proptest::collection::vec(1u32..4, 1..64)) {
            let b = bucket(100, 60_000, 20);
            let mut consumed = 0u64;
            for n in requests {
                if b.consume(n) {
                    consumed += u64::from(n);
                }
            }
            // No waiting happens in this test, so consumption can never
            // meaningfully exceed the burst capacity
            prop_assert!(consumed <= 21);
        }

        #[test]
        fn prop_status_within_bounds(take in 0u32..20) {
            let b = bucket(100, 1000, 20);
            let _ = b.consume(take);
            let status = b.status();
            prop_assert!(status.tokens >= 0.0);
            prop_assert!(status.tokens <= status.max_tokens + f64::EPSILON);
        }
    }
}
