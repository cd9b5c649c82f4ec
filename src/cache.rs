use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::errors::RpcMuxError;

/// Deterministic cache key over method + params
pub fn cache_key(method: &str, params: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    // serde_json serialization of Value is deterministic for a given value
    hasher.update(serde_json::to_vec(params).unwrap_or_default());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
    /// Logical access clock tick, drives LRU ordering
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

type FetchResult = Result<Value, RpcMuxError>;

/// Hit/miss/coalescing counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced_waiters: u64,
    pub evictions: u64,
    pub expired_removed: u64,
    pub entries: usize,
}

/// Response cache with TTL expiry, strict-LRU eviction, and in-flight
/// coalescing.
///
/// Expiry is lazy on access and swept periodically by a background task.
/// Coalescing keeps at most one outstanding fetch per key: the first miss
/// becomes the leader and runs the fetcher, later misses subscribe to the
/// leader's broadcast channel and observe the identical result, including
/// errors. The in-flight record is removed the instant the fetch settles.
#[derive(Debug)]
pub struct RequestCache {
    entries: DashMap<String, CacheEntry>,
    inflight: DashMap<String, broadcast::Sender<FetchResult>>,
    config: CacheConfig,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

impl RequestCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            config,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.config.default_ttl_ms)
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired() {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }

        // Expired entries report as absent even before the sweeper runs.
        // remove_if guards against racing a concurrent fresh insert.
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired())
            .is_some()
        {
            self.expired_removed.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Cached value for `key`, if present and unexpired. Counts hit/miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.lookup(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert `value` under `ttl` (or the default), evicting the
    /// least-recently-accessed entry once capacity is exceeded
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl: ttl.unwrap_or_else(|| self.default_ttl()),
            last_access: AtomicU64::new(self.tick()),
        };
        self.entries.insert(key.to_string(), entry);

        while self.entries.len() > self.config.max_entries {
            if !self.evict_lru() {
                break;
            }
        }
    }

    fn evict_lru(&self) -> bool {
        let mut victim: Option<(String, u64)> = None;
        for entry in self.entries.iter() {
            let access = entry.last_access.load(Ordering::Relaxed);
            match &victim {
                Some((_, best)) if access >= *best => {}
                _ => victim = Some((entry.key().clone(), access)),
            }
        }

        match victim {
            Some((key, _)) => {
                if self.entries.remove(&key).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, "evicted LRU cache entry");
                }
                true
            }
            None => false,
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Whether the router should serve this method through the cache by
    /// default
    pub fn is_cacheable(&self, method: &str) -> bool {
        self.config.cacheable_methods.iter().any(|m| m == method)
    }

    /// Get-or-fetch with coalescing.
    ///
    /// Exactly one fetcher invocation runs per key across any number of
    /// concurrent callers; all of them observe the same result. Successful
    /// results are stored under `ttl` before waiters are woken.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetcher: F,
    ) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        if let Some(value) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if !self.config.enable_coalescing {
            let result = fetcher().await;
            if let Ok(ref value) = result {
                self.set(key, value.clone(), ttl);
            }
            return result;
        }

        // Either become the leader for this key or attach as a waiter.
        // The entry guard is dropped before any await point. A waiter whose
        // leader is dropped before settling sees its channel close and goes
        // around again, so a cancelled leader can never strand the key.
        loop {
            let waiter = match self.inflight.entry(key.to_string()) {
                Entry::Occupied(occupied) => Some(occupied.get().subscribe()),
                Entry::Vacant(vacant) => {
                    let (tx, _rx) = broadcast::channel(1);
                    vacant.insert(tx);
                    None
                }
            };

            match waiter {
                Some(mut rx) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, "coalescing onto in-flight fetch");
                    match rx.recv().await {
                        Ok(result) => return result,
                        Err(_) => {
                            if let Some(value) = self.lookup(key) {
                                self.hits.fetch_add(1, Ordering::Relaxed);
                                return Ok(value);
                            }
                        }
                    }
                }
                None => break,
            }
        }

        // Leader path. The guard unregisters the in-flight record if this
        // future is dropped mid-fetch, waking waiters via the closed channel.
        let mut guard = InflightGuard {
            cache: self,
            key,
            armed: true,
        };

        let result = fetcher().await;
        if let Ok(ref value) = result {
            self.set(key, value.clone(), ttl);
        }

        // Remove the in-flight record before waking waiters so late arrivals
        // start a fresh fetch instead of attaching to a settled one
        guard.armed = false;
        if let Some((_, tx)) = self.inflight.remove(key) {
            let _ = tx.send(result.clone());
        }

        result
    }

    fn drop_inflight(&self, key: &str) {
        self.inflight.remove(key);
    }

    /// Spawn the periodic expiry sweep. The returned handle is owned by the
    /// factory and aborted on shutdown.
    pub fn start_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let before = self.entries.len();
                self.entries.retain(|_, entry| !entry.is_expired());
                let removed = before.saturating_sub(self.entries.len());
                if removed > 0 {
                    self.expired_removed
                        .fetch_add(removed as u64, Ordering::Relaxed);
                    debug!(removed = removed, "cache sweep removed expired entries");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced_waiters: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

/// Unregisters a leader's in-flight record when the leading future is
/// dropped before settling; dropping the sender wakes every waiter
struct InflightGuard<'a> {
    cache: &'a RequestCache,
    key: &'a str,
    armed: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.drop_inflight(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn cache(max_entries: usize, default_ttl_ms: u64) -> RequestCache {
        RequestCache::new(CacheConfig {
            max_entries,
            default_ttl_ms,
            cleanup_interval_ms: 60_000,
            enable_coalescing: true,
            cacheable_methods: Vec::new(),
        })
    }

    #[test]
    fn test_cache_key_determinism() {
        let a = cache_key("getBalance", &[json!("abc"), json!(1)]);
        let b = cache_key("getBalance", &[json!("abc"), json!(1)]);
        let c = cache_key("getBalance", &[json!("abc"), json!(2)]);
        let d = cache_key("getAccountInfo", &[json!("abc"), json!(1)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_set_get_has() {
        let c = cache(10, 1000);
        assert!(c.get("k").is_none());

        c.set("k", json!(42), None);
        assert!(c.has("k"));
        assert_eq!(c.get("k"), Some(json!(42)));
        assert_eq!(c.len(), 1);

        c.clear();
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry_within_tolerance() {
        let c = cache(10, 1000);
        c.set("k", json!("v"), Some(Duration::from_millis(100)));

        assert!(c.has("k"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(c.has("k"), "entry should survive at ~60ms of a 100ms TTL");

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!c.has("k"), "entry should be absent by ~130ms");
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let c = cache(5, 60_000);
        for i in 0..5 {
            c.set(&format!("k{}", i), json!(i), None);
        }

        // Touch everything except k1, making k1 the LRU victim
        for i in [0usize, 2, 3, 4] {
            assert!(c.get(&format!("k{}", i)).is_some());
        }

        c.set("k5", json!(5), None);

        assert_eq!(c.len(), 5);
        assert!(!c.has("k1"), "least-recently-accessed entry must go");
        for i in [0usize, 2, 3, 4, 5] {
            assert!(c.has(&format!("k{}", i)), "k{} should survive", i);
        }
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coalescing_single_fetch() {
        let c = Arc::new(cache(100, 60_000));
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let c = c.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                c.get_or_fetch("same-key", None, || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("payload"))
                })
                .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.unwrap(), json!("payload"));
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1, "exactly one fetch must run");
        assert!(c.stats().coalesced_waiters >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coalesced_error_fans_out() {
        let c = Arc::new(cache(100, 60_000));
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let c = c.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                c.get_or_fetch("bad-key", None, || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err(RpcMuxError::EndpointUnreachable {
                        endpoint: "https://node-0.example".to_string(),
                        message: "boom".to_string(),
                    })
                })
                .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(
                result,
                Err(RpcMuxError::EndpointUnreachable { .. })
            ));
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        // Errors are not cached; the next call fetches again
        assert!(!c.has("bad-key"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_leader_does_not_strand_the_key() {
        let c = Arc::new(cache(100, 60_000));

        let leader = {
            let c = c.clone();
            tokio::spawn(async move {
                c.get_or_fetch("k", None, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!("never"))
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move {
                c.get_or_fetch("k", None, || async { Ok(json!("from-waiter")) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        leader.abort();

        // The attached waiter takes over the fetch instead of hanging
        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter must settle once the leader is gone")
            .unwrap()
            .unwrap();
        assert_eq!(result, json!("from-waiter"));

        // Fresh callers are not stuck behind a dead in-flight record either
        let late = tokio::time::timeout(
            Duration::from_millis(500),
            c.get_or_fetch("k", None, || async { Ok(json!("late")) }),
        )
        .await
        .expect("new caller must not attach to a dead fetch")
        .unwrap();
        assert_eq!(late, json!("from-waiter"));
    }

    #[tokio::test]
    async fn test_inflight_record_removed_after_settle() {
        let c = Arc::new(cache(100, 60_000));

        let v = c
            .get_or_fetch("k", None, || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(v, json!(1));
        assert!(c.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_fetch_hit_skips_fetcher() {
        let c = cache(10, 60_000);
        c.set("k", json!("cached"), None);

        let result = c
            .get_or_fetch("k", None, || async {
                panic!("fetcher must not run on a hit");
            })
            .await
            .unwrap();
        assert_eq!(result, json!("cached"));
        assert_eq!(c.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired() {
        let c = Arc::new(RequestCache::new(CacheConfig {
            max_entries: 10,
            default_ttl_ms: 30,
            cleanup_interval_ms: 25,
            enable_coalescing: true,
            cacheable_methods: Vec::new(),
        }));

        c.set("k", json!("v"), None);
        assert_eq!(c.len(), 1);

        let sweeper = c.clone().start_cleanup();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Removed from the map itself, not merely hidden by the lazy check
        assert_eq!(c.len(), 0);
        assert!(c.stats().expired_removed >= 1);
        sweeper.abort();
    }
}
