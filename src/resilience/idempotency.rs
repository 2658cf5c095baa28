//! Idempotency cache for write operations.
//!
//! Completed results are stored under the caller's idempotency key and
//! replayed for repeated calls until they expire. Only successful results
//! are stored. Without `strict_in_flight`, two racing calls with the same
//! key may both execute; only completed results are deduplicated.

use crate::observability::MetricsCollector;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for the idempotency cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// How long a stored result is replayed
    pub ttl: Duration,
    /// Maximum stored entries
    pub max_entries: usize,
    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
    /// Serialize racing calls that share a key
    pub strict_in_flight: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(crate::DEFAULT_IDEMPOTENCY_TTL_MS),
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(300),
            strict_in_flight: false,
        }
    }
}

impl IdempotencyConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the maximum entry count; a cache always holds at least one entry
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n.max(1);
        self
    }

    /// Set the sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Enable per-key in-flight locking
    pub fn strict_in_flight(mut self, strict: bool) -> Self {
        self.strict_in_flight = strict;
        self
    }
}

/// A stored result
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyEntry {
    /// Result of the first execution
    pub result: Value,
    /// Operation that produced it
    pub operation_name: String,
    /// Request id of the first execution
    pub request_id: String,
    /// When the entry was stored
    pub created_at: Instant,
    /// When the entry stops being replayed
    pub expires_at: Instant,
}

impl IdempotencyEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Result of [`IdempotencyCache::with_idempotency`]
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentOutcome {
    /// Operation result
    pub result: Value,
    /// Request id of the execution that produced `result`
    pub request_id: String,
    /// Whether `result` was replayed from the cache
    pub cached: bool,
}

type InFlightMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Holds the per-key lock for one strict execution and drops the map
/// slot once nobody else is waiting on it
struct InFlightSlot<'a> {
    map: &'a InFlightMap,
    key: &'a str,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.map.lock();
        // One reference in the map, one here
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(self.key);
        }
    }
}

/// Idempotency cache
pub struct IdempotencyCache {
    config: IdempotencyConfig,
    entries: Mutex<HashMap<String, IdempotencyEntry>>,
    in_flight: InFlightMap,
    metrics: Arc<MetricsCollector>,
}

impl IdempotencyCache {
    /// Create a cache with default configuration
    pub fn new() -> Self {
        Self::with_config(IdempotencyConfig::default())
    }

    /// Create a cache with custom configuration
    pub fn with_config(config: IdempotencyConfig) -> Self {
        Self::with_metrics(config, Arc::new(MetricsCollector::new()))
    }

    /// Create a cache reporting into a shared metrics collector
    pub fn with_metrics(config: IdempotencyConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Cache configuration
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Run `execute` at most once per live key.
    ///
    /// With no key a fresh request id is generated and nothing is stored, so
    /// the call is never deduplicated. Errors are returned as-is and never
    /// cached.
    pub async fn with_idempotency<F, Fut, E>(
        &self,
        key: Option<&str>,
        operation_name: &str,
        execute: F,
    ) -> Result<IdempotentOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        self.run_keyed(key, operation_name, None::<(&CancellationToken, fn() -> E)>, execute)
            .await
    }

    /// Like [`with_idempotency`](Self::with_idempotency), but a strict-mode
    /// wait for another caller's in-flight execution ends with `on_cancel()`
    /// as soon as `token` is cancelled.
    pub async fn with_idempotency_cancellable<F, Fut, E, C>(
        &self,
        key: Option<&str>,
        operation_name: &str,
        token: &CancellationToken,
        on_cancel: C,
        execute: F,
    ) -> Result<IdempotentOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        C: FnOnce() -> E,
    {
        self.run_keyed(key, operation_name, Some((token, on_cancel)), execute)
            .await
    }

    async fn run_keyed<F, Fut, E, C>(
        &self,
        key: Option<&str>,
        operation_name: &str,
        cancel: Option<(&CancellationToken, C)>,
        execute: F,
    ) -> Result<IdempotentOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        C: FnOnce() -> E,
    {
        let Some(key) = key else {
            let result = execute().await?;
            return Ok(IdempotentOutcome {
                result,
                request_id: new_request_id(),
                cached: false,
            });
        };

        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        let _slot = if self.config.strict_in_flight {
            let slot = match cancel {
                Some((token, on_cancel)) => {
                    tokio::select! {
                        biased;
                        slot = self.acquire_in_flight(key) => slot,
                        _ = token.cancelled() => {
                            debug!(key, operation = operation_name, "Cancelled while waiting for in-flight execution");
                            return Err(on_cancel());
                        }
                    }
                }
                None => self.acquire_in_flight(key).await,
            };
            // The first holder may have finished while we waited
            if let Some(entry) = self.get(key) {
                debug!(key, operation = operation_name, "Idempotent result stored while waiting");
                self.metrics.record_cache_lookup(true);
                return Ok(replay(entry));
            }
            Some(slot)
        } else {
            None
        };

        let result = execute().await?;
        let request_id = new_request_id();
        self.store(key, operation_name, &request_id, result.clone());

        Ok(IdempotentOutcome {
            result,
            request_id,
            cached: false,
        })
    }

    fn lookup(&self, key: &str) -> Option<IdempotentOutcome> {
        let now = Instant::now();
        let hit = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => Some(entry.clone()),
                Some(_) => {
                    entries.remove(key);
                    None
                }
                None => None,
            }
        };

        self.metrics.record_cache_lookup(hit.is_some());
        match hit {
            Some(entry) => {
                debug!(
                    key,
                    operation = %entry.operation_name,
                    request_id = %entry.request_id,
                    "Returning cached idempotent result"
                );
                Some(replay(entry))
            }
            None => None,
        }
    }

    async fn acquire_in_flight<'a>(&'a self, key: &'a str) -> InFlightSlot<'a> {
        let lock = self
            .in_flight
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        InFlightSlot {
            map: &self.in_flight,
            key,
            lock,
            guard: Some(guard),
        }
    }

    fn store(&self, key: &str, operation_name: &str, request_id: &str, result: Value) {
        let now = Instant::now();
        let evicted = {
            let mut entries = self.entries.lock();

            if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
                // A racing call stored first; entries are never replaced while live
                return;
            }
            entries.remove(key);

            let evicted = if entries.len() >= self.config.max_entries.max(1) {
                evict_oldest(&mut entries)
            } else {
                0
            };

            entries.insert(
                key.to_string(),
                IdempotencyEntry {
                    result,
                    operation_name: operation_name.to_string(),
                    request_id: request_id.to_string(),
                    created_at: now,
                    expires_at: now + self.config.ttl,
                },
            );
            evicted
        };

        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            info!(evicted, max_entries = self.config.max_entries, "Idempotency cache full, evicted oldest entries");
        }
    }

    /// Live entry for a key
    pub fn get(&self, key: &str) -> Option<IdempotencyEntry> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .cloned()
    }

    /// Remove one entry; returns whether it existed
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every expired entry; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            before - entries.len()
        };

        if removed > 0 {
            self.metrics.record_expirations(removed);
            info!(removed, "Swept expired idempotency entries");
        }
        removed
    }

    /// Spawn the periodic expiry sweep.
    ///
    /// The task holds only a weak reference and ends once the cache is dropped.
    pub fn spawn_sweeper(cache: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(cache);
        let period = cache.config.sweep_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    debug!("Idempotency cache dropped, stopping sweeper");
                    break;
                };
                cache.sweep_expired();
            }
        })
    }
}

/// Remove the oldest tenth of the entries (at least one)
fn evict_oldest(entries: &mut HashMap<String, IdempotencyEntry>) -> usize {
    let count = (entries.len() / 10).max(1);
    let mut by_age: Vec<(Instant, String)> = entries
        .iter()
        .map(|(key, entry)| (entry.created_at, key.clone()))
        .collect();
    by_age.sort();

    by_age
        .into_iter()
        .take(count)
        .filter(|(_, key)| entries.remove(key).is_some())
        .count()
}

fn replay(entry: IdempotencyEntry) -> IdempotentOutcome {
    IdempotentOutcome {
        result: entry.result,
        request_id: entry.request_id,
        cached: true,
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdempotencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyCache")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn run(cache: &IdempotencyCache, key: Option<&str>, value: Value) -> IdempotentOutcome {
        cache
            .with_idempotency(key, "campaigns.create", || async move {
                Ok::<_, String>(value)
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_is_never_stored() {
        let cache = IdempotencyCache::new();

        let first = run(&cache, None, json!({"id": "1"})).await;
        let second = run(&cache, None, json!({"id": "2"})).await;

        assert!(!first.cached && !second.cached);
        assert_ne!(first.request_id, second.request_id);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_keeps_request_id() {
        let cache = IdempotencyCache::new();

        let first = run(&cache, Some("k"), json!({"id": "1"})).await;
        let second = run(&cache, Some("k"), json!({"id": "2"})).await;

        assert!(second.cached);
        assert_eq!(second.result, json!({"id": "1"}));
        assert_eq!(second.request_id, first.request_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_cached() {
        let cache = IdempotencyCache::new();
        let calls = AtomicU32::new(0);

        let failed: Result<IdempotentOutcome, &str> = cache
            .with_idempotency(Some("k"), "ads.create", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom")
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.get("k").is_none());

        let ok = run(&cache, Some("k"), json!(1)).await;
        assert!(!ok.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_removes_oldest_tenth() {
        let cache = IdempotencyCache::with_config(IdempotencyConfig::new().max_entries(20));

        for i in 0..20 {
            run(&cache, Some(&format!("k{}", i)), json!(i)).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 20);

        run(&cache, Some("k20"), json!(20)).await;

        assert_eq!(cache.len(), 19);
        assert!(cache.get("k0").is_none());
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
        assert!(cache.get("k20").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = IdempotencyCache::with_config(
            IdempotencyConfig::new().ttl(Duration::from_secs(60)),
        );

        run(&cache, Some("old"), json!(1)).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        run(&cache, Some("new"), json!(2)).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let cache = Arc::new(IdempotencyCache::with_config(
            IdempotencyConfig::new()
                .ttl(Duration::from_secs(60))
                .sweep_interval(Duration::from_secs(300)),
        ));
        let sweeper = IdempotencyCache::spawn_sweeper(&cache);

        run(&cache, Some("k"), json!(1)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(cache.len(), 0);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear() {
        let cache = IdempotencyCache::new();
        run(&cache, Some("a"), json!(1)).await;
        run(&cache, Some("b"), json!(2)).await;

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_mode_runs_racing_calls_once() {
        let cache = Arc::new(IdempotencyCache::with_config(
            IdempotencyConfig::new().strict_in_flight(true),
        ));
        let calls = Arc::new(AtomicU32::new(0));

        let task = |cache: Arc<IdempotencyCache>, calls: Arc<AtomicU32>| async move {
            cache
                .with_idempotency(Some("k"), "campaigns.create", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(json!({"id": "c1"}))
                })
                .await
                .unwrap()
        };

        let (a, b) = tokio::join!(
            task(cache.clone(), calls.clone()),
            task(cache.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.result, b.result);
        assert!(a.cached != b.cached);
        assert!(cache.in_flight.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_weak_mode_allows_racing_duplicates() {
        let cache = Arc::new(IdempotencyCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let task = |cache: Arc<IdempotencyCache>, calls: Arc<AtomicU32>| async move {
            cache
                .with_idempotency(Some("k"), "campaigns.create", || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(json!(n))
                })
                .await
                .unwrap()
        };

        let (a, b) = tokio::join!(
            task(cache.clone(), calls.clone()),
            task(cache.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!a.cached && !b.cached);
        // First completed result wins; later calls replay it
        let stored = cache.get("k").unwrap();
        assert_eq!(run(&cache, Some("k"), json!("x")).await.result, stored.result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_holds_one_entry() {
        let cache = IdempotencyCache::with_config(IdempotencyConfig::new().max_entries(0));
        assert_eq!(cache.config().max_entries, 1);

        run(&cache, Some("k0"), json!(0)).await;
        assert_eq!(cache.metrics.snapshot().cache_evictions, 0);

        run(&cache, Some("k1"), json!(1)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.get("k1").is_some());
        assert_eq!(cache.metrics.snapshot().cache_evictions, 1);
    }

    #[test]
    fn test_evict_oldest_counts_removed_entries() {
        let mut entries = HashMap::new();
        assert_eq!(evict_oldest(&mut entries), 0);

        let now = Instant::now();
        for i in 0..25 {
            entries.insert(
                format!("k{}", i),
                IdempotencyEntry {
                    result: json!(i),
                    operation_name: "ads.create".to_string(),
                    request_id: format!("r{}", i),
                    created_at: now + Duration::from_millis(i),
                    expires_at: now + Duration::from_secs(60),
                },
            );
        }
        assert_eq!(evict_oldest(&mut entries), 2);
        assert_eq!(entries.len(), 23);
        assert!(!entries.contains_key("k0"));
        assert!(!entries.contains_key("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_waiter_stops_on_cancellation() {
        let cache = Arc::new(IdempotencyCache::with_config(
            IdempotencyConfig::new().strict_in_flight(true),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let holder = {
            let (cache, calls) = (cache.clone(), calls.clone());
            tokio::spawn(async move {
                cache
                    .with_idempotency(Some("k"), "campaigns.create", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok::<_, String>(json!({"id": "c1"}))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let waiter = cache
            .with_idempotency_cancellable(
                Some("k"),
                "campaigns.create",
                &token,
                || "cancelled".to_string(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(json!({"id": "c2"}))
                },
            )
            .await;

        assert_eq!(waiter.unwrap_err(), "cancelled");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let held = holder.await.unwrap().unwrap();
        assert_eq!(held.result, json!({"id": "c1"}));
        assert!(cache.in_flight.lock().is_empty());
    }
}
