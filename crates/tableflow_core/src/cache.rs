//! Bounded key/value cache with per-entry TTL and pluggable eviction.
//!
//! Expired entries are logically absent even while still stored: `get` and
//! `has` treat them as misses and `get` deletes them on sight. An optional
//! background sweeper purges expired entries on a fixed interval so a burst of
//! expired keys does not pile up between reads.
//!
//! Eviction order is decided by a logical clock bumped on every insert and
//! read, so two operations that land on the same wall-clock instant still have
//! a well-defined order. The only remaining ties are equal access counts under
//! LFU; those break by insertion order, oldest first.

use crate::error::CacheError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Policy used to choose the entry removed when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Evict the entry read or written least recently
    #[default]
    Lru,
    /// Evict the entry read the fewest times
    Lfu,
    /// Evict the oldest entry
    Fifo,
}

/// Construction settings for a [`CacheManager`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries; `0` means unbounded
    pub max_size: usize,
    /// TTL applied when `set` is given none; zero means entries never expire
    pub default_ttl: Duration,
    pub strategy: EvictionStrategy,
    /// Interval of the background sweep started by `start_sweeper`
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            default_ttl: Duration::ZERO,
            strategy: EvictionStrategy::Lru,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-call options for `set` and `get_or_set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Overrides the default TTL; `Some(Duration::ZERO)` stores without expiry
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Hit/miss accounting snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
    access_count: u64,
    /// Logical time of insertion; the tie-break for every strategy
    inserted: u64,
    /// Logical time of creation (reset when the key is overwritten)
    created: u64,
    /// Logical time of the last read or write
    last_access: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Chooses the eviction victim by a linear scan.
    fn victim(&self, strategy: EvictionStrategy) -> Option<K> {
        let rank = |entry: &CacheEntry<V>| match strategy {
            EvictionStrategy::Lru => (entry.last_access, entry.inserted),
            EvictionStrategy::Lfu => (entry.access_count, entry.inserted),
            EvictionStrategy::Fifo => (entry.created, entry.inserted),
        };
        self.entries
            .iter()
            .min_by_key(|(_, entry)| rank(entry))
            .map(|(key, _)| key.clone())
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - self.entries.len();
        self.expirations += purged as u64;
        purged
    }
}

type InFlightFuture<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

struct InFlight<V> {
    id: u64,
    future: InFlightFuture<V>,
}

struct CacheInner<K, V> {
    config: CacheConfig,
    state: Mutex<CacheState<K, V>>,
    in_flight: Mutex<HashMap<K, InFlight<V>>>,
    next_flight: Mutex<u64>,
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.entries.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        let tick = state.tick();
        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = tick;
        Some(entry.value.clone())
    }

    fn set(&self, key: K, value: V, options: SetOptions) {
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let now = Instant::now();
        let expires_at = if ttl.is_zero() { None } else { Some(now + ttl) };

        let mut state = self.state.lock();
        let tick = state.tick();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            entry.created = tick;
            entry.last_access = tick;
            return;
        }

        if self.config.max_size > 0 && state.entries.len() >= self.config.max_size {
            if let Some(victim) = state.victim(self.config.strategy) {
                state.entries.remove(&victim);
                state.evictions += 1;
                trace!(strategy = ?self.config.strategy, "Evicted cache entry");
            }
        }

        state.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                access_count: 0,
                inserted: tick,
                created: tick,
                last_access: tick,
            },
        );
    }
}

/// Generic TTL cache with LRU / LFU / FIFO eviction.
///
/// Cheap to share behind an `Arc`. All operations are synchronous except
/// [`CacheManager::get_or_set`], which awaits the value producer.
pub struct CacheManager<K, V> {
    inner: Arc<CacheInner<K, V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> CacheManager<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    clock: 0,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    expirations: 0,
                }),
                in_flight: Mutex::new(HashMap::new()),
                next_flight: Mutex::new(0),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Stores a value, evicting one entry first if a new key would exceed
    /// capacity.
    pub fn set(&self, key: K, value: V, options: SetOptions) {
        self.inner.set(key, value, options);
    }

    /// Returns the value, or `None` when absent or expired. Expired entries
    /// are deleted here.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn has(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    pub fn delete(&self, key: &K) -> bool {
        self.inner.state.lock().entries.remove(key).is_some()
    }

    /// Removes every entry and resets hit/miss counters.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
        state.expirations = 0;
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.state.lock().purge_expired(Instant::now())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            size: state.entries.len(),
            max_size: self.inner.config.max_size,
        }
    }

    /// Returns the cached value or runs `producer`, stores its result and
    /// returns it.
    ///
    /// Concurrent callers for the same missing key share a single producer
    /// run; the first caller's producer is used and the rest await it. A
    /// failed producer stores nothing and every waiter receives the error.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: K,
        producer: F,
        options: SetOptions,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let (id, future) = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(flight) => {
                    trace!("Joining in-flight cache producer");
                    (flight.id, flight.future.clone())
                }
                None => {
                    let id = {
                        let mut next = self.inner.next_flight.lock();
                        *next += 1;
                        *next
                    };
                    let produce = producer();
                    let future = async move {
                        produce
                            .await
                            .map_err(|e| CacheError::ProducerFailed(e.to_string()))
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(
                        key.clone(),
                        InFlight {
                            id,
                            future: future.clone(),
                        },
                    );
                    (id, future)
                }
            }
        };

        let result = future.await;

        // Whichever waiter finishes first retires the flight and stores the value.
        let retired = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(flight) if flight.id == id => {
                    in_flight.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if retired {
            if let Ok(value) = &result {
                self.inner.set(key, value.clone(), options);
            }
        }

        result
    }

    /// Starts the periodic expiry sweep. Calling it again restarts the task.
    /// Must be called from within a tokio runtime.
    pub fn start_sweeper(&self) {
        let weak: Weak<CacheInner<K, V>> = Arc::downgrade(&self.inner);
        // tokio rejects a zero period
        let interval = self.inner.config.sweep_interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let purged = inner.state.lock().purge_expired(Instant::now());
                if purged > 0 {
                    debug!(purged, "Cache sweep removed expired entries");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the background sweep. Returns `false` if none was running.
    pub fn stop_sweeper(&self) -> bool {
        match self.sweeper.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl<K, V> Drop for CacheManager<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl<K, V> std::fmt::Debug for CacheManager<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.inner.config)
            .field("size", &self.inner.state.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(max_size: usize, strategy: EvictionStrategy) -> CacheManager<&'static str, u32> {
        CacheManager::new(CacheConfig {
            max_size,
            strategy,
            ..CacheConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_records_miss() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("k", 1, SetOptions::ttl(Duration::from_millis(10)));
        assert_eq!(cache.get(&"k"), Some(1));

        tokio::time::advance(Duration::from_millis(11)).await;

        assert!(!cache.has(&"k"));
        assert_eq!(cache.get(&"k"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let cache = CacheManager::new(CacheConfig {
            default_ttl: Duration::from_millis(5),
            ..CacheConfig::default()
        });
        cache.set("forever", 1u32, SetOptions::ttl(Duration::ZERO));
        cache.set("default", 2u32, SetOptions::default());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.get(&"forever"), Some(1));
        assert_eq!(cache.get(&"default"), None);
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = cache(2, EvictionStrategy::Lru);
        cache.set("a", 1, SetOptions::default());
        cache.set("b", 2, SetOptions::default());
        assert_eq!(cache.get(&"a"), Some(1));
        cache.set("c", 3, SetOptions::default());

        assert!(!cache.has(&"b"));
        assert!(cache.has(&"a"));
        assert!(cache.has(&"c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_evicts_least_frequently_used() {
        let cache = cache(2, EvictionStrategy::Lfu);
        cache.set("a", 1, SetOptions::default());
        cache.set("b", 2, SetOptions::default());
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"b");
        cache.set("c", 3, SetOptions::default());

        assert!(cache.has(&"a"));
        assert!(!cache.has(&"b"));
        assert!(cache.has(&"c"));
    }

    #[test]
    fn test_lfu_ties_break_by_insertion_order() {
        let cache = cache(3, EvictionStrategy::Lfu);
        cache.set("a", 1, SetOptions::default());
        cache.set("b", 2, SetOptions::default());
        cache.set("c", 3, SetOptions::default());
        // No reads: every entry has access count 0, oldest insertion goes first
        cache.set("d", 4, SetOptions::default());

        assert!(!cache.has(&"a"));
        assert!(cache.has(&"b"));
        assert!(cache.has(&"c"));
        assert!(cache.has(&"d"));
    }

    #[test]
    fn test_fifo_ignores_reads() {
        let cache = cache(2, EvictionStrategy::Fifo);
        cache.set("a", 1, SetOptions::default());
        cache.set("b", 2, SetOptions::default());
        cache.get(&"a");
        cache.get(&"a");
        cache.set("c", 3, SetOptions::default());

        assert!(!cache.has(&"a"));
        assert!(cache.has(&"b"));
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let cache = cache(2, EvictionStrategy::Lru);
        cache.set("a", 1, SetOptions::default());
        cache.set("b", 2, SetOptions::default());
        cache.set("a", 10, SetOptions::default());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_size_never_exceeds_maximum() {
        let cache: CacheManager<u32, u32> = CacheManager::new(CacheConfig {
            max_size: 8,
            ..CacheConfig::default()
        });
        for i in 0..100 {
            cache.set(i, i, SetOptions::default());
            assert!(cache.len() <= 8);
        }
        assert_eq!(cache.stats().evictions, 92);
    }

    #[test]
    fn test_clear_resets_counters() {
        let cache = cache(4, EvictionStrategy::Lru);
        cache.set("a", 1, SetOptions::default());
        cache.get(&"a");
        cache.get(&"missing");
        cache.clear();

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (0, 0, 0));
        assert!(!cache.delete(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let cache = CacheManager::new(CacheConfig {
            sweep_interval: Duration::from_millis(100),
            ..CacheConfig::default()
        });
        cache.set("short", 1u32, SetOptions::ttl(Duration::from_millis(50)));
        cache.set("long", 2u32, SetOptions::ttl(Duration::from_secs(10)));
        cache.start_sweeper();
        assert!(cache.is_sweeping());

        tokio::time::sleep(Duration::from_millis(250)).await;

        // Swept without any read touching the key
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.stop_sweeper());
        assert!(!cache.stop_sweeper());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_survives_zero_interval() {
        let cache = CacheManager::new(CacheConfig {
            sweep_interval: Duration::ZERO,
            ..CacheConfig::default()
        });
        cache.set("short", 1u32, SetOptions::ttl(Duration::from_millis(20)));
        cache.start_sweeper();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_sweeping());
        assert_eq!(cache.len(), 0);
        assert!(cache.stop_sweeper());
    }

    #[tokio::test]
    async fn test_get_or_set_caches_result() {
        let cache = cache(4, EvictionStrategy::Lru);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = cache
                .get_or_set(
                    "answer",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(42)
                    },
                    SetOptions::default(),
                )
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_set_shares_in_flight_producer() {
        let cache = Arc::new(cache(4, EvictionStrategy::Lru));
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>(7)
            }
        };

        let (a, b) = tokio::join!(
            cache.get_or_set("slow", make(calls.clone()), SetOptions::default()),
            cache.get_or_set("slow", make(calls.clone()), SetOptions::default()),
        );

        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"slow"), Some(7));
    }

    #[tokio::test]
    async fn test_get_or_set_producer_failure_stores_nothing() {
        let cache = cache(4, EvictionStrategy::Lru);
        let result = cache
            .get_or_set(
                "broken",
                || async { Err::<u32, _>("backend unavailable") },
                SetOptions::default(),
            )
            .await;

        assert_eq!(
            result,
            Err(CacheError::ProducerFailed("backend unavailable".to_string()))
        );
        assert!(!cache.has(&"broken"));

        // The failed flight is retired; a later call runs a fresh producer
        let value = cache
            .get_or_set("broken", || async { Ok::<_, String>(1) }, SetOptions::default())
            .await;
        assert_eq!(value, Ok(1));
    }
}
