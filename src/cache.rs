//! Cache Registry: a TTL- and size-bounded key/value store shared by every
//! connection task.
//!
//! Two tiers back the registry. The hot tier is a sharded `DashMap`; its
//! entry API gives the at-most-once `compute-if-absent` primitive because the
//! shard stays write-locked while the value is computed. The optional cold
//! tier is a larger LRU behind a single lock, holding long-lived mappings
//! (fake-endpoint hashes) after the hot tier has evicted them.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            expires_at: now + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub computed: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn computed(&self) {
        self.computed.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self, n: usize) {
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// A full hot tier evicts down to `capacity - capacity / 8`.
const EVICTION_BATCH_DIVISOR: usize = 8;

/// Hot tier.
pub struct MemoryStore<K, V> {
    map: DashMap<K, Entry<V>>,
    capacity: usize,
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn get_entry(&self, key: &K) -> Option<(V, Duration)> {
        let now = Instant::now();
        if let Some(entry) = self.map.get(key) {
            if !entry.is_expired(now) {
                return Some((entry.value.clone(), entry.remaining(now)));
            }
        } else {
            return None;
        }
        self.map.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_entry(key).map(|(v, _)| v)
    }

    /// Returns the live value, or runs `compute` exactly once under the
    /// shard lock. The flag is true when `compute` ran.
    ///
    /// `compute` must not touch this store.
    pub fn get_or_insert_with<F>(&self, key: K, compute: F, ttl: Duration) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        let now = Instant::now();
        let result = match self.map.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let value = compute();
                    occupied.insert(Entry::new(value.clone(), ttl));
                    (value, true)
                } else {
                    (occupied.get().value.clone(), false)
                }
            }
            MapEntry::Vacant(vacant) => {
                let value = compute();
                vacant.insert(Entry::new(value.clone(), ttl));
                (value, true)
            }
        };
        if result.1 {
            self.enforce_capacity();
        }
        result
    }

    pub fn put(&self, key: K, value: V, ttl: Duration) {
        self.map.insert(key, Entry::new(value, ttl));
        self.enforce_capacity();
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, e)| e.value)
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.map.len())
    }

    /// Drops expired entries first, then the oldest live ones down to the
    /// low-water mark, so a full store does not rescan on every insert.
    fn enforce_capacity(&self) -> usize {
        if self.map.len() <= self.capacity {
            return 0;
        }
        let mut evicted = self.purge_expired();
        let target = self.capacity - self.capacity / EVICTION_BATCH_DIVISOR;
        let excess = self.map.len().saturating_sub(target);
        if excess == 0 {
            return evicted;
        }

        let mut ages: Vec<(Instant, K)> = self
            .map
            .iter()
            .map(|e| (e.value().inserted_at, e.key().clone()))
            .collect();
        if excess < ages.len() {
            ages.select_nth_unstable_by_key(excess, |(at, _)| *at);
            ages.truncate(excess);
        }
        for (_, key) in ages {
            if self.map.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

/// Cold tier: larger, slower, single lock.
pub struct LruStore<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
}

impl<K, V> LruStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn get_entry(&self, key: &K) -> Option<(V, Duration)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let found = inner
            .get(key)
            .map(|e| (e.is_expired(now), e.value.clone(), e.remaining(now)));
        match found {
            Some((false, value, remaining)) => Some((value, remaining)),
            Some((true, ..)) => {
                inner.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_entry(key).map(|(v, _)| v)
    }

    pub fn put(&self, key: K, value: V, ttl: Duration) {
        self.inner.lock().put(key, Entry::new(value, ttl));
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key).map(|e| e.value)
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<K> = inner
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }
}

/// Sizing for one registry.
#[derive(Debug, Clone)]
pub struct RegistryPolicy {
    pub hot_capacity: usize,
    pub default_ttl: Duration,
    /// `None` disables the cold tier.
    pub cold_capacity: Option<usize>,
    pub cold_ttl: Duration,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            hot_capacity: 4096,
            default_ttl: Duration::from_secs(120),
            cold_capacity: None,
            cold_ttl: Duration::from_secs(3600),
        }
    }
}

/// Outcome of [`CacheRegistry::entry_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Computed<V> {
    pub value: V,
    /// True only for the caller whose closure produced `value`.
    pub inserted: bool,
}

pub struct CacheRegistry<K: Hash + Eq, V> {
    name: &'static str,
    hot: MemoryStore<K, V>,
    cold: Option<LruStore<K, V>>,
    policy: RegistryPolicy,
    stats: CacheStats,
}

impl<K, V> CacheRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, policy: RegistryPolicy) -> Self {
        Self {
            name,
            hot: MemoryStore::new(policy.hot_capacity),
            cold: policy.cold_capacity.map(LruStore::new),
            policy,
            stats: CacheStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.hot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
    }

    /// Hot tier first, then the cold tier. Cold hits are promoted.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(value) = self.hot.get(key) {
            self.stats.hit();
            return Some(value);
        }
        if let Some((value, remaining)) = self.cold.as_ref().and_then(|c| c.get_entry(key)) {
            self.stats.hit();
            let ttl = remaining.min(self.policy.default_ttl);
            self.hot.put(key.clone(), value.clone(), ttl);
            return Some(value);
        }
        self.stats.miss();
        None
    }

    pub fn get_with<F>(&self, key: K, compute: F, ttl: Duration) -> V
    where
        F: FnOnce() -> V,
    {
        self.entry_with(key, compute, ttl).value
    }

    /// Atomic compute-if-absent. Concurrent first accesses for one key run
    /// `compute` at most once; everyone observes the same value.
    pub fn entry_with<F>(&self, key: K, compute: F, ttl: Duration) -> Computed<V>
    where
        F: FnOnce() -> V,
    {
        let mut computed = false;
        let cold = self.cold.as_ref();
        let (value, inserted) = self.hot.get_or_insert_with(
            key.clone(),
            || match cold.and_then(|c| c.get(&key)) {
                Some(value) => value,
                None => {
                    computed = true;
                    compute()
                }
            },
            ttl,
        );

        if inserted && computed {
            self.stats.computed();
            if let Some(cold) = cold {
                cold.put(key, value.clone(), self.policy.cold_ttl.max(ttl));
            }
        } else {
            self.stats.hit();
        }

        Computed {
            value,
            inserted: inserted && computed,
        }
    }

    pub fn put(&self, key: K, value: V, ttl: Duration) {
        if let Some(cold) = &self.cold {
            cold.put(key.clone(), value.clone(), self.policy.cold_ttl.max(ttl));
        }
        self.hot.put(key, value, ttl);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let cold = self.cold.as_ref().and_then(|c| c.remove(key));
        self.hot.remove(key).or(cold)
    }

    pub fn purge_expired(&self) -> usize {
        let mut purged = self.hot.purge_expired();
        if let Some(cold) = &self.cold {
            purged += cold.purge_expired();
        }
        self.stats.evicted(purged);
        purged
    }

    /// Periodically purges expired entries; stops once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                let purged = registry.purge_expired();
                if purged > 0 {
                    debug!(cache = registry.name, purged, "purged expired entries");
                } else {
                    trace!(cache = registry.name, "sweep found nothing to purge");
                }
            }
        })
    }
}
