//! Bounded, time-expiring response store.

use bytes::Bytes;
use lru::LruCache;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::key::CacheKey;
use crate::stats::{CacheStats, StatsCounters};

/// A stored value with its expiry bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    value: Bytes,
    created_at: Instant,
    ttl: Duration,
    touched: u64,
}

impl CacheEntry {
    pub fn new(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
            touched: 0,
        }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expired at and after `created_at + ttl`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// The cache contract the gateway is written against.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Fresh value for `key`. An expired entry is removed and reported as a miss.
    fn get(&self, key: &CacheKey) -> Option<Bytes>;

    /// Store `value` for `ttl`. A zero TTL stores nothing and drops any
    /// previous entry for the key.
    fn put(&self, key: CacheKey, value: Bytes, ttl: Duration);

    /// Remove one entry. Returns whether it existed.
    fn invalidate(&self, key: &CacheKey) -> bool;

    /// Remove every entry whose key starts with `prefix`. Returns how many.
    fn invalidate_prefix(&self, prefix: &str) -> usize;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> CacheStats;
}

type Shard = Mutex<LruCache<CacheKey, CacheEntry>>;

/// LRU cache with per-entry TTL, sharded for lock contention only.
///
/// Keys hash to one of `shards` LRU lists, each behind its own lock. Capacity
/// and recency are global: every access stamps the entry from one shared
/// clock, and an insert past `capacity` evicts the entry with the oldest
/// stamp across all shards.
pub struct TtlCache {
    shards: Box<[Shard]>,
    hasher: RandomState,
    capacity: usize,
    default_ttl: Duration,
    /// Entries held across all shards; changed only under a shard lock.
    held: AtomicUsize,
    clock: AtomicU64,
    evicting: Mutex<()>,
    stats: StatsCounters,
}

impl TtlCache {
    /// `shards` is clamped to `1..=capacity`; `capacity` to at least one.
    pub fn new(capacity: usize, shards: usize, default_ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let shard_count = shards.clamp(1, capacity);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect();

        Self {
            shards,
            hasher: RandomState::new(),
            capacity,
            default_ttl,
            held: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            evicting: Mutex::new(()),
            stats: StatsCounters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn shard(&self, key: &CacheKey) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        let index = (self.hasher.hash_one(key) as usize) % self.shards.len();
        lock(&self.shards[index])
    }

    /// Next access stamp. Taken under the shard lock so each shard's LRU
    /// order matches stamp order.
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn forget(&self, count: usize) {
        if count > 0 {
            self.held.fetch_sub(count, Ordering::AcqRel);
        }
    }

    /// Evict globally least recently used entries until within capacity.
    fn shrink_to_capacity(&self) {
        if self.held.load(Ordering::Acquire) <= self.capacity {
            return;
        }
        let _evicting = lock(&self.evicting);
        while self.held.load(Ordering::Acquire) > self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Pop the entry with the oldest stamp across all shards.
    fn evict_oldest(&self) -> bool {
        loop {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(index, shard)| {
                    lock(shard).peek_lru().map(|(_, entry)| (index, entry.touched))
                })
                .min_by_key(|&(_, touched)| touched);
            let Some((index, touched)) = oldest else {
                return false;
            };

            let mut shard = lock(&self.shards[index]);
            if !shard
                .peek_lru()
                .is_some_and(|(_, entry)| entry.touched == touched)
            {
                // Touched or removed since the scan.
                continue;
            }
            if let Some((_, entry)) = shard.pop_lru() {
                self.forget(1);
                if entry.is_expired_at(Instant::now()) {
                    StatsCounters::bump(&self.stats.expirations, 1);
                } else {
                    StatsCounters::bump(&self.stats.evictions, 1);
                }
                return true;
            }
        }
    }

    /// Remove every expired entry now instead of waiting for a lookup.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let expired: Vec<CacheKey> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                shard.pop(key);
            }
            self.forget(expired.len());
            purged += expired.len();
        }
        StatsCounters::bump(&self.stats.expirations, purged as u64);
        purged
    }

    /// Periodically purge expired entries on the current tokio runtime.
    ///
    /// The task holds a weak reference and stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "swept expired cache entries");
                }
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CacheStore for TtlCache {
    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Instant::now();
        let mut shard = self.shard(key);

        let expired = match shard.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touched = self.tick();
                let value = entry.value.clone();
                StatsCounters::bump(&self.stats.hits, 1);
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired && shard.pop(key).is_some() {
            self.forget(1);
            StatsCounters::bump(&self.stats.expirations, 1);
        }
        StatsCounters::bump(&self.stats.misses, 1);
        None
    }

    fn put(&self, key: CacheKey, value: Bytes, ttl: Duration) {
        if ttl.is_zero() {
            self.invalidate(&key);
            return;
        }

        let mut entry = CacheEntry::new(value, ttl);
        {
            let mut shard = self.shard(&key);
            entry.touched = self.tick();
            // Unbounded shards only hand back the entry this one replaced.
            if shard.push(key, entry).is_none() {
                self.held.fetch_add(1, Ordering::AcqRel);
            }
        }
        StatsCounters::bump(&self.stats.inserts, 1);
        self.shrink_to_capacity();
    }

    fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.shard(key).pop(key).is_some();
        if removed {
            self.forget(1);
            StatsCounters::bump(&self.stats.invalidations, 1);
        }
        removed
    }

    fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let matching: Vec<CacheKey> = shard
                .iter()
                .filter(|(key, _)| key.has_prefix(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &matching {
                shard.pop(key);
            }
            self.forget(matching.len());
            removed += matching.len();
        }
        StatsCounters::bump(&self.stats.invalidations, removed as u64);
        removed
    }

    fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            self.forget(shard.len());
            shard.clear();
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.len())
    }
}

impl fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("capacity", &self.capacity)
            .field("shards", &self.shards.len())
            .field("held", &self.held.load(Ordering::Relaxed))
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

/// A cache that stores nothing. Every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl CacheStore for NoopCache {
    fn get(&self, _key: &CacheKey) -> Option<Bytes> {
        None
    }

    fn put(&self, _key: CacheKey, _value: Bytes, _ttl: Duration) {}

    fn invalidate(&self, _key: &CacheKey) -> bool {
        false
    }

    fn invalidate_prefix(&self, _prefix: &str) -> usize {
        0
    }

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}
