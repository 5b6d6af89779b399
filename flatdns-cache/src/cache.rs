use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use flatdns_core::model::{CacheEntry, QueryKey};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;

/// Bounded, TTL-aware, LRU-evicted answer cache (spec.md §4.1, C4).
///
/// `Get` never performs a full sweep — expired entries are removed lazily
/// on access, and a background/periodic `sweep()` call (throttled to at
/// most once per `cleanup_interval`) reclaims everything else. A small
/// fraction of `get()` calls additionally nudge a sweep to amortize work
/// under non-uniform access, per spec.md §4.1.
pub struct TtlCache {
    inner: Mutex<LruCache<QueryKey, CacheEntry>>,
    max_size: usize,
    cleanup_interval: Duration,
    last_sweep: Mutex<Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_removed: u64,
}

/// Probability that a single `get()` opportunistically triggers a sweep
/// attempt (still subject to the `cleanup_interval` throttle).
const SWEEP_SAMPLE_DENOMINATOR: u32 = 256;

impl TtlCache {
    pub fn new(max_size: usize, cleanup_interval: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("max_size >= 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            max_size,
            cleanup_interval,
            // Backdated so the first `sweep()` call after construction runs
            // immediately instead of waiting out a full interval.
            last_sweep: Mutex::new(Instant::now().checked_sub(cleanup_interval).unwrap_or_else(Instant::now)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &QueryKey, now: SystemTime) -> Option<CacheEntry> {
        if rand::thread_rng().gen_ratio(1, SWEEP_SAMPLE_DENOMINATOR) {
            self.sweep(now);
        }

        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let entry = entry.clone();
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                inner.pop(key);
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.expired_removed.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: QueryKey, entry: CacheEntry) {
        let mut inner = self.inner.lock();
        let will_evict = inner.len() >= self.max_size && !inner.contains(&key);
        inner.put(key, entry);
        if will_evict {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invalidate(&self, key: &QueryKey) {
        self.inner.lock().pop(key);
    }

    /// Remove every expired entry, throttled to at most once per
    /// `cleanup_interval`. Returns the number of entries removed, or `0`
    /// immediately if called before the interval has elapsed.
    pub fn sweep(&self, now: SystemTime) -> usize {
        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() < self.cleanup_interval {
                return 0;
            }
            *last = Instant::now();
        }

        let mut inner = self.inner.lock();
        let expired: Vec<QueryKey> = inner
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        drop(inner);
        self.expired_removed
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.inner.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
        }
    }
}
