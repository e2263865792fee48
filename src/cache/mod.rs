// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory record cache.
//!
//! Bounded by entry count and by aggregate payload bytes. When either limit
//! is exceeded a batch of least recently used entries is evicted (a fraction
//! of the entry capacity, at least one) until both limits hold again.
//!
//! Lookups never touch disk. A capacity of 0 disables the cache entirely.

pub mod lru;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::record::{OwnerId, Record, RecordKey};
use lru::LruList;

/// A cached record with its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Record,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct CacheInner {
    lru: LruList<RecordKey, CacheEntry>,
    by_owner: HashMap<OwnerId, HashSet<RecordKey>>,
    bytes: usize,
}

impl CacheInner {
    fn forget(&mut self, key: &RecordKey, entry: &CacheEntry) {
        self.bytes = self.bytes.saturating_sub(entry.record.size_bytes());
        if let Some(keys) = self.by_owner.get_mut(key.owner()) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_owner.remove(key.owner());
            }
        }
    }

    fn remove(&mut self, key: &RecordKey) -> bool {
        match self.lru.remove(key) {
            Some(entry) => {
                self.forget(key, &entry);
                true
            }
            None => false,
        }
    }
}

pub struct MemoryCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    max_bytes: usize,
    eviction_batch: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_bytes: usize, eviction_fraction: f64) -> Self {
        let batch = ((max_entries as f64) * eviction_fraction).ceil() as usize;
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries,
            max_bytes,
            eviction_batch: batch.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A cache that stores nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, 0, 0.1)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0 && self.max_bytes > 0
    }

    /// Fresh record for `key`; expired entries are dropped on the way.
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        if !self.is_enabled() {
            return None;
        }
        let mut inner = self.inner.lock();
        let expired = match inner.lru.peek(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => Instant::now() >= entry.expires_at,
        };
        if expired {
            inner.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.lru.get(key).map(|e| e.record.clone())
    }

    /// Insert or refresh, then evict down to both limits.
    pub fn put(&self, key: RecordKey, record: Record, ttl: Duration) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        let entry = CacheEntry {
            expires_at: Instant::now() + ttl,
            record,
        };
        inner.bytes += entry.record.size_bytes();
        inner
            .by_owner
            .entry(key.owner().clone())
            .or_default()
            .insert(key.clone());
        if let Some(old) = inner.lru.insert(key, entry) {
            inner.bytes = inner.bytes.saturating_sub(old.record.size_bytes());
        }

        let mut evicted = 0usize;
        let mut evicted_bytes = 0usize;
        while inner.lru.len() > self.max_entries || inner.bytes > self.max_bytes {
            for _ in 0..self.eviction_batch {
                let Some((k, e)) = inner.lru.pop_lru() else {
                    break;
                };
                evicted_bytes += e.record.size_bytes();
                inner.forget(&k, &e);
                evicted += 1;
            }
            if inner.lru.is_empty() {
                break;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, evicted_bytes, "Cache eviction batch");
            crate::metrics::record_eviction(evicted, evicted_bytes);
        }
        crate::metrics::set_cache_entries(inner.lru.len());
        crate::metrics::set_cache_bytes(inner.bytes);
    }

    pub fn invalidate(&self, key: &RecordKey) {
        self.inner.lock().remove(key);
    }

    /// Drop every entry of `owner`. O(entries of that owner).
    pub fn invalidate_owner(&self, owner: &OwnerId) -> usize {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.by_owner.remove(owner) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = inner.lru.remove(&key) {
                inner.bytes = inner.bytes.saturating_sub(entry.record.size_bytes());
                removed += 1;
            }
        }
        debug!(owner = %owner, removed, "Cache invalidated for owner");
        crate::metrics::set_cache_entries(inner.lru.len());
        crate::metrics::set_cache_bytes(inner.bytes);
        removed
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.lru.len(),
            bytes: inner.bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Whether `key` is cached, without touching recency or stats.
    #[must_use]
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.inner.lock().lru.contains(key)
    }
}
