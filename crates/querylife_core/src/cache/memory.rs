use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{CacheEntry, CacheKey, CacheReader, CacheWriter, EntryStore, QueryCache, WriterOptions};
use crate::config::SessionConfig;
use crate::txn::Timestamp;

/// Cache-wide ceilings, 0 for unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_size_in_bytes: u64,
    pub max_entries: u64,
}

impl CacheLimits {
    pub fn from_settings(settings: &SessionConfig) -> Self {
        CacheLimits {
            max_size_in_bytes: settings.query_cache_max_size_in_bytes,
            max_entries: settings.query_cache_max_entries,
        }
    }

    fn over(&self, num_entries: usize, num_bytes: u64) -> bool {
        (self.max_entries != 0 && num_entries as u64 > self.max_entries)
            || (self.max_size_in_bytes != 0 && num_bytes > self.max_size_in_bytes)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Entries in insertion order, oldest first.
    entries: IndexMap<CacheKey, Arc<CacheEntry>>,
    total_bytes: u64,
}

impl StoreInner {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(old) = self.entries.shift_remove(key) {
            self.total_bytes -= old.num_bytes;
        }
    }
}

#[derive(Debug)]
struct MemoryStore {
    limits: CacheLimits,
    inner: Mutex<StoreInner>,
}

impl EntryStore for MemoryStore {
    fn store(&self, key: CacheKey, entry: CacheEntry) -> bool {
        if self.limits.max_size_in_bytes != 0 && entry.num_bytes > self.limits.max_size_in_bytes {
            debug!(
                bytes = entry.num_bytes,
                max = self.limits.max_size_in_bytes,
                "cache entry larger than the cache, not storing"
            );
            return false;
        }

        let mut inner = self.inner.lock();
        inner.remove(&key);
        inner.total_bytes += entry.num_bytes;
        inner.entries.insert(key, Arc::new(entry));

        while self.limits.over(inner.entries.len(), inner.total_bytes) {
            match inner.entries.shift_remove_index(0) {
                Some((_, evicted)) => {
                    trace!(bytes = evicted.num_bytes, "evicting query cache entry");
                    inner.total_bytes -= evicted.num_bytes;
                }
                None => break,
            }
        }

        true
    }
}

/// In-memory query cache with FIFO eviction.
#[derive(Debug, Clone)]
pub struct MemoryQueryCache {
    store: Arc<MemoryStore>,
    runs: Arc<DashMap<CacheKey, usize>>,
}

impl MemoryQueryCache {
    pub fn new(limits: CacheLimits) -> Self {
        MemoryQueryCache {
            store: Arc::new(MemoryStore {
                limits,
                inner: Mutex::new(StoreInner::default()),
            }),
            runs: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.store.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.store.inner.lock().total_bytes
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.store.inner.lock().entries.contains_key(key)
    }

    /// Drop all entries and run counts.
    pub fn clear(&self) {
        let mut inner = self.store.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
        self.runs.clear();
    }
}

impl QueryCache for MemoryQueryCache {
    fn create_reader(&self, key: &CacheKey, freshness: Timestamp) -> CacheReader {
        let mut inner = self.store.inner.lock();
        let entry = match inner.entries.get(key) {
            Some(entry) => entry.clone(),
            None => return CacheReader::miss(),
        };

        if entry.is_expired(Utc::now()) {
            debug!("query cache entry expired");
            inner.remove(key);
            return CacheReader::miss();
        }

        if entry.source_update_time < freshness {
            debug!(
                entry = entry.source_update_time.0,
                freshness = freshness.0,
                "query cache entry is stale"
            );
            return CacheReader::miss();
        }

        CacheReader::hit(entry)
    }

    fn create_writer(&self, key: CacheKey, opts: WriterOptions) -> Arc<CacheWriter> {
        Arc::new(CacheWriter::new(key, self.store.clone(), opts))
    }

    fn record_run(&self, key: &CacheKey) -> usize {
        let mut runs = self.runs.entry(key.clone()).or_insert(0);
        *runs += 1;
        *runs
    }
}
