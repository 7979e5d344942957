//! Query result cache protocol.
//!
//! The coordinator only talks to the cache through [`QueryCache`]. A result
//! is looked up with a [`CacheReader`] after the plan is built, and stored by
//! a [`CacheWriter`] that buffers the result while it streams to the client.
pub mod key;
pub mod memory;
pub mod writer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;

pub use key::{CacheKey, SharingScope};
pub use memory::{CacheLimits, MemoryQueryCache};
pub use writer::{CacheWriter, WriterOptions};

use crate::result::{Batch, BatchStream};
use crate::txn::Timestamp;

/// A buffered result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub rows: Vec<Batch>,
    pub totals: Option<Batch>,
    pub extremes: Option<Batch>,
    pub expires_at: DateTime<Utc>,
    pub compressed: bool,
    /// Freshness of the source tables when the result was computed.
    pub source_update_time: Timestamp,
    pub num_rows: u64,
    pub num_bytes: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Default)]
pub struct CacheReader {
    entry: Option<Arc<CacheEntry>>,
}

impl CacheReader {
    pub fn miss() -> Self {
        CacheReader { entry: None }
    }

    pub fn hit(entry: Arc<CacheEntry>) -> Self {
        CacheReader { entry: Some(entry) }
    }

    pub fn has_hit(&self) -> bool {
        self.entry.is_some()
    }

    /// Stream of the cached rows.
    pub fn source(&self) -> Option<BatchStream> {
        let entry = self.entry.as_ref()?;
        let rows = entry.rows.clone();
        Some(futures::stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    pub fn totals(&self) -> Option<Batch> {
        self.entry.as_ref().and_then(|e| e.totals.clone())
    }

    pub fn extremes(&self) -> Option<Batch> {
        self.entry.as_ref().and_then(|e| e.extremes.clone())
    }

    /// Stream of the full cached result: rows, then totals, then extremes.
    pub fn into_stream(self) -> Option<BatchStream> {
        let source = self.source()?;
        let tail: Vec<_> = [self.totals(), self.extremes()]
            .into_iter()
            .flatten()
            .map(Ok)
            .collect();
        Some(source.chain(futures::stream::iter(tail)).boxed())
    }
}

/// Storage side of the cache used by writers.
pub trait EntryStore: Sync + Send {
    /// Store an entry, returning false if it was rejected.
    fn store(&self, key: CacheKey, entry: CacheEntry) -> bool;
}

/// Process-wide query result cache.
///
/// Implementations handle concurrency between readers and writers of the
/// same key.
pub trait QueryCache: Sync + Send {
    /// Look up a result computed from sources at least as fresh as
    /// `freshness`.
    fn create_reader(&self, key: &CacheKey, freshness: Timestamp) -> CacheReader;

    fn create_writer(&self, key: CacheKey, opts: WriterOptions) -> Arc<CacheWriter>;

    /// Record a run of the query with this key, returning the number of runs
    /// including this one.
    fn record_run(&self, key: &CacheKey) -> usize;
}
