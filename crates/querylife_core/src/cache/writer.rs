use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{CacheEntry, CacheKey, EntryStore};
use crate::config::SessionConfig;
use crate::result::{Batch, BatchKind};
use crate::txn::Timestamp;

#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// Runs shorter than this are not stored.
    pub min_query_duration: Duration,
    pub squash_partial_results: bool,
    pub max_block_size: u64,
    /// Per-entry ceilings, 0 for unlimited.
    pub max_entry_size_in_rows: u64,
    pub max_entry_size_in_bytes: u64,
    pub expires_at: DateTime<Utc>,
    pub compress: bool,
    pub source_update_time: Timestamp,
}

impl WriterOptions {
    pub fn from_settings(settings: &SessionConfig, source_update_time: Timestamp) -> Self {
        let ttl = chrono::Duration::from_std(settings.query_cache_ttl())
            .unwrap_or(chrono::Duration::MAX);
        WriterOptions {
            min_query_duration: settings.query_cache_min_query_duration(),
            squash_partial_results: settings.query_cache_squash_partial_results,
            max_block_size: settings.max_block_size,
            max_entry_size_in_rows: settings.query_cache_max_entry_size_in_rows,
            max_entry_size_in_bytes: settings.query_cache_max_entry_size_in_bytes,
            expires_at: Utc::now()
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            compress: settings.query_cache_compress_entries,
            source_update_time,
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    rows: Vec<Batch>,
    totals: Option<Batch>,
    extremes: Option<Batch>,
    num_rows: u64,
    num_bytes: u64,
    /// Result outgrew the per-entry ceilings.
    skip: bool,
    finalized: bool,
}

/// Buffers a result while it streams, storing it in the cache once the query
/// finishes.
pub struct CacheWriter {
    key: CacheKey,
    store: Arc<dyn EntryStore>,
    opts: WriterOptions,
    started: Instant,
    state: Mutex<WriterState>,
}

impl CacheWriter {
    pub fn new(key: CacheKey, store: Arc<dyn EntryStore>, opts: WriterOptions) -> Self {
        CacheWriter {
            key,
            store,
            opts,
            started: Instant::now(),
            state: Mutex::new(WriterState::default()),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn buffer(&self, batch: &Batch) {
        let mut state = self.state.lock();
        if state.skip || state.finalized {
            return;
        }

        match batch.kind {
            BatchKind::Rows => {
                state.num_rows += batch.num_rows;
                state.num_bytes += batch.num_bytes();
                if exceeds(state.num_rows, self.opts.max_entry_size_in_rows)
                    || exceeds(state.num_bytes, self.opts.max_entry_size_in_bytes)
                {
                    debug!(
                        rows = state.num_rows,
                        bytes = state.num_bytes,
                        "query result too large for a cache entry, skipping"
                    );
                    state.skip = true;
                    state.rows.clear();
                    return;
                }
                state.rows.push(batch.clone());
            }
            BatchKind::Totals => state.totals = Some(batch.clone()),
            BatchKind::Extremes => state.extremes = Some(batch.clone()),
        }
    }

    /// Store the buffered result. Only the first call has any effect.
    ///
    /// Returns true if an entry was stored.
    pub fn finalize(&self) -> bool {
        let mut state = self.state.lock();
        if state.finalized {
            return false;
        }
        state.finalized = true;

        if state.skip {
            return false;
        }

        let elapsed = self.started.elapsed();
        if elapsed < self.opts.min_query_duration {
            debug!(
                ?elapsed,
                min = ?self.opts.min_query_duration,
                "query ran too briefly to be cached"
            );
            return false;
        }

        let mut rows = std::mem::take(&mut state.rows);
        if self.opts.squash_partial_results {
            rows = squash(rows, self.opts.max_block_size);
        }

        let extra_bytes = state.totals.as_ref().map(|b| b.num_bytes()).unwrap_or(0)
            + state.extremes.as_ref().map(|b| b.num_bytes()).unwrap_or(0);

        let entry = CacheEntry {
            rows,
            totals: state.totals.take(),
            extremes: state.extremes.take(),
            expires_at: self.opts.expires_at,
            compressed: self.opts.compress,
            source_update_time: self.opts.source_update_time,
            num_rows: state.num_rows,
            num_bytes: state.num_bytes + extra_bytes,
        };

        self.store.store(self.key.clone(), entry)
    }
}

fn exceeds(value: u64, limit: u64) -> bool {
    limit != 0 && value > limit
}

/// Merge consecutive row batches into batches of at least `max_block_size`
/// rows.
fn squash(batches: Vec<Batch>, max_block_size: u64) -> Vec<Batch> {
    let mut out = Vec::new();
    let mut buf = BytesMut::new();
    let mut rows = 0;

    for batch in batches {
        buf.extend_from_slice(&batch.data);
        rows += batch.num_rows;
        if rows >= max_block_size {
            out.push(Batch::rows(rows, buf.split().freeze()));
            rows = 0;
        }
    }

    if rows > 0 || !buf.is_empty() {
        out.push(Batch::rows(rows, buf.freeze()));
    }

    out
}
