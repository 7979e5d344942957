//! Query results and the streaming stages the coordinator wraps them in.
//!
//! A pulled result goes through, innermost first: the engine's stream,
//! [`LimitsStream`], [`CacheWriteStream`] and finally [`FinalizingStream`],
//! which fires the finalization pair when the stream ends or fails.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use querylife_error::{ExecError, Result, internal};
use tracing::debug;

use crate::cache::CacheWriter;
use crate::config::{OverflowMode, SessionConfig};
use crate::finalize::FinalizationPair;
use crate::quota::{Quota, QuotaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Rows,
    Totals,
    Extremes,
}

/// A block of result rows.
///
/// The payload is opaque to the coordinator, only row and byte counts are
/// inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub kind: BatchKind,
    pub num_rows: u64,
    pub data: Bytes,
}

impl Batch {
    pub fn new(kind: BatchKind, num_rows: u64, data: Bytes) -> Self {
        Batch {
            kind,
            num_rows,
            data,
        }
    }

    pub fn rows(num_rows: u64, data: Bytes) -> Self {
        Self::new(BatchKind::Rows, num_rows, data)
    }

    pub fn num_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

pub type BatchStream = Pin<Box<dyn Stream<Item = Result<Batch>> + Send>>;

/// Receiving side of a push pipeline, e.g. the target of an INSERT.
pub trait BatchSink: Send {
    fn push(&mut self, batch: Batch) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// What executing a statement produced.
pub enum Output {
    /// Results pulled by the caller.
    Pull(BatchStream),
    /// Data pushed by the caller.
    Push(Box<dyn BatchSink>),
    /// Nothing to drive, e.g. DDL.
    Empty,
}

impl Output {
    pub fn is_pull(&self) -> bool {
        matches!(self, Output::Pull(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Output::Pull(_) => "pull",
            Output::Push(_) => "push",
            Output::Empty => "empty",
        }
    }
}

/// Ceilings on the final result of a query, 0 for unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeLimits {
    pub max_rows: u64,
    pub max_bytes: u64,
    pub overflow_mode: OverflowMode,
}

impl SizeLimits {
    pub fn from_settings(settings: &SessionConfig) -> Self {
        SizeLimits {
            max_rows: settings.max_result_rows,
            max_bytes: settings.max_result_bytes,
            overflow_mode: settings.result_overflow_mode,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_rows == 0 && self.max_bytes == 0
    }

    /// Whether the result may end early without an error.
    pub fn may_truncate(&self) -> bool {
        !self.is_unlimited() && self.overflow_mode == OverflowMode::Break
    }

    fn exceeded(&self, rows: u64, bytes: u64) -> Option<ExecError> {
        if self.max_rows != 0 && rows > self.max_rows {
            return Some(ExecError::ResultLimitExceeded {
                what: "rows",
                limit: self.max_rows,
                actual: rows,
            });
        }
        if self.max_bytes != 0 && bytes > self.max_bytes {
            return Some(ExecError::ResultLimitExceeded {
                what: "bytes",
                limit: self.max_bytes,
                actual: bytes,
            });
        }
        None
    }
}

/// Enforces result size limits and charges the result quota.
pub struct LimitsStream {
    stream: BatchStream,
    limits: SizeLimits,
    quota: Option<Arc<dyn Quota>>,
    rows: u64,
    bytes: u64,
    done: bool,
}

impl LimitsStream {
    pub fn new(stream: BatchStream, limits: SizeLimits, quota: Option<Arc<dyn Quota>>) -> Self {
        LimitsStream {
            stream,
            limits,
            quota,
            rows: 0,
            bytes: 0,
            done: false,
        }
    }

    fn charge_quota(&self, batch: &Batch) -> Result<()> {
        if let Some(quota) = &self.quota {
            quota.used(QuotaKind::ResultRows, batch.num_rows, true)?;
            quota.used(QuotaKind::ResultBytes, batch.num_bytes(), true)?;
        }
        Ok(())
    }
}

impl Stream for LimitsStream {
    type Item = Result<Batch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(batch))) if batch.kind == BatchKind::Rows => {
                if let Err(e) = this.charge_quota(&batch) {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }

                this.rows += batch.num_rows;
                this.bytes += batch.num_bytes();

                if let Some(err) = this.limits.exceeded(this.rows, this.bytes) {
                    this.done = true;
                    match this.limits.overflow_mode {
                        OverflowMode::Throw => return Poll::Ready(Some(Err(err))),
                        OverflowMode::Break => {
                            debug!(%err, "result limit reached, stopping");
                        }
                    }
                }

                Poll::Ready(Some(Ok(batch)))
            }
            poll => poll,
        }
    }
}

/// Buffers every batch into a cache writer.
pub struct CacheWriteStream {
    stream: BatchStream,
    writer: Arc<CacheWriter>,
}

impl CacheWriteStream {
    pub fn new(stream: BatchStream, writer: Arc<CacheWriter>) -> Self {
        CacheWriteStream { stream, writer }
    }
}

impl Stream for CacheWriteStream {
    type Item = Result<Batch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(batch))) => {
                self.writer.buffer(&batch);
                Poll::Ready(Some(Ok(batch)))
            }
            poll => poll,
        }
    }
}

/// Fires the finalization pair once the wrapped stream completes or fails.
///
/// A stream dropped before either happens is finalized as failed.
pub struct FinalizingStream {
    stream: BatchStream,
    pair: Arc<FinalizationPair>,
    done: bool,
}

impl FinalizingStream {
    pub fn new(stream: BatchStream, pair: Arc<FinalizationPair>) -> Self {
        FinalizingStream {
            stream,
            pair,
            done: false,
        }
    }
}

impl Stream for FinalizingStream {
    type Item = Result<Batch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.stream.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.done = true;
                this.pair.on_finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                // Callers stop polling after the first error, finalize now.
                this.done = true;
                Poll::Ready(Some(Err(this.pair.on_exception(e))))
            }
            Poll::Ready(Some(Ok(batch))) => {
                this.pair.record_result(&batch);
                Poll::Ready(Some(Ok(batch)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for FinalizingStream {
    fn drop(&mut self) {
        if !self.done {
            self.pair.on_exception(ExecError::Execution(
                "result stream dropped before completion".to_string(),
            ));
        }
    }
}

/// Result of [`crate::coordinator::Coordinator::execute`].
///
/// Pull outputs finalize themselves as they are consumed. Push and empty
/// outputs must be finalized by the driver with [`ResultHandle::finish`] or
/// [`ResultHandle::fail`]; a handle dropped without either is finalized as
/// failed.
pub struct ResultHandle {
    query_id: String,
    output: Output,
    served_from_cache: bool,
    finalization: Option<Arc<FinalizationPair>>,
    driver_finalizes: bool,
}

impl std::fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("query_id", &self.query_id)
            .field("output", &self.output.kind_name())
            .field("served_from_cache", &self.served_from_cache)
            .field("driver_finalizes", &self.driver_finalizes)
            .finish_non_exhaustive()
    }
}

impl ResultHandle {
    /// Handle for a result produced on another server. Finalization happens
    /// there.
    pub fn remote(query_id: impl Into<String>, output: Output) -> Self {
        ResultHandle {
            query_id: query_id.into(),
            output,
            served_from_cache: false,
            finalization: None,
            driver_finalizes: false,
        }
    }

    pub(crate) fn with_finalization(
        query_id: impl Into<String>,
        output: Output,
        served_from_cache: bool,
        pair: Arc<FinalizationPair>,
    ) -> Self {
        let (output, driver_finalizes) = match output {
            Output::Pull(stream) => (
                Output::Pull(FinalizingStream::new(stream, pair.clone()).boxed()),
                false,
            ),
            other => (other, true),
        };
        ResultHandle {
            query_id: query_id.into(),
            output,
            served_from_cache,
            finalization: Some(pair),
            driver_finalizes,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn served_from_cache(&self) -> bool {
        self.served_from_cache
    }

    pub fn finalization(&self) -> Option<&Arc<FinalizationPair>> {
        self.finalization.as_ref()
    }

    pub fn output_kind(&self) -> &'static str {
        self.output.kind_name()
    }

    /// Take the output, leaving an empty output behind.
    pub fn take_output(&mut self) -> Output {
        std::mem::replace(&mut self.output, Output::Empty)
    }

    /// Pull all batches.
    ///
    /// An empty output is finalized immediately.
    pub async fn collect(mut self) -> Result<Vec<Batch>> {
        match self.take_output() {
            Output::Pull(stream) => stream.try_collect().await,
            Output::Push(_) => Err(self.fail(internal!("cannot pull from a push output"))),
            Output::Empty => {
                self.finish();
                Ok(Vec::new())
            }
        }
    }

    /// Push all batches into a push output, then finish it.
    pub fn write_all(mut self, batches: Vec<Batch>) -> Result<()> {
        let mut sink = match self.take_output() {
            Output::Push(sink) => sink,
            other => {
                let err = internal!("cannot push into a {} output", other.kind_name());
                return Err(self.fail(err));
            }
        };

        for batch in batches {
            if let Err(e) = sink.push(batch) {
                return Err(self.fail(e));
            }
        }
        if let Err(e) = sink.finish() {
            return Err(self.fail(e));
        }

        self.finish();
        Ok(())
    }

    /// Report successful completion.
    pub fn finish(&self) {
        if let Some(pair) = &self.finalization {
            pair.on_finish();
        }
    }

    /// Report failure, returning the error to surface to the client.
    pub fn fail(&self, err: ExecError) -> ExecError {
        match &self.finalization {
            Some(pair) => pair.on_exception(err),
            None => err,
        }
    }
}

impl Drop for ResultHandle {
    fn drop(&mut self) {
        if !self.driver_finalizes {
            return;
        }
        if let Some(pair) = &self.finalization {
            if !pair.is_fired() {
                pair.on_exception(ExecError::Execution(
                    "result dropped before completion".to_string(),
                ));
            }
        }
    }
}
