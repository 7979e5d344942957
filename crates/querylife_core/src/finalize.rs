//! Completion of an executed statement.
//!
//! Once a statement starts executing, exactly one of
//! [`FinalizationPair::on_finish`] and [`FinalizationPair::on_exception`]
//! takes effect. Either can be invoked from any thread, by whoever drives the
//! result to completion.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use querylife_error::ExecError;
use tracing::{debug, error, warn};

use crate::cache::CacheWriter;
use crate::config::SessionConfig;
use crate::context::TraceContext;
use crate::distributed::{DistributedCoordinators, SegmentStatus};
use crate::process::{ProcessEntry, ProcessInfo};
use crate::quota::{Quota, QuotaKind};
use crate::result::Batch;
use crate::telemetry::{
    AsyncQueryStatus,
    AsyncStatusStore,
    ProfileEvent,
    QueryLogElement,
    QueryLogType,
    SpanRecord,
    TelemetrySink,
    normalized_query_hash,
};
use crate::txn::{TransactionHandle, TransactionManager};

/// Collaborators used while finalizing.
#[derive(Clone)]
pub struct FinalizeServices {
    pub transactions: Arc<dyn TransactionManager>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub distributed: Arc<dyn DistributedCoordinators>,
    pub async_status: Option<Arc<dyn AsyncStatusStore>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub log_queries: bool,
    pub min_type: QueryLogType,
    pub min_duration_ms: u64,
    pub log_comment: String,
    pub ambiguous_error_wait_timeout: Duration,
}

impl LogSettings {
    pub fn from_settings(settings: &SessionConfig) -> Self {
        let mut log_comment = settings.log_comment.clone();
        let max_len = usize::try_from(settings.max_query_size).unwrap_or(usize::MAX);
        if log_comment.len() > max_len {
            let mut idx = max_len;
            while !log_comment.is_char_boundary(idx) {
                idx -= 1;
            }
            log_comment.truncate(idx);
        }

        LogSettings {
            log_queries: settings.log_queries,
            min_type: settings.log_queries_min_type,
            min_duration_ms: settings.log_queries_min_query_duration_ms,
            log_comment,
            ambiguous_error_wait_timeout: settings.ambiguous_error_wait_timeout(),
        }
    }

    fn should_log(&self, log_type: QueryLogType, duration_ms: u64) -> bool {
        self.log_queries && log_type >= self.min_type && duration_ms >= self.min_duration_ms
    }
}

/// Everything finalization needs, captured once when the pair is attached.
///
/// Nothing here aliases the execution context, which may be reused by the
/// next statement of the session while this one is still streaming.
pub struct FinalizationSnapshot {
    pub query_id: String,
    pub initial_query_id: String,
    pub user: String,
    pub client_address: String,
    pub current_database: String,
    /// Masked and cut query text.
    pub query_for_logging: String,
    pub statement_kind: &'static str,
    pub is_select: bool,
    pub is_insert: bool,
    pub internal: bool,
    pub start_time: DateTime<Utc>,
    pub started: Instant,
    pub log: LogSettings,
    pub transaction: Option<Arc<TransactionHandle>>,
    pub cache_writer: Option<Arc<CacheWriter>>,
    pub process_entry: Option<Arc<dyn ProcessEntry>>,
    pub quota: Option<Arc<dyn Quota>>,
    pub async_query_id: Option<String>,
    pub trace: Option<TraceContext>,
    pub served_from_cache: bool,
    /// Set when the statement was retried after a fallback.
    pub fallback: bool,
}

impl FinalizationSnapshot {
    pub fn new(query_id: impl Into<String>, query_for_logging: impl Into<String>) -> Self {
        let query_id = query_id.into();
        FinalizationSnapshot {
            initial_query_id: query_id.clone(),
            query_id,
            user: String::new(),
            client_address: String::new(),
            current_database: String::new(),
            query_for_logging: query_for_logging.into(),
            statement_kind: "",
            is_select: false,
            is_insert: false,
            internal: false,
            start_time: Utc::now(),
            started: Instant::now(),
            log: LogSettings::from_settings(&SessionConfig::default()),
            transaction: None,
            cache_writer: None,
            process_entry: None,
            quota: None,
            async_query_id: None,
            trace: None,
            served_from_cache: false,
            fallback: false,
        }
    }

    fn process_info(&self) -> Option<ProcessInfo> {
        self.process_entry.as_ref().map(|entry| entry.info())
    }

    fn duration_ms(&self, info: Option<&ProcessInfo>) -> u64 {
        let elapsed = match info {
            Some(info) => info.elapsed,
            None => self.started.elapsed(),
        };
        elapsed.as_millis() as u64
    }

    pub fn log_element(
        &self,
        log_type: QueryLogType,
        event_time: DateTime<Utc>,
        info: Option<&ProcessInfo>,
    ) -> QueryLogElement {
        let info = info.copied().unwrap_or_default();
        QueryLogElement {
            log_type,
            event_time,
            query_start_time: self.start_time,
            query_duration_ms: 0,
            query_id: self.query_id.clone(),
            initial_query_id: self.initial_query_id.clone(),
            user: self.user.clone(),
            client_address: self.client_address.clone(),
            current_database: self.current_database.clone(),
            query: self.query_for_logging.clone(),
            normalized_query_hash: normalized_query_hash(&self.query_for_logging),
            query_kind: self.statement_kind,
            is_internal: self.internal,
            read_rows: info.read_rows,
            read_bytes: info.read_bytes,
            written_rows: info.written_rows,
            written_bytes: info.written_bytes,
            result_rows: 0,
            result_bytes: 0,
            peak_memory_usage: info.peak_memory_usage,
            exception_code: 0,
            exception: None,
            log_comment: self.log.log_comment.clone(),
            served_from_cache: self.served_from_cache,
            fallback: self.fallback,
            txn_id: self.transaction.as_ref().map(|txn| txn.id.0),
        }
    }

    fn span(&self, status: QueryLogType, finish_time: DateTime<Utc>) -> Option<SpanRecord> {
        let trace = self.trace.as_ref()?;
        let mut attributes = vec![
            ("query_status".to_string(), status.as_str().to_string()),
            ("db.statement".to_string(), self.query_for_logging.clone()),
            ("query_id".to_string(), self.query_id.clone()),
        ];
        if let Some(state) = &trace.trace_state {
            attributes.push(("tracestate".to_string(), state.clone()));
        }
        Some(SpanRecord {
            trace_id: trace.trace_id,
            span_id: trace.span_id,
            parent_span_id: trace.parent_span_id,
            operation_name: "query".to_string(),
            start_time: self.start_time,
            finish_time,
            attributes,
        })
    }
}

fn emit_log(services: &FinalizeServices, elem: &QueryLogElement) {
    if let Err(e) = services.telemetry.add_query_log(elem) {
        warn!(%e, query_id = %elem.query_id, "failed to write query log record");
    }
}

fn emit_span(services: &FinalizeServices, snapshot: &FinalizationSnapshot, status: QueryLogType, now: DateTime<Utc>) {
    if let Some(span) = snapshot.span(status, now) {
        if let Err(e) = services.telemetry.add_span(&span) {
            warn!(%e, query_id = %snapshot.query_id, "failed to write query span");
        }
    }
}

fn emit_query_time(services: &FinalizeServices, snapshot: &FinalizationSnapshot, info: Option<&ProcessInfo>) {
    let Some(info) = info else {
        return;
    };
    let micros = info.elapsed.as_micros() as u64;
    services
        .telemetry
        .increment(ProfileEvent::QueryTimeMicroseconds, micros);
    if snapshot.is_select {
        services
            .telemetry
            .increment(ProfileEvent::SelectQueryTimeMicroseconds, micros);
    } else if snapshot.is_insert {
        services
            .telemetry
            .increment(ProfileEvent::InsertQueryTimeMicroseconds, micros);
    }
}

fn emit_failed(services: &FinalizeServices, snapshot: &FinalizationSnapshot) {
    services.telemetry.increment(ProfileEvent::FailedQuery, 1);
    if snapshot.is_select {
        services.telemetry.increment(ProfileEvent::FailedSelectQuery, 1);
    } else if snapshot.is_insert {
        services.telemetry.increment(ProfileEvent::FailedInsertQuery, 1);
    }
}

fn update_async_status(services: &FinalizeServices, snapshot: &FinalizationSnapshot, status: AsyncQueryStatus) {
    let (Some(store), Some(id)) = (&services.async_status, &snapshot.async_query_id) else {
        return;
    };
    if let Err(e) = store.update(id, status) {
        warn!(%e, async_query_id = %id, "failed to update async query status");
    }
}

fn charge_error_quota(snapshot: &FinalizationSnapshot) {
    if let Some(quota) = &snapshot.quota {
        if let Err(e) = quota.used(QuotaKind::Errors, 1, false) {
            warn!(%e, query_id = %snapshot.query_id, "failed to charge error quota");
        }
    }
}

/// Write the QueryStart record for a statement about to run.
pub fn emit_query_start(services: &FinalizeServices, snapshot: &FinalizationSnapshot) {
    if snapshot.internal || snapshot.log.min_duration_ms != 0 {
        return;
    }
    if !snapshot.log.should_log(QueryLogType::QueryStart, 0) {
        return;
    }
    let elem = snapshot.log_element(QueryLogType::QueryStart, snapshot.start_time, None);
    emit_log(services, &elem);
}

/// Finalize a statement that failed before it started executing.
pub fn exception_before_start(
    services: &FinalizeServices,
    snapshot: FinalizationSnapshot,
    err: &ExecError,
) {
    if let Some(txn) = &snapshot.transaction {
        services.transactions.finish(txn);
    }

    if !snapshot.internal {
        charge_error_quota(&snapshot);

        let now = Utc::now();
        error!(query_id = %snapshot.query_id, code = %err.code(), %err, "query failed before start");

        let mut elem = snapshot.log_element(QueryLogType::ExceptionBeforeStart, now, None);
        elem.query_start_time = now;
        elem.exception_code = err.code().0;
        elem.exception = Some(err.to_string());
        if snapshot.log.min_duration_ms == 0
            && snapshot.log.should_log(QueryLogType::ExceptionBeforeStart, 0)
        {
            emit_log(services, &elem);
        }

        emit_span(services, &snapshot, QueryLogType::ExceptionBeforeStart, now);
        emit_failed(services, &snapshot);
    }

    update_async_status(
        services,
        &snapshot,
        AsyncQueryStatus::Failed {
            message: err.to_string(),
        },
    );
    services.distributed.cancel_segments(&snapshot.query_id);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    ExceptionWhileProcessing,
}

/// The finish and exception callbacks of one statement.
pub struct FinalizationPair {
    services: FinalizeServices,
    snapshot: Mutex<Option<FinalizationSnapshot>>,
    outcome: OnceLock<Outcome>,
    result_rows: AtomicU64,
    result_bytes: AtomicU64,
}

impl FinalizationPair {
    pub fn new(services: FinalizeServices, snapshot: FinalizationSnapshot) -> Self {
        FinalizationPair {
            services,
            snapshot: Mutex::new(Some(snapshot)),
            outcome: OnceLock::new(),
            result_rows: AtomicU64::new(0),
            result_bytes: AtomicU64::new(0),
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.get().copied()
    }

    pub fn is_fired(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn record_result(&self, batch: &Batch) {
        self.result_rows.fetch_add(batch.num_rows, Ordering::Relaxed);
        self.result_bytes
            .fetch_add(batch.num_bytes(), Ordering::Relaxed);
    }

    /// Claim the pair for an outcome. Only the first claim gets the snapshot.
    fn claim(&self, outcome: Outcome) -> Option<FinalizationSnapshot> {
        if self.outcome.set(outcome).is_err() {
            return None;
        }
        self.snapshot.lock().take()
    }

    pub fn on_finish(&self) {
        let Some(snapshot) = self.claim(Outcome::Finished) else {
            return;
        };
        self.finish_with(snapshot);
    }

    /// Finalize a failed statement, returning the error to surface.
    ///
    /// If the query's distributed coordinator considers the error ambiguous,
    /// this blocks until the coordinator has summarized the root cause (or
    /// the wait times out), and returns the summarized error when its code
    /// differs from the local one.
    pub fn on_exception(&self, err: ExecError) -> ExecError {
        let Some(snapshot) = self.claim(Outcome::ExceptionWhileProcessing) else {
            return err;
        };
        self.fail_with(snapshot, err)
    }

    fn finish_with(&self, snapshot: FinalizationSnapshot) {
        if let Some(writer) = &snapshot.cache_writer {
            if writer.finalize() {
                debug!(query_id = %snapshot.query_id, "stored query result in cache");
            }
        }

        if let Some(txn) = &snapshot.transaction {
            self.services.transactions.finish(txn);
        }

        let now = Utc::now();
        let info = snapshot.process_info();
        emit_query_time(&self.services, &snapshot, info.as_ref());

        let mut elem = snapshot.log_element(QueryLogType::QueryFinish, now, info.as_ref());
        elem.query_duration_ms = snapshot.duration_ms(info.as_ref());
        elem.result_rows = self.result_rows.load(Ordering::Relaxed);
        elem.result_bytes = self.result_bytes.load(Ordering::Relaxed);

        if !snapshot.internal
            && snapshot
                .log
                .should_log(QueryLogType::QueryFinish, elem.query_duration_ms)
        {
            emit_log(&self.services, &elem);
        }
        emit_span(&self.services, &snapshot, QueryLogType::QueryFinish, now);

        debug!(
            query_id = %snapshot.query_id,
            duration_ms = elem.query_duration_ms,
            result_rows = elem.result_rows,
            "query finished"
        );

        update_async_status(&self.services, &snapshot, AsyncQueryStatus::Finished);
        self.services.distributed.cancel_segments(&snapshot.query_id);
    }

    fn fail_with(&self, snapshot: FinalizationSnapshot, err: ExecError) -> ExecError {
        if let Some(txn) = &snapshot.transaction {
            self.services.transactions.finish(txn);
        }
        charge_error_quota(&snapshot);

        let mut code = err.code();
        let mut message = err.to_string();
        let mut surfaced = err;

        if let Some(coordinator) = self.services.distributed.coordinator(&snapshot.query_id) {
            coordinator.report_segment_status(SegmentStatus {
                query_id: snapshot.query_id.clone(),
                segment_id: 0,
                succeeded: false,
                code,
                message: message.clone(),
            });

            if code.is_ambiguous() {
                match coordinator.await_root_cause(
                    code,
                    &message,
                    snapshot.log.ambiguous_error_wait_timeout,
                ) {
                    Ok(root) => {
                        if root.code != code {
                            surfaced = ExecError::Remote {
                                code: root.code,
                                message: root.message.clone(),
                            };
                        }
                        code = root.code;
                        message = root.message;
                    }
                    Err(e) => {
                        warn!(%e, query_id = %snapshot.query_id, "failed to resolve root cause of ambiguous error");
                    }
                }
            }
        }

        error!(query_id = %snapshot.query_id, %code, %message, "query failed");

        let now = Utc::now();
        let info = snapshot.process_info();
        emit_query_time(&self.services, &snapshot, info.as_ref());

        let mut elem =
            snapshot.log_element(QueryLogType::ExceptionWhileProcessing, now, info.as_ref());
        elem.query_duration_ms = snapshot.duration_ms(info.as_ref());
        elem.result_rows = self.result_rows.load(Ordering::Relaxed);
        elem.result_bytes = self.result_bytes.load(Ordering::Relaxed);
        elem.exception_code = code.0;
        elem.exception = Some(message.clone());

        if snapshot
            .log
            .should_log(QueryLogType::ExceptionWhileProcessing, elem.query_duration_ms)
        {
            emit_log(&self.services, &elem);
        }
        emit_span(
            &self.services,
            &snapshot,
            QueryLogType::ExceptionWhileProcessing,
            now,
        );
        emit_failed(&self.services, &snapshot);

        update_async_status(&self.services, &snapshot, AsyncQueryStatus::Failed { message });
        self.services.distributed.cancel_segments(&snapshot.query_id);

        surfaced
    }
}
