//! Telemetry, distributed coordination and async status doubles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use querylife_error::{ErrorCode, ExecError, Result};

use crate::distributed::{DistributedCoordinator, DistributedCoordinators, RootCause, SegmentStatus};
use crate::telemetry::{
    AsyncQueryStatus,
    AsyncStatusStore,
    ProfileEvent,
    QueryLogElement,
    QueryLogType,
    SpanRecord,
    TelemetrySink,
};

/// Sink keeping everything it receives.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    logs: Mutex<Vec<QueryLogElement>>,
    spans: Mutex<Vec<SpanRecord>>,
    events: DashMap<ProfileEvent, u64>,
    fail_writes: AtomicBool,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make log and span writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn query_logs(&self) -> Vec<QueryLogElement> {
        self.logs.lock().clone()
    }

    pub fn log_types(&self) -> Vec<QueryLogType> {
        self.logs.lock().iter().map(|l| l.log_type).collect()
    }

    /// Records other than QueryStart, one per finalized statement.
    pub fn terminal_logs(&self) -> Vec<QueryLogElement> {
        self.logs
            .lock()
            .iter()
            .filter(|l| l.log_type != QueryLogType::QueryStart)
            .cloned()
            .collect()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().clone()
    }

    pub fn profile_count(&self, event: ProfileEvent) -> u64 {
        self.events.get(&event).map(|v| *v).unwrap_or(0)
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ExecError::Internal("telemetry unavailable".to_string()));
        }
        Ok(())
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn add_query_log(&self, elem: &QueryLogElement) -> Result<()> {
        self.check_fail()?;
        self.logs.lock().push(elem.clone());
        Ok(())
    }

    fn add_span(&self, span: &SpanRecord) -> Result<()> {
        self.check_fail()?;
        self.spans.lock().push(span.clone());
        Ok(())
    }

    fn increment(&self, event: ProfileEvent, amount: u64) {
        *self.events.entry(event).or_insert(0) += amount;
    }
}

/// Coordinator of one distributed query.
#[derive(Debug)]
pub struct TestCoordinator {
    root_cause: Option<RootCause>,
    statuses: Mutex<Vec<SegmentStatus>>,
    waits: AtomicUsize,
}

impl TestCoordinator {
    pub fn statuses(&self) -> Vec<SegmentStatus> {
        self.statuses.lock().clone()
    }

    /// Number of root cause waits.
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

impl DistributedCoordinator for TestCoordinator {
    fn report_segment_status(&self, status: SegmentStatus) {
        self.statuses.lock().push(status);
    }

    fn await_root_cause(
        &self,
        code: ErrorCode,
        message: &str,
        _timeout: Duration,
    ) -> Result<RootCause> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(self.root_cause.clone().unwrap_or_else(|| RootCause {
            code,
            message: message.to_string(),
        }))
    }
}

#[derive(Debug, Default)]
pub struct TestDistributed {
    coordinators: DashMap<String, Arc<TestCoordinator>>,
    cancelled: Mutex<Vec<String>>,
}

impl TestDistributed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a coordinator for a query. Root cause waits resolve to
    /// `root_cause`, or to the local error when `None`.
    pub fn register(&self, query_id: &str, root_cause: Option<RootCause>) -> Arc<TestCoordinator> {
        let coordinator = Arc::new(TestCoordinator {
            root_cause,
            statuses: Mutex::new(Vec::new()),
            waits: AtomicUsize::new(0),
        });
        self.coordinators
            .insert(query_id.to_string(), coordinator.clone());
        coordinator
    }

    /// Query ids of every cancellation request, including repeats.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

impl DistributedCoordinators for TestDistributed {
    fn coordinator(&self, query_id: &str) -> Option<Arc<dyn DistributedCoordinator>> {
        self.coordinators
            .get(query_id)
            .map(|c| c.clone() as Arc<dyn DistributedCoordinator>)
    }

    fn cancel_segments(&self, query_id: &str) {
        self.cancelled.lock().push(query_id.to_string());
    }
}

#[derive(Debug, Default)]
pub struct MemoryAsyncStatus {
    statuses: DashMap<String, AsyncQueryStatus>,
}

impl MemoryAsyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, async_query_id: &str) -> Option<AsyncQueryStatus> {
        self.statuses.get(async_query_id).map(|s| s.clone())
    }
}

impl AsyncStatusStore for MemoryAsyncStatus {
    fn update(&self, async_query_id: &str, status: AsyncQueryStatus) -> Result<()> {
        self.statuses.insert(async_query_id.to_string(), status);
        Ok(())
    }
}
