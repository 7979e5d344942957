use std::sync::Arc;
use std::time::Duration;

use querylife_error::{ErrorCode, Result};

/// Status of one plan segment of a distributed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStatus {
    pub query_id: String,
    pub segment_id: u64,
    pub succeeded: bool,
    pub code: ErrorCode,
    pub message: String,
}

/// Summarized error across all nodes participating in a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCause {
    pub code: ErrorCode,
    pub message: String,
}

/// Coordinates the plan segments of a single distributed query.
pub trait DistributedCoordinator: Sync + Send {
    fn report_segment_status(&self, status: SegmentStatus);

    /// Block until the coordinator has summarized the root cause of the
    /// query's failure, or until `timeout` elapses.
    ///
    /// `code` and `message` describe the error observed locally.
    fn await_root_cause(&self, code: ErrorCode, message: &str, timeout: Duration)
    -> Result<RootCause>;
}

/// Process-wide registry of distributed query coordinators.
pub trait DistributedCoordinators: Sync + Send {
    fn coordinator(&self, query_id: &str) -> Option<Arc<dyn DistributedCoordinator>>;

    /// Cancel and clean up all plan segments of a query.
    ///
    /// Idempotent, cancelling an unknown or already finished query is a
    /// no-op.
    fn cancel_segments(&self, query_id: &str);
}
