use std::time::Duration;

use querylife_error::{AdmissionRejection, Result};

use crate::context::ExecutionGroup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The statement may run. A different instance of the same logical group
    /// may be returned when the queue rebalanced the query.
    Admitted { group: Option<ExecutionGroup> },
    Rejected(AdmissionRejection),
}

/// Bounded per-execution-group admission control.
pub trait AdmissionQueue: Sync + Send {
    /// Block until the query is admitted, rejected, or `timeout` elapses.
    fn enqueue(
        &self,
        query_id: &str,
        group: &ExecutionGroup,
        timeout: Duration,
    ) -> Result<AdmissionOutcome>;
}
