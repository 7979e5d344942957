use std::sync::Arc;
use std::time::Duration;

use querylife_error::Result;

use crate::context::ExecutionContext;
use crate::statement::Statement;

/// Progress counters of a running query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub elapsed: Duration,
    pub read_rows: u64,
    pub read_bytes: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
    pub peak_memory_usage: u64,
}

/// Entry of a query in the process list.
///
/// The entry is removed from the list when the last strong reference is
/// dropped.
pub trait ProcessEntry: Sync + Send {
    fn is_cancelled(&self) -> bool;
    fn info(&self) -> ProcessInfo;
}

/// List of in-flight queries, used for cancellation and progress.
pub trait ProcessRegistry: Sync + Send {
    fn insert(
        &self,
        query_text: &str,
        stmt: &Statement,
        ctx: &ExecutionContext,
    ) -> Result<Arc<dyn ProcessEntry>>;
}
