//! In-memory collaborators for exercising the coordinator without a parser,
//! engine or cluster.

mod collaborators;
mod engine;
mod parser;
mod telemetry;

use std::sync::Arc;

pub use collaborators::*;
pub use engine::*;
use futures::executor::block_on;
pub use parser::*;
use querylife_error::Result;
pub use telemetry::*;

use crate::cache::{CacheLimits, MemoryQueryCache};
use crate::config::SessionConfig;
use crate::context::{ClientInfo, ExecutionContext, NodeRole};
use crate::coordinator::{Coordinator, ExecuteOptions, QuerySource, Services};
use crate::result::{Batch, ResultHandle};

/// Rpc address of the server under test.
pub const LOCAL_ADDRESS: &str = "10.0.0.1:8124";

/// Coordinator wired to in-memory collaborators, each exposed for
/// inspection.
pub struct TestHarness {
    pub txns: Arc<MemoryTransactionManager>,
    pub router: Arc<StaticRouter>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub scope_settings: Arc<StaticScopeSettings>,
    pub catalog: Arc<MemoryCatalog>,
    pub admission: Arc<MemoryAdmissionQueue>,
    pub processes: Arc<MemoryProcessRegistry>,
    pub engine: Arc<TestEngine>,
    pub cache: Arc<MemoryQueryCache>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub distributed: Arc<TestDistributed>,
    pub async_status: Arc<MemoryAsyncStatus>,
    pub quota: Arc<CountingQuota>,
    pub coordinator: Coordinator,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_quota(CountingQuota::new())
    }

    pub fn with_quota(quota: CountingQuota) -> Self {
        let txns = Arc::new(MemoryTransactionManager::new());
        let router = Arc::new(StaticRouter::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scope_settings = Arc::new(StaticScopeSettings::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let admission = Arc::new(MemoryAdmissionQueue::new());
        let processes = Arc::new(MemoryProcessRegistry::new());
        let engine = Arc::new(TestEngine::new(catalog.clone()));
        let cache = Arc::new(MemoryQueryCache::new(CacheLimits::from_settings(
            &SessionConfig::default(),
        )));
        let telemetry = Arc::new(RecordingTelemetry::new());
        let distributed = Arc::new(TestDistributed::new());
        let async_status = Arc::new(MemoryAsyncStatus::new());

        let coordinator = Coordinator::new(Services {
            parser: Arc::new(KeywordParser::new()),
            router: router.clone(),
            dispatcher: dispatcher.clone(),
            scope_settings: Some(scope_settings.clone()),
            transactions: txns.clone(),
            catalog: catalog.clone(),
            admission: admission.clone(),
            processes: processes.clone(),
            engine: engine.clone(),
            cache: Some(cache.clone()),
            telemetry: telemetry.clone(),
            masker: None,
            distributed: distributed.clone(),
            async_status: Some(async_status.clone()),
        });

        TestHarness {
            txns,
            router,
            dispatcher,
            scope_settings,
            catalog,
            admission,
            processes,
            engine,
            cache,
            telemetry,
            distributed,
            async_status,
            quota: Arc::new(quota),
            coordinator,
        }
    }

    /// Context of a client statement from user "alice".
    pub fn context(&self, role: NodeRole) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(role, ClientInfo::new("alice"));
        ctx.local_address = LOCAL_ADDRESS.to_string();
        ctx.quota = Some(self.quota.clone());
        ctx
    }

    pub fn execute(&self, ctx: &mut ExecutionContext, text: &str) -> Result<ResultHandle> {
        self.execute_with(ctx, text, ExecuteOptions::default())
    }

    pub fn execute_with(
        &self,
        ctx: &mut ExecutionContext,
        text: &str,
        opts: ExecuteOptions,
    ) -> Result<ResultHandle> {
        let (_, handle) =
            self.coordinator
                .execute(QuerySource::Text(text.to_string()), ctx, opts)?;
        Ok(handle)
    }

    /// Execute a statement and pull its full result.
    pub fn query(&self, ctx: &mut ExecutionContext, text: &str) -> Result<Vec<Batch>> {
        let handle = self.execute(ctx, text)?;
        block_on(handle.collect())
    }
}
