//! Sequencing of a single statement from text to a running result.
//!
//! [`Coordinator::execute`] runs on the thread that received the statement
//! and returns as soon as the result is ready to be driven. Any failure
//! before the interpreter is built goes through the before-start path of
//! [`crate::finalize`]. From then on the statement has a
//! [`FinalizationPair`] which fires exactly once, either right away on
//! failure or later when the caller drives the result to completion.
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use querylife_error::{ExecError, OptionExt, Result};
use tracing::{debug, info, trace, warn};

use crate::admission::{AdmissionOutcome, AdmissionQueue};
use crate::cache::{CacheKey, CacheWriter, QueryCache, WriterOptions};
use crate::catalog::Catalog;
use crate::config::SessionConfig;
use crate::context::ExecutionContext;
use crate::distributed::DistributedCoordinators;
use crate::finalize::{
    FinalizationPair,
    FinalizationSnapshot,
    FinalizeServices,
    LogSettings,
    emit_query_start,
    exception_before_start,
};
use crate::interpreter::{
    ExecutionEngine,
    ExecutionOutput,
    Interpreter,
    InterpreterCapabilities,
    InterpreterOptions,
    ProcessingStage,
};
use crate::parser::{ParseLimits, Parser};
use crate::process::{ProcessEntry, ProcessRegistry};
use crate::quota::QuotaKind;
use crate::result::{CacheWriteStream, LimitsStream, Output, ResultHandle, SizeLimits};
use crate::routing::{Host, RemoteDispatcher, Router, ScopeSettings};
use crate::statement::Statement;
use crate::telemetry::{
    AsyncStatusStore,
    DataMasker,
    TelemetrySink,
    char_prefix,
    prepare_query_for_logging,
    query_log_line,
};
use crate::txn::{CreateTransactionOptions, Timestamp, TransactionHandle, TransactionManager};

/// Collaborators of the coordinator, all with process-wide lifetime.
#[derive(Clone)]
pub struct Services {
    pub parser: Arc<dyn Parser>,
    pub router: Arc<dyn Router>,
    pub dispatcher: Arc<dyn RemoteDispatcher>,
    pub scope_settings: Option<Arc<dyn ScopeSettings>>,
    pub transactions: Arc<dyn TransactionManager>,
    pub catalog: Arc<dyn Catalog>,
    pub admission: Arc<dyn AdmissionQueue>,
    pub processes: Arc<dyn ProcessRegistry>,
    pub engine: Arc<dyn ExecutionEngine>,
    /// `None` disables the query cache regardless of settings.
    pub cache: Option<Arc<dyn QueryCache>>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub masker: Option<Arc<dyn DataMasker>>,
    pub distributed: Arc<dyn DistributedCoordinators>,
    pub async_status: Option<Arc<dyn AsyncStatusStore>>,
}

#[derive(Debug, Clone)]
pub enum QuerySource {
    Text(String),
    Statement(Arc<Statement>),
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Statement issued by the server itself rather than a client.
    pub internal: bool,
    pub stage: ProcessingStage,
    pub has_tail: bool,
    pub embedded_data: Option<Bytes>,
}

/// Recovery applied after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    /// Rerun without the cost-based optimizer.
    Optimizer,
    /// Rerun without perfect-shard distribution.
    PerfectShard,
}

impl FallbackKind {
    fn disable(&self, settings: &mut SessionConfig) {
        match self {
            FallbackKind::Optimizer => settings.enable_optimizer = false,
            FallbackKind::PerfectShard => settings.distributed_perfect_shard = false,
        }
    }
}

/// Outcome of one execution attempt.
pub enum Attempt {
    Done(ExecutionOutput),
    Retryable(FallbackKind, ExecError),
    Terminal(ExecError),
}

/// Pick the fallback for a failed execution, if any.
///
/// The optimizer path is checked first. A failure on the optimizer path with
/// optimizer fallback disabled is terminal, even if perfect-shard fallback
/// is enabled.
pub fn fallback_for(
    caps: InterpreterCapabilities,
    settings: &SessionConfig,
) -> Option<FallbackKind> {
    if caps.uses_optimizer {
        return settings
            .enable_optimizer_fallback
            .then_some(FallbackKind::Optimizer);
    }
    if !settings.enable_optimizer
        && caps.uses_perfect_shard
        && settings.distributed_perfect_shard
        && settings.fallback_perfect_shard
    {
        return Some(FallbackKind::PerfectShard);
    }
    None
}

fn attempt(interpreter: &mut dyn Interpreter, settings: &SessionConfig) -> Attempt {
    let caps = interpreter.capabilities();
    match interpreter.execute() {
        Ok(output) => Attempt::Done(output),
        Err(e) => match fallback_for(caps, settings) {
            Some(kind) => Attempt::Retryable(kind, e),
            None => Attempt::Terminal(e),
        },
    }
}

/// Where a prepared statement runs.
enum Placement {
    Local,
    Remote(Host),
}

/// Side effects opened for a statement, needed to finalize it.
#[derive(Default)]
struct Opened {
    transaction: Option<Arc<TransactionHandle>>,
    process_entry: Option<Arc<dyn ProcessEntry>>,
    cache_writer: Option<Arc<CacheWriter>>,
    served_from_cache: bool,
    fallback: bool,
}

struct Started {
    start_time: DateTime<Utc>,
    started: Instant,
    query_for_logging: String,
}

pub struct Coordinator {
    services: Services,
}

impl Coordinator {
    pub fn new(services: Services) -> Self {
        Coordinator { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    fn finalize_services(&self) -> FinalizeServices {
        FinalizeServices {
            transactions: self.services.transactions.clone(),
            telemetry: self.services.telemetry.clone(),
            distributed: self.services.distributed.clone(),
            async_status: self.services.async_status.clone(),
        }
    }

    /// Execute a statement.
    ///
    /// Returns the statement that ran along with a handle to its result.
    /// Statements routed to another server return a handle without local
    /// finalization.
    pub fn execute(
        &self,
        source: QuerySource,
        ctx: &mut ExecutionContext,
        opts: ExecuteOptions,
    ) -> Result<(Arc<Statement>, ResultHandle)> {
        let start_time = Utc::now();
        if !opts.internal && ctx.client.initial_query_start_time.is_none() {
            ctx.client.initial_query_start_time = Some(start_time);
        }

        let started_at = Instant::now();
        // Logged if parsing fails. Pre-parsed statements log their own text.
        let raw_prefix = match &source {
            QuerySource::Text(text) if !opts.internal && ctx.settings.max_query_size != 0 => {
                char_prefix(text, ctx.settings.max_query_size).to_string()
            }
            QuerySource::Text(text) => text.clone(),
            QuerySource::Statement(_) => String::new(),
        };

        let mut opened = Opened::default();

        let mut stmt = None;
        let prepared = self.prepare(source, ctx, &opts, &mut stmt, &mut opened);

        let started = Started {
            start_time,
            started: started_at,
            query_for_logging: self.query_for_logging(
                stmt.as_ref().map_or(raw_prefix.as_str(), |s| s.text.as_str()),
                ctx,
                &opts,
            ),
        };

        let placement = match prepared {
            Ok(placement) => placement,
            Err(e) => {
                let snapshot = self.snapshot(ctx, stmt.as_deref(), &opts, &started, opened);
                exception_before_start(&self.finalize_services(), snapshot, &e);
                return Err(e);
            }
        };
        let stmt = stmt.required("parsed statement")?;

        if let Placement::Remote(host) = placement {
            debug!(query_id = %ctx.client.query_id, %host, "forwarding query");
            ctx.initialize_external_tables();
            let output = self.services.dispatcher.execute_remote(&host, &stmt, ctx)?;
            return Ok((stmt, ResultHandle::remote(ctx.client.query_id.clone(), output)));
        }

        match self.run(&stmt, ctx, &opts, &started, &mut opened) {
            Ok(output) => {
                let served_from_cache = opened.served_from_cache;
                let snapshot = self.snapshot(ctx, Some(&stmt), &opts, &started, opened);
                let services = self.finalize_services();
                emit_query_start(&services, &snapshot);

                let pair = Arc::new(FinalizationPair::new(services, snapshot));
                let handle = ResultHandle::with_finalization(
                    ctx.client.query_id.clone(),
                    output,
                    served_from_cache,
                    pair,
                );
                Ok((stmt, handle))
            }
            Err(e) => {
                let snapshot = self.snapshot(ctx, Some(&stmt), &opts, &started, opened);
                let pair = FinalizationPair::new(self.finalize_services(), snapshot);
                Err(pair.on_exception(e))
            }
        }
    }

    /// Mask and cut the query text, then announce it in the text log.
    fn query_for_logging(
        &self,
        text: &str,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions,
    ) -> String {
        let query = prepare_query_for_logging(
            text,
            ctx.settings.log_queries_cut_to_length,
            self.services.masker.as_deref(),
            self.services.telemetry.as_ref(),
        );

        let line = query_log_line(
            &query,
            &ctx.client,
            &ctx.settings.log_comment,
            ctx.settings.max_query_size,
            opts.internal,
        );
        debug!(query_id = %ctx.client.query_id, "{line}");
        if !opts.internal {
            if let Some(trace) = ctx.client.trace.as_ref().filter(|t| !t.trace_id.is_nil()) {
                trace!(
                    query_id = %ctx.client.query_id,
                    "OpenTelemetry traceparent '{}'",
                    trace.traceparent()
                );
            }
        }

        query
    }

    /// Everything up to building the interpreter.
    fn prepare(
        &self,
        source: QuerySource,
        ctx: &mut ExecutionContext,
        opts: &ExecuteOptions,
        stmt_out: &mut Option<Arc<Statement>>,
        opened: &mut Opened,
    ) -> Result<Placement> {
        let stmt = match source {
            QuerySource::Statement(stmt) => stmt,
            QuerySource::Text(text) => {
                let limits = ParseLimits {
                    max_query_size: if opts.internal {
                        0
                    } else {
                        ctx.settings.max_query_size
                    },
                    max_parser_depth: ctx.settings.max_parser_depth,
                };
                let stmt = self.services.parser.parse(&text, limits)?;
                stmt.check_limits(ctx.settings.max_ast_depth, ctx.settings.max_ast_elements)?;
                Arc::new(stmt)
            }
        };
        *stmt_out = Some(stmt.clone());

        if ctx.role.is_coordinator() {
            self.apply_scope_settings(&stmt, ctx);
        }

        if stmt.is_ddl() {
            self.implicit_commit(ctx)?;
        }

        if ctx.role.is_coordinator()
            && (ctx.in_interactive_transaction()
                || ctx.settings.enable_auto_query_forwarding
                || ctx.settings.use_query_cache)
        {
            if let Some(host) = self.services.router.resolve(&stmt, ctx)? {
                if !host.is_local(&ctx.local_address) {
                    return Ok(Placement::Remote(host));
                }
            }
        }

        ctx.settings.apply_all(stmt.settings.iter())?;
        if ctx.settings.enable_distributed_stages {
            ctx.settings.enable_optimizer = true;
            ctx.settings.enable_distributed_stages = false;
        }
        if opts.internal {
            ctx.settings.enable_optimizer = false;
        }

        if ctx.role.is_transactional() && ctx.transaction.is_none() {
            opened.transaction = self.attach_transaction(&stmt, ctx)?;
        }

        if ctx.role.is_coordinator() && ctx.transaction.is_some() {
            if ctx.execution_group.is_none() {
                ctx.execution_group = self.services.router.resolve_execution_group(&stmt, ctx)?;
            }
            if !opts.internal
                && !stmt.is_introspection()
                && stmt.is_admission_eligible()
                && ctx.settings.enable_query_queue
            {
                self.admit(ctx)?;
            }
        }

        Ok(Placement::Local)
    }

    fn apply_scope_settings(&self, stmt: &Statement, ctx: &mut ExecutionContext) {
        let Some(scope) = &self.services.scope_settings else {
            return;
        };
        let Some(overrides) = scope.overrides_for(stmt, ctx) else {
            return;
        };
        match ctx.settings.apply_defaults(overrides.iter()) {
            Ok(n) => debug!(applied = n, "applied scope setting overrides"),
            Err(e) => warn!(%e, "ignoring invalid scope setting override"),
        }
    }

    /// Commit the session's explicit transaction ahead of a DDL statement.
    ///
    /// The transaction leaves the session either way. A failed commit
    /// finishes it so it is not left open.
    fn implicit_commit(&self, ctx: &ExecutionContext) -> Result<()> {
        let Some(session) = &ctx.session else {
            return Ok(());
        };
        let Some(handle) = session.explicit_transaction() else {
            return Ok(());
        };
        let result = self.services.transactions.commit(&handle);
        let explicit = session.end();
        match result {
            Ok(()) => {
                info!(
                    query_id = %ctx.client.query_id,
                    txn_id = %handle.id,
                    statements = explicit.map(|t| t.statements.len()).unwrap_or(0),
                    "implicitly committed session transaction before DDL"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    query_id = %ctx.client.query_id,
                    txn_id = %handle.id,
                    %e,
                    "implicit commit failed, finishing session transaction"
                );
                self.services.transactions.finish(&handle);
                Err(e)
            }
        }
    }

    fn attach_transaction(
        &self,
        stmt: &Statement,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<Arc<TransactionHandle>>> {
        let txn = if ctx.role.is_coordinator() {
            let explicit = ctx.explicit_transaction();
            let read_only = stmt.is_read_only();
            let primary_id = explicit.as_ref().map(|txn| txn.id);
            let txn = self.services.transactions.create(CreateTransactionOptions {
                read_only,
                force_clean_by_dm: ctx.settings.force_clean_transaction_by_dm,
                async_post_commit: ctx.settings.async_post_commit,
                primary_id,
            })?;
            if explicit.is_some() && !read_only {
                if let Some(session) = &ctx.session {
                    session.append_statement(&stmt.text);
                }
            }
            txn
        } else {
            let Some(target) = stmt.worker_transaction_target() else {
                return Ok(None);
            };
            if !ctx.is_initial_query() {
                return Ok(None);
            }
            let table = target.qualified(&ctx.current_database);
            let info = match self.services.catalog.table_info(&table)? {
                Some(info) if info.transactional => info,
                _ => return Ok(None),
            };
            self.services
                .transactions
                .create_for_host(info.owner.as_ref())?
        };

        debug!(
            query_id = %ctx.client.query_id,
            txn_id = %txn.id,
            read_only = txn.read_only,
            "attached transaction"
        );
        ctx.transaction = Some(txn.clone());
        Ok(Some(txn))
    }

    fn admit(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let Some(group) = ctx.execution_group.clone() else {
            return Ok(());
        };
        let outcome = self.services.admission.enqueue(
            &ctx.client.query_id,
            &group,
            ctx.settings.query_queue_timeout(),
        )?;
        match outcome {
            AdmissionOutcome::Admitted { group: reassigned } => {
                if let Some(reassigned) = reassigned {
                    if reassigned != group {
                        info!(
                            query_id = %ctx.client.query_id,
                            worker_group = %reassigned.worker_group,
                            "admission reassigned worker group"
                        );
                    }
                    ctx.execution_group = Some(reassigned);
                }
                Ok(())
            }
            AdmissionOutcome::Rejected(reason) => Err(ExecError::Admission {
                query_id: ctx.client.query_id.clone(),
                reason,
            }),
        }
    }

    /// Build, execute and wrap the result.
    fn run(
        &self,
        stmt: &Arc<Statement>,
        ctx: &mut ExecutionContext,
        opts: &ExecuteOptions,
        started: &Started,
        opened: &mut Opened,
    ) -> Result<Output> {
        let interpreter_opts = InterpreterOptions {
            stage: opts.stage,
            internal: opts.internal,
            has_tail: opts.has_tail || stmt.has_tail,
            embedded_data: opts.embedded_data.clone(),
        };
        let mut interpreter = self
            .services
            .engine
            .build_interpreter(stmt, ctx, &interpreter_opts)?;

        if !opts.internal && !interpreter.ignore_quota() {
            if let Some(quota) = &ctx.quota {
                quota.used(QuotaKind::Queries, 1, true)?;
                if let Some(kind) = stmt.quota_kind() {
                    quota.used(kind, 1, true)?;
                }
                quota.check_exceeded(QuotaKind::Errors)?;
            }
        }

        if !opts.internal && !stmt.is_introspection() {
            let entry = self
                .services
                .processes
                .insert(&started.query_for_logging, stmt, ctx)?;
            ctx.process_entry = Some(Arc::downgrade(&entry));
            let cancelled = entry.is_cancelled();
            opened.process_entry = Some(entry);
            if cancelled {
                return Err(ExecError::Cancelled {
                    query_id: ctx.client.query_id.clone(),
                });
            }
        }

        let mut exec = match attempt(interpreter.as_mut(), &ctx.settings) {
            Attempt::Done(exec) => exec,
            Attempt::Terminal(e) => return Err(e),
            Attempt::Retryable(kind, e) => {
                warn!(
                    query_id = %ctx.client.query_id,
                    %e,
                    fallback = ?kind,
                    "query failed, retrying with fallback"
                );
                kind.disable(&mut ctx.settings);
                opened.fallback = true;
                interpreter = self
                    .services
                    .engine
                    .build_interpreter(stmt, ctx, &interpreter_opts)?;
                interpreter.execute()?
            }
        };

        if let Some(table) = exec.insertion_table.take() {
            ctx.insertion_table = Some(table);
        }

        let cache = self.cacheable(stmt, ctx, opts, &exec);
        let mut freshness = Timestamp::ZERO;
        if let Some(cache) = &cache {
            freshness = self.source_freshness(&exec, ctx)?;
            if ctx.settings.enable_reads_from_query_cache && !freshness.is_zero() {
                let key = CacheKey::new(stmt, &exec.schema, ctx);
                let reader = cache.create_reader(&key, freshness);
                if let Some(stream) = reader.into_stream() {
                    debug!(query_id = %ctx.client.query_id, "serving query from cache");
                    exec.output = Output::Pull(stream);
                    opened.served_from_cache = true;
                }
            }
        }

        let mut output = exec.output;
        let mut truncating = false;

        if opts.stage == ProcessingStage::Complete && !interpreter.ignore_limits() {
            if let Output::Pull(stream) = output {
                let limits = SizeLimits::from_settings(&ctx.settings);
                truncating = limits.may_truncate();
                let quota = if opts.internal || interpreter.ignore_quota() {
                    None
                } else {
                    ctx.quota.clone()
                };
                output = if limits.is_unlimited() && quota.is_none() {
                    Output::Pull(stream)
                } else {
                    Output::Pull(Box::pin(LimitsStream::new(stream, limits, quota)))
                };
            }
        }

        if let Some(cache) = cache {
            // A result cut short by a break-mode limit is not the full result.
            if truncating && !opened.served_from_cache {
                debug!(
                    query_id = %ctx.client.query_id,
                    "result size limit may truncate, not caching query result"
                );
            }
            let writable = !opened.served_from_cache
                && !truncating
                && ctx.settings.enable_writes_to_query_cache
                && (stmt.deterministic
                    || ctx
                        .settings
                        .query_cache_store_results_of_queries_with_nondeterministic_functions);
            if writable {
                if let Output::Pull(stream) = output {
                    let key = CacheKey::new(stmt, &exec.schema, ctx);
                    let runs = cache.record_run(&key) as u64;
                    output = if runs > ctx.settings.query_cache_min_query_runs {
                        let writer = cache
                            .create_writer(key, WriterOptions::from_settings(&ctx.settings, freshness));
                        opened.cache_writer = Some(writer.clone());
                        Output::Pull(Box::pin(CacheWriteStream::new(stream, writer)))
                    } else {
                        debug!(
                            query_id = %ctx.client.query_id,
                            runs,
                            "not enough runs to cache query result"
                        );
                        Output::Pull(stream)
                    };
                }
            }
        }

        Ok(output)
    }

    /// The query cache, if this execution may use it at all.
    fn cacheable(
        &self,
        stmt: &Statement,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions,
        exec: &ExecutionOutput,
    ) -> Option<Arc<dyn QueryCache>> {
        if opts.internal || stmt.is_explain() || !ctx.settings.use_query_cache {
            return None;
        }
        if !exec.output.is_pull() {
            return None;
        }
        self.services.cache.clone()
    }

    /// Last update time across all source tables of the result.
    ///
    /// Zero when the sources are unknown. Without transactional caching
    /// any cached result is fresh enough.
    fn source_freshness(&self, exec: &ExecutionOutput, ctx: &ExecutionContext) -> Result<Timestamp> {
        let Some(tables) = &exec.source_tables else {
            return Ok(Timestamp::ZERO);
        };
        if !ctx.settings.enable_transactional_query_cache {
            return Ok(Timestamp(1));
        }
        let mut freshness = Timestamp::ZERO;
        for table in tables {
            let table = table.qualified(&ctx.current_database);
            freshness = freshness.max(self.services.catalog.last_update_time(&table)?);
        }
        Ok(freshness)
    }

    fn snapshot(
        &self,
        ctx: &ExecutionContext,
        stmt: Option<&Statement>,
        opts: &ExecuteOptions,
        started: &Started,
        opened: Opened,
    ) -> FinalizationSnapshot {
        FinalizationSnapshot {
            query_id: ctx.client.query_id.clone(),
            initial_query_id: ctx.client.initial_query_id.clone(),
            user: ctx.client.user.clone(),
            client_address: ctx.client.address.clone(),
            current_database: ctx.current_database.clone(),
            query_for_logging: started.query_for_logging.clone(),
            statement_kind: stmt.map(|s| s.kind_name()).unwrap_or("Unknown"),
            is_select: stmt.is_some_and(|s| s.is_select()),
            is_insert: stmt.is_some_and(|s| s.is_insert()),
            internal: opts.internal,
            start_time: started.start_time,
            started: started.started,
            log: LogSettings::from_settings(&ctx.settings),
            transaction: opened.transaction,
            cache_writer: opened.cache_writer,
            process_entry: opened.process_entry,
            quota: if opts.internal { None } else { ctx.quota.clone() },
            async_query_id: ctx.async_query_id.clone(),
            trace: ctx.client.trace.clone(),
            served_from_cache: opened.served_from_cache,
            fallback: opened.fallback,
        }
    }
}
