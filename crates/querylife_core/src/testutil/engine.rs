//! Execution engine over in-memory tables with scripted failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use querylife_error::{ExecError, Result};

use super::MemoryCatalog;
use crate::context::ExecutionContext;
use crate::interpreter::{
    ColumnDesc,
    ExecutionEngine,
    ExecutionOutput,
    Interpreter,
    InterpreterCapabilities,
    InterpreterOptions,
    OutputSchema,
};
use crate::result::{Batch, BatchSink, BatchStream, Output};
use crate::statement::{Statement, StatementKind, TableRef};

/// Settings observed when an interpreter was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildRecord {
    pub enable_optimizer: bool,
    pub distributed_perfect_shard: bool,
}

type Tables = Arc<Mutex<HashMap<TableRef, Vec<Batch>>>>;

#[derive(Debug, Default)]
struct Script {
    build_failures: VecDeque<ExecError>,
    execute_failures: VecDeque<ExecError>,
    stream_failures: VecDeque<ExecError>,
    capabilities: InterpreterCapabilities,
    ignore_limits: bool,
}

/// Engine reading and writing [`Batch`]es kept in memory.
///
/// SELECT reads the table named after FROM, INSERT appends pushed batches to
/// its target table and bumps the table's update time in the catalog.
pub struct TestEngine {
    tables: Tables,
    catalog: Arc<MemoryCatalog>,
    source_reads: Arc<AtomicU64>,
    builds: Mutex<Vec<BuildRecord>>,
    executions: Arc<AtomicUsize>,
    script: Mutex<Script>,
}

impl TestEngine {
    pub fn new(catalog: Arc<MemoryCatalog>) -> Self {
        TestEngine {
            tables: Arc::new(Mutex::new(HashMap::new())),
            catalog,
            source_reads: Arc::new(AtomicU64::new(0)),
            builds: Mutex::new(Vec::new()),
            executions: Arc::new(AtomicUsize::new(0)),
            script: Mutex::new(Script::default()),
        }
    }

    /// Create (or replace) a table with the given rows.
    pub fn create_table(&self, table: TableRef, batches: Vec<Batch>) {
        self.catalog.add_table(table.clone(), true, None);
        self.tables.lock().insert(table, batches);
    }

    pub fn table_rows(&self, table: &TableRef) -> u64 {
        self.tables
            .lock()
            .get(table)
            .map(|batches| batches.iter().map(|b| b.num_rows).sum())
            .unwrap_or(0)
    }

    /// Number of batches read from source tables.
    pub fn source_reads(&self) -> u64 {
        self.source_reads.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> Vec<BuildRecord> {
        self.builds.lock().clone()
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn fail_next_build(&self, err: ExecError) {
        self.script.lock().build_failures.push_back(err);
    }

    pub fn fail_next_execute(&self, err: ExecError) {
        self.script.lock().execute_failures.push_back(err);
    }

    /// Make the next planned pull result fail after its first batch.
    pub fn fail_next_stream(&self, err: ExecError) {
        self.script.lock().stream_failures.push_back(err);
    }

    /// Planning paths reported by interpreters, as far as the settings they
    /// are built with allow.
    pub fn set_capabilities(&self, caps: InterpreterCapabilities) {
        self.script.lock().capabilities = caps;
    }

    pub fn set_ignore_limits(&self, ignore: bool) {
        self.script.lock().ignore_limits = ignore;
    }

    fn read_stream(&self, batches: Vec<Batch>, failure: Option<ExecError>) -> BatchStream {
        let reads = self.source_reads.clone();
        let rows = futures::stream::iter(batches.into_iter().map(Ok)).inspect(move |_| {
            reads.fetch_add(1, Ordering::SeqCst);
        });

        match failure {
            Some(err) => rows
                .take(1)
                .chain(futures::stream::iter([Err(err)]))
                .boxed(),
            None => rows.boxed(),
        }
    }

    fn plan(&self, stmt: &Statement, ctx: &ExecutionContext) -> Result<ExecutionOutput> {
        let schema = OutputSchema::new(vec![ColumnDesc::new("value", "UInt64")]);
        let failure = self.script.lock().stream_failures.pop_front();

        let exec = match &stmt.kind {
            StatementKind::Select | StatementKind::SelectUnion => {
                let sources = source_tables(stmt)
                    .into_iter()
                    .map(|t| t.qualified(&ctx.current_database))
                    .collect::<Vec<_>>();
                let batches = if sources.is_empty() {
                    vec![Batch::rows(1, Bytes::from_static(&[1]))]
                } else {
                    let tables = self.tables.lock();
                    let mut batches = Vec::new();
                    for table in &sources {
                        let rows = tables
                            .get(table)
                            .ok_or_else(|| ExecError::Execution(format!("unknown table {table}")))?;
                        batches.extend(rows.iter().cloned());
                    }
                    batches
                };
                let mut exec =
                    ExecutionOutput::new(Output::Pull(self.read_stream(batches, failure)), schema);
                exec.source_tables = Some(sources);
                exec
            }
            StatementKind::Explain(_) | StatementKind::ShowProcesslist => {
                let batch = Batch::rows(1, Bytes::from(stmt.kind_name().as_bytes().to_vec()));
                ExecutionOutput::new(Output::Pull(self.read_stream(vec![batch], failure)), schema)
            }
            StatementKind::Insert {
                table: Some(table), ..
            } => {
                let table = table.qualified(&ctx.current_database);
                let sink = TableSink {
                    table: table.clone(),
                    tables: self.tables.clone(),
                    catalog: self.catalog.clone(),
                    pending: Vec::new(),
                };
                let mut exec = ExecutionOutput::new(Output::Push(Box::new(sink)), schema);
                exec.insertion_table = Some(table);
                exec
            }
            _ => ExecutionOutput::new(Output::Empty, OutputSchema::default()),
        };
        Ok(exec)
    }
}

/// Tables named after FROM or JOIN.
fn source_tables(stmt: &Statement) -> Vec<TableRef> {
    let words: Vec<&str> = stmt.normalized.split_whitespace().collect();
    words
        .windows(2)
        .filter(|w| w[0].eq_ignore_ascii_case("FROM") || w[0].eq_ignore_ascii_case("JOIN"))
        .map(|w| {
            let name = w[1].trim_end_matches(';');
            match name.split_once('.') {
                Some((db, table)) => TableRef::new(Some(db), table),
                None => TableRef::new(None, name),
            }
        })
        .collect()
}

impl ExecutionEngine for TestEngine {
    fn build_interpreter(
        &self,
        stmt: &Arc<Statement>,
        ctx: &ExecutionContext,
        _opts: &InterpreterOptions,
    ) -> Result<Box<dyn Interpreter>> {
        self.builds.lock().push(BuildRecord {
            enable_optimizer: ctx.settings.enable_optimizer,
            distributed_perfect_shard: ctx.settings.distributed_perfect_shard,
        });

        let mut script = self.script.lock();
        if let Some(err) = script.build_failures.pop_front() {
            return Err(err);
        }

        let caps = InterpreterCapabilities {
            uses_optimizer: script.capabilities.uses_optimizer && ctx.settings.enable_optimizer,
            uses_perfect_shard: script.capabilities.uses_perfect_shard
                && ctx.settings.distributed_perfect_shard,
        };
        let failure = script.execute_failures.pop_front();
        let ignore_limits = script.ignore_limits;
        drop(script);

        Ok(Box::new(TestInterpreter {
            planned: Some(self.plan(stmt, ctx)),
            failure,
            caps,
            ignore_limits,
            executions: self.executions.clone(),
        }))
    }
}

struct TestInterpreter {
    planned: Option<Result<ExecutionOutput>>,
    failure: Option<ExecError>,
    caps: InterpreterCapabilities,
    ignore_limits: bool,
    executions: Arc<AtomicUsize>,
}

impl Interpreter for TestInterpreter {
    fn capabilities(&self) -> InterpreterCapabilities {
        self.caps
    }

    fn ignore_limits(&self) -> bool {
        self.ignore_limits
    }

    fn execute(&mut self) -> Result<ExecutionOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        self.planned
            .take()
            .unwrap_or_else(|| Err(ExecError::Execution("interpreter executed twice".to_string())))
    }
}

/// Appends pushed batches to a table once the push completes.
struct TableSink {
    table: TableRef,
    tables: Tables,
    catalog: Arc<MemoryCatalog>,
    pending: Vec<Batch>,
}

impl BatchSink for TableSink {
    fn push(&mut self, batch: Batch) -> Result<()> {
        self.pending.push(batch);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        self.tables
            .lock()
            .entry(self.table.clone())
            .or_default()
            .extend(pending);
        self.catalog.bump_update(&self.table);
        Ok(())
    }
}
