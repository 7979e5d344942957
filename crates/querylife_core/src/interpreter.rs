use std::sync::Arc;

use bytes::Bytes;
use querylife_error::Result;

use crate::context::ExecutionContext;
use crate::result::Output;
use crate::statement::{Statement, TableRef};

/// How far a statement is processed on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingStage {
    FetchColumns,
    /// Partial aggregation state, merged by the initiator.
    WithMergeableState,
    #[default]
    Complete,
}

#[derive(Debug, Clone, Default)]
pub struct InterpreterOptions {
    pub stage: ProcessingStage,
    pub internal: bool,
    pub has_tail: bool,
    /// Inline data following an INSERT statement.
    pub embedded_data: Option<Bytes>,
}

/// Which planning paths an interpreter took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterpreterCapabilities {
    pub uses_optimizer: bool,
    pub uses_perfect_shard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub datatype: String,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, datatype: impl Into<String>) -> Self {
        ColumnDesc {
            name: name.into(),
            datatype: datatype.into(),
        }
    }
}

/// Columns of a statement's result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputSchema {
    pub columns: Vec<ColumnDesc>,
}

impl OutputSchema {
    pub fn new(columns: Vec<ColumnDesc>) -> Self {
        OutputSchema { columns }
    }

    pub fn fingerprint(&self) -> [u8; 16] {
        let mut ctx = md5::Context::new();
        for col in &self.columns {
            ctx.consume(col.name.as_bytes());
            ctx.consume([0u8]);
            ctx.consume(col.datatype.as_bytes());
            ctx.consume([0u8]);
        }
        ctx.compute().0
    }
}

/// What an interpreter produced.
pub struct ExecutionOutput {
    pub output: Output,
    pub schema: OutputSchema,
    /// All tables read by the output, `None` when the engine can't tell.
    pub source_tables: Option<Vec<TableRef>>,
    /// Table written by an INSERT. `None` for table functions.
    pub insertion_table: Option<TableRef>,
}

impl ExecutionOutput {
    pub fn new(output: Output, schema: OutputSchema) -> Self {
        ExecutionOutput {
            output,
            schema,
            source_tables: None,
            insertion_table: None,
        }
    }
}

pub trait Interpreter: Send {
    fn capabilities(&self) -> InterpreterCapabilities {
        InterpreterCapabilities::default()
    }

    fn ignore_quota(&self) -> bool {
        false
    }

    fn ignore_limits(&self) -> bool {
        false
    }

    fn execute(&mut self) -> Result<ExecutionOutput>;
}

/// Builds interpreters for statements.
pub trait ExecutionEngine: Sync + Send {
    fn build_interpreter(
        &self,
        stmt: &Arc<Statement>,
        ctx: &ExecutionContext,
        opts: &InterpreterOptions,
    ) -> Result<Box<dyn Interpreter>>;
}
