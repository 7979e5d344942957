use std::fmt;

use querylife_error::{ExecError, Result, SizeLimit};

use crate::config::SettingValue;
use crate::quota::QuotaKind;

/// A possibly database-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub database: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(database: Option<&str>, table: &str) -> Self {
        TableRef {
            database: database.map(|s| s.to_string()),
            table: table.to_string(),
        }
    }

    /// Fill in the database if the reference is unqualified.
    pub fn qualified(&self, default_database: &str) -> TableRef {
        TableRef {
            database: Some(
                self.database
                    .clone()
                    .unwrap_or_else(|| default_database.to_string()),
            ),
            table: self.table.clone(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(db) => write!(f, "{db}.{}", self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Drop,
    Detach,
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlterCommandKind {
    AttachPartition,
    DropPartition,
    DropPartitionWhere,
    AddColumn,
    DropColumn,
    ModifyColumn,
    ModifySetting,
    Other,
}

/// A single command of an ALTER statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterCommand {
    pub kind: AlterCommandKind,
    /// ATTACH ... FROM a detached directory.
    pub from_detached: bool,
    /// ATTACH PARTS.
    pub parts: bool,
    /// DROP PARTITION issued as DETACH PARTITION.
    pub detach: bool,
}

impl AlterCommand {
    pub fn new(kind: AlterCommandKind) -> Self {
        AlterCommand {
            kind,
            from_detached: false,
            parts: false,
            detach: false,
        }
    }

    /// Whether this command only moves data in or out of a table.
    fn is_data_manipulation(&self) -> bool {
        if self.from_detached || self.parts {
            return true;
        }
        matches!(
            self.kind,
            AlterCommandKind::DropPartition | AlterCommandKind::DropPartitionWhere
        ) && !self.detach
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainKind {
    Ast,
    Plan,
    Pipeline,
    Analyze,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    Dedup,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    SelectUnion,
    Insert {
        /// Target table, `None` when inserting into a table function.
        table: Option<TableRef>,
        /// INSERT ... SELECT.
        select: bool,
    },
    Delete {
        table: TableRef,
    },
    Update {
        table: TableRef,
    },
    Create,
    Drop(DropKind),
    Rename,
    Alter {
        table: TableRef,
        commands: Vec<AlterCommand>,
    },
    System {
        kind: SystemKind,
        table: Option<TableRef>,
    },
    Explain(ExplainKind),
    ShowProcesslist,
    Begin,
    Commit,
    Rollback,
    Set,
    Other,
}

/// A parsed statement.
///
/// The parser is external; this is the narrow view of its output the
/// coordinator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    /// Statement text, excluding any inline INSERT data.
    pub text: String,
    /// Canonical formatting of the statement, independent of whitespace and
    /// keyword casing.
    pub normalized: String,
    /// Settings from an embedded SETTINGS clause, in order.
    pub settings: Vec<(String, SettingValue)>,
    /// False if the statement calls non-deterministic functions.
    pub deterministic: bool,
    pub depth: u64,
    pub elements: u64,
    /// For INSERT with inline data, whether more data follows the text that
    /// was parsed.
    pub has_tail: bool,
}

impl Statement {
    pub fn new(kind: StatementKind, text: impl Into<String>) -> Self {
        let text = text.into();
        Statement {
            kind,
            normalized: text.clone(),
            text,
            settings: Vec::new(),
            deterministic: true,
            depth: 1,
            elements: 1,
            has_tail: false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            StatementKind::Select => "Select",
            StatementKind::SelectUnion => "SelectUnion",
            StatementKind::Insert { .. } => "Insert",
            StatementKind::Delete { .. } => "Delete",
            StatementKind::Update { .. } => "Update",
            StatementKind::Create => "Create",
            StatementKind::Drop(_) => "Drop",
            StatementKind::Rename => "Rename",
            StatementKind::Alter { .. } => "Alter",
            StatementKind::System { .. } => "System",
            StatementKind::Explain(_) => "Explain",
            StatementKind::ShowProcesslist => "ShowProcesslist",
            StatementKind::Begin => "Begin",
            StatementKind::Commit => "Commit",
            StatementKind::Rollback => "Rollback",
            StatementKind::Set => "Set",
            StatementKind::Other => "Other",
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self.kind, StatementKind::Select | StatementKind::SelectUnion)
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, StatementKind::Insert { .. })
    }

    pub fn is_explain(&self) -> bool {
        matches!(self.kind, StatementKind::Explain(_))
    }

    /// Statements that inspect the process list and so must not appear in
    /// it themselves.
    pub fn is_introspection(&self) -> bool {
        matches!(self.kind, StatementKind::ShowProcesslist)
    }

    /// DDL statements are not composable with explicit multi-statement
    /// transactions.
    ///
    /// An ALTER whose single command attaches detached data/parts, or drops
    /// a partition without detaching it, only manipulates data and is not
    /// DDL. A truncating DROP is not DDL either.
    pub fn is_ddl(&self) -> bool {
        match &self.kind {
            StatementKind::Alter { commands, .. } => {
                !(commands.len() == 1 && commands[0].is_data_manipulation())
            }
            StatementKind::Create | StatementKind::Rename => true,
            StatementKind::Drop(kind) => *kind != DropKind::Truncate,
            _ => false,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Select
                | StatementKind::SelectUnion
                | StatementKind::Explain(_)
                | StatementKind::ShowProcesslist
        )
    }

    /// Statement kinds that go through admission control.
    pub fn is_admission_eligible(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Select
                | StatementKind::SelectUnion
                | StatementKind::Insert { .. }
                | StatementKind::Delete { .. }
                | StatementKind::Update { .. }
        )
    }

    /// Table whose owning server must host the transaction when the
    /// statement runs on a worker.
    pub fn worker_transaction_target(&self) -> Option<&TableRef> {
        match &self.kind {
            StatementKind::Insert { table, .. } => table.as_ref(),
            StatementKind::System {
                kind: SystemKind::Dedup,
                table,
            } => table.as_ref(),
            _ => None,
        }
    }

    /// Statement-kind specific quota charged in addition to the per-query
    /// quota.
    pub fn quota_kind(&self) -> Option<QuotaKind> {
        if self.is_select() {
            Some(QuotaKind::QuerySelects)
        } else if self.is_insert() {
            Some(QuotaKind::QueryInserts)
        } else {
            None
        }
    }

    /// Check the parsed size against the depth and element limits. A limit
    /// of zero disables the check.
    pub fn check_limits(&self, max_depth: u64, max_elements: u64) -> Result<()> {
        if max_depth != 0 && self.depth > max_depth {
            return Err(ExecError::SizeLimitExceeded {
                what: SizeLimit::AstDepth,
                limit: max_depth,
                actual: self.depth,
            });
        }
        if max_elements != 0 && self.elements > max_elements {
            return Err(ExecError::SizeLimitExceeded {
                what: SizeLimit::AstElements,
                limit: max_elements,
                actual: self.elements,
            });
        }
        Ok(())
    }

    /// Stable digest of the normalized statement.
    pub fn fingerprint(&self) -> [u8; 16] {
        md5::compute(self.normalized.as_bytes()).0
    }
}
