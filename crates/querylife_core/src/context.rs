use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::process::ProcessEntry;
use crate::quota::Quota;
use crate::statement::TableRef;
use crate::txn::TransactionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryKind {
    /// Sent by a client.
    #[default]
    Initial,
    /// Sent by another server on behalf of an initial query.
    Secondary,
}

/// Role of the server running the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Accepts client statements and originates transactions.
    Coordinator,
    /// Executes work on behalf of a coordinator.
    Worker,
    /// Single node deployment without a transaction log.
    Standalone,
}

impl NodeRole {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, NodeRole::Coordinator)
    }

    /// Roles that attach transactions to statements.
    pub fn is_transactional(&self) -> bool {
        matches!(self, NodeRole::Coordinator | NodeRole::Worker)
    }
}

/// Distributed tracing context propagated by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span_id: u64,
    pub parent_span_id: u64,
    pub trace_state: Option<String>,
    pub trace_flags: u8,
}

impl TraceContext {
    /// W3C `traceparent` header value.
    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{:016x}-{:02x}",
            self.trace_id.simple(),
            self.span_id,
            self.trace_flags
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub query_id: String,
    pub initial_query_id: String,
    pub user: String,
    pub address: String,
    pub query_kind: QueryKind,
    pub trace: Option<TraceContext>,
    pub initial_query_start_time: Option<DateTime<Utc>>,
}

impl ClientInfo {
    pub fn new(user: impl Into<String>) -> Self {
        let query_id = Uuid::new_v4().to_string();
        ClientInfo {
            initial_query_id: query_id.clone(),
            query_id,
            user: user.into(),
            ..Default::default()
        }
    }
}

/// Logical warehouse and worker group pair subject to admission control.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionGroup {
    pub warehouse: String,
    pub worker_group: String,
}

impl ExecutionGroup {
    pub fn new(warehouse: impl Into<String>, worker_group: impl Into<String>) -> Self {
        ExecutionGroup {
            warehouse: warehouse.into(),
            worker_group: worker_group.into(),
        }
    }
}

/// Transaction opened with BEGIN in an interactive session.
#[derive(Debug, Clone)]
pub struct ExplicitTransaction {
    pub handle: Arc<TransactionHandle>,
    /// Non read-only statements executed in the transaction.
    pub statements: Vec<String>,
}

/// State shared by all statements of one client session.
#[derive(Debug, Default)]
pub struct SessionContext {
    explicit: Mutex<Option<ExplicitTransaction>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, handle: Arc<TransactionHandle>) {
        *self.explicit.lock() = Some(ExplicitTransaction {
            handle,
            statements: Vec::new(),
        });
    }

    pub fn explicit_transaction(&self) -> Option<Arc<TransactionHandle>> {
        self.explicit.lock().as_ref().map(|t| t.handle.clone())
    }

    /// Remove the explicit transaction, returning it.
    pub fn end(&self) -> Option<ExplicitTransaction> {
        self.explicit.lock().take()
    }

    pub fn append_statement(&self, text: &str) {
        if let Some(txn) = self.explicit.lock().as_mut() {
            txn.statements.push(text.to_string());
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.explicit
            .lock()
            .as_ref()
            .map(|t| t.statements.clone())
            .unwrap_or_default()
    }
}

/// Mutable state for executing a single statement.
pub struct ExecutionContext {
    pub settings: SessionConfig,
    pub client: ClientInfo,
    pub role: NodeRole,
    /// Rpc address of this server.
    pub local_address: String,
    pub current_database: String,
    pub session: Option<Arc<SessionContext>>,
    /// Transaction bound to the statement.
    pub transaction: Option<Arc<TransactionHandle>>,
    pub process_entry: Option<Weak<dyn ProcessEntry>>,
    pub execution_group: Option<ExecutionGroup>,
    pub quota: Option<Arc<dyn Quota>>,
    /// Id under which the status of an asynchronously executed query is
    /// tracked.
    pub async_query_id: Option<String>,
    /// External tables sent along with the query that haven't been read yet.
    pub pending_external_tables: Vec<String>,
    pub external_tables: Vec<String>,
    /// Table written by an INSERT, as reported by the engine.
    pub insertion_table: Option<TableRef>,
}

impl ExecutionContext {
    pub fn new(role: NodeRole, client: ClientInfo) -> Self {
        ExecutionContext {
            settings: SessionConfig::default(),
            client,
            role,
            local_address: String::new(),
            current_database: "default".to_string(),
            session: None,
            transaction: None,
            process_entry: None,
            execution_group: None,
            quota: None,
            async_query_id: None,
            pending_external_tables: Vec::new(),
            external_tables: Vec::new(),
            insertion_table: None,
        }
    }

    pub fn is_initial_query(&self) -> bool {
        self.client.query_kind == QueryKind::Initial
    }

    /// Whether the statement runs inside an explicit session transaction.
    pub fn in_interactive_transaction(&self) -> bool {
        self.explicit_transaction().is_some()
    }

    pub fn explicit_transaction(&self) -> Option<Arc<TransactionHandle>> {
        self.session
            .as_ref()
            .and_then(|session| session.explicit_transaction())
    }

    pub fn process_entry(&self) -> Option<Arc<dyn ProcessEntry>> {
        self.process_entry.as_ref().and_then(|entry| entry.upgrade())
    }

    /// Read all pending external tables.
    pub fn initialize_external_tables(&mut self) {
        let pending = std::mem::take(&mut self.pending_external_tables);
        self.external_tables.extend(pending);
    }
}
