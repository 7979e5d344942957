//! In-memory transaction manager, routing, catalog, admission and process
//! list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use querylife_error::{AdmissionRejection, ExecError, Result};

use crate::admission::{AdmissionOutcome, AdmissionQueue};
use crate::catalog::{Catalog, TableInfo};
use crate::config::SettingValue;
use crate::context::{ExecutionContext, ExecutionGroup};
use crate::process::{ProcessEntry, ProcessInfo, ProcessRegistry};
use crate::quota::{Quota, QuotaKind};
use crate::result::{Batch, Output};
use crate::routing::{Host, RemoteDispatcher, Router, ScopeSettings};
use crate::statement::{Statement, TableRef};
use crate::txn::{
    CreateTransactionOptions,
    Timestamp,
    TransactionHandle,
    TransactionManager,
    TransactionOrigin,
    TxnId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnEvent {
    Created(TxnId, CreateTransactionOptions),
    CreatedForHost(TxnId, Option<Host>),
    Committed(TxnId),
    Finished(TxnId),
}

/// Transaction manager recording every request it receives.
#[derive(Debug, Default)]
pub struct MemoryTransactionManager {
    next_id: AtomicU64,
    events: Mutex<Vec<TxnEvent>>,
    fail_create: AtomicBool,
    fail_commit: AtomicBool,
}

impl MemoryTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TxnEvent> {
        self.events.lock().clone()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Ids of all created transactions, in creation order.
    pub fn created(&self) -> Vec<TxnId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TxnEvent::Created(id, _) | TxnEvent::CreatedForHost(id, _) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn finish_count(&self, id: TxnId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == TxnEvent::Finished(id))
            .count()
    }

    pub fn commit_count(&self, id: TxnId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == TxnEvent::Committed(id))
            .count()
    }

    /// Created transactions that were neither finished nor committed.
    pub fn unfinished(&self) -> Vec<TxnId> {
        let created = self.created();
        let events = self.events.lock();
        created
            .into_iter()
            .filter(|id| {
                !events
                    .iter()
                    .any(|e| *e == TxnEvent::Finished(*id) || *e == TxnEvent::Committed(*id))
            })
            .collect()
    }

    fn next_id(&self) -> TxnId {
        TxnId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl TransactionManager for MemoryTransactionManager {
    fn create(&self, opts: CreateTransactionOptions) -> Result<Arc<TransactionHandle>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ExecError::TransactionConflict(
                "failed to create transaction".to_string(),
            ));
        }
        let id = self.next_id();
        let handle = Arc::new(TransactionHandle {
            id,
            read_only: opts.read_only,
            primary_id: opts.primary_id,
            origin: TransactionOrigin::Local,
        });
        self.events.lock().push(TxnEvent::Created(id, opts));
        Ok(handle)
    }

    fn create_for_host(&self, host: Option<&Host>) -> Result<Arc<TransactionHandle>> {
        let id = self.next_id();
        let handle = Arc::new(TransactionHandle {
            id,
            read_only: false,
            primary_id: None,
            origin: match host {
                Some(host) => TransactionOrigin::Remote(host.clone()),
                None => TransactionOrigin::Local,
            },
        });
        self.events
            .lock()
            .push(TxnEvent::CreatedForHost(id, host.cloned()));
        Ok(handle)
    }

    fn finish(&self, txn: &TransactionHandle) {
        self.events.lock().push(TxnEvent::Finished(txn.id));
    }

    fn commit(&self, txn: &TransactionHandle) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(ExecError::TransactionConflict(format!(
                "failed to commit transaction {}",
                txn.id
            )));
        }
        self.events.lock().push(TxnEvent::Committed(txn.id));
        Ok(())
    }
}

/// Router returning a fixed host and execution group.
#[derive(Debug, Default)]
pub struct StaticRouter {
    host: Mutex<Option<Host>>,
    group: Mutex<Option<ExecutionGroup>>,
    resolves: AtomicU64,
    fail: AtomicBool,
}

impl StaticRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_to(&self, host: Option<Host>) {
        *self.host.lock() = host;
    }

    pub fn assign_group(&self, group: Option<ExecutionGroup>) {
        *self.group.lock() = group;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn resolves(&self) -> u64 {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl Router for StaticRouter {
    fn resolve(&self, _stmt: &Statement, _ctx: &ExecutionContext) -> Result<Option<Host>> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExecError::Routing("topology unavailable".to_string()));
        }
        Ok(self.host.lock().clone())
    }

    fn resolve_execution_group(
        &self,
        _stmt: &Statement,
        _ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionGroup>> {
        Ok(self.group.lock().clone())
    }
}

/// Dispatcher answering every forwarded statement with a single row.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<(Host, String)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<(Host, String)> {
        self.dispatched.lock().clone()
    }
}

impl RemoteDispatcher for RecordingDispatcher {
    fn execute_remote(
        &self,
        host: &Host,
        stmt: &Statement,
        _ctx: &ExecutionContext,
    ) -> Result<Output> {
        self.dispatched
            .lock()
            .push((host.clone(), stmt.text.clone()));
        let batch = Batch::rows(1, Bytes::from(host.rpc_address.clone().into_bytes()));
        Ok(Output::Pull(Box::pin(futures::stream::iter([Ok(batch)]))))
    }
}

#[derive(Debug, Default)]
pub struct StaticScopeSettings {
    overrides: Mutex<Vec<(String, SettingValue)>>,
}

impl StaticScopeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_overrides(&self, overrides: Vec<(String, SettingValue)>) {
        *self.overrides.lock() = overrides;
    }
}

impl ScopeSettings for StaticScopeSettings {
    fn overrides_for(
        &self,
        _stmt: &Statement,
        _ctx: &ExecutionContext,
    ) -> Option<Vec<(String, SettingValue)>> {
        let overrides = self.overrides.lock();
        if overrides.is_empty() {
            None
        } else {
            Some(overrides.clone())
        }
    }
}

/// Catalog with a logical clock for table update times.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: DashMap<TableRef, (TableInfo, Timestamp)>,
    clock: AtomicU64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, table: TableRef, transactional: bool, owner: Option<Host>) {
        let now = self.tick();
        let info = TableInfo {
            table: table.clone(),
            transactional,
            owner,
        };
        self.tables.insert(table, (info, now));
    }

    /// Record a write to the table, returning its new update time.
    pub fn bump_update(&self, table: &TableRef) -> Timestamp {
        let now = self.tick();
        if let Some(mut entry) = self.tables.get_mut(table) {
            entry.1 = now;
        }
        now
    }

    fn tick(&self) -> Timestamp {
        Timestamp(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Catalog for MemoryCatalog {
    fn table_info(&self, table: &TableRef) -> Result<Option<TableInfo>> {
        Ok(self.tables.get(table).map(|entry| entry.0.clone()))
    }

    fn last_update_time(&self, table: &TableRef) -> Result<Timestamp> {
        Ok(self
            .tables
            .get(table)
            .map(|entry| entry.1)
            .unwrap_or(Timestamp::ZERO))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub query_id: String,
    pub group: ExecutionGroup,
    pub timeout: Duration,
}

/// Admission queue admitting everything unless told otherwise.
#[derive(Debug, Default)]
pub struct MemoryAdmissionQueue {
    enqueued: Mutex<Vec<Enqueued>>,
    reject: Mutex<Option<AdmissionRejection>>,
    reassign: Mutex<Option<ExecutionGroup>>,
}

impl MemoryAdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_with(&self, rejection: Option<AdmissionRejection>) {
        *self.reject.lock() = rejection;
    }

    pub fn reassign_to(&self, group: Option<ExecutionGroup>) {
        *self.reassign.lock() = group;
    }

    pub fn enqueued(&self) -> Vec<Enqueued> {
        self.enqueued.lock().clone()
    }
}

impl AdmissionQueue for MemoryAdmissionQueue {
    fn enqueue(
        &self,
        query_id: &str,
        group: &ExecutionGroup,
        timeout: Duration,
    ) -> Result<AdmissionOutcome> {
        self.enqueued.lock().push(Enqueued {
            query_id: query_id.to_string(),
            group: group.clone(),
            timeout,
        });
        if let Some(rejection) = *self.reject.lock() {
            return Ok(AdmissionOutcome::Rejected(rejection));
        }
        Ok(AdmissionOutcome::Admitted {
            group: self.reassign.lock().clone(),
        })
    }
}

#[derive(Debug)]
pub struct TestProcessEntry {
    started: Instant,
    cancelled: AtomicBool,
}

impl TestProcessEntry {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl ProcessEntry for TestProcessEntry {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn info(&self) -> ProcessInfo {
        ProcessInfo {
            elapsed: self.started.elapsed(),
            ..Default::default()
        }
    }
}

/// Process list holding weak references to its entries.
#[derive(Debug, Default)]
pub struct MemoryProcessRegistry {
    entries: Mutex<Vec<(String, Weak<TestProcessEntry>)>>,
    cancel_next: AtomicBool,
}

impl MemoryProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the next inserted entry as killed before it runs.
    pub fn cancel_next(&self) {
        self.cancel_next.store(true, Ordering::SeqCst);
    }

    /// Query texts of every entry ever inserted.
    pub fn inserted(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    /// Number of entries still referenced by a running query.
    pub fn live(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.strong_count() > 0)
            .count()
    }
}

impl ProcessRegistry for MemoryProcessRegistry {
    fn insert(
        &self,
        query_text: &str,
        _stmt: &Statement,
        _ctx: &ExecutionContext,
    ) -> Result<Arc<dyn ProcessEntry>> {
        let entry = Arc::new(TestProcessEntry {
            started: Instant::now(),
            cancelled: AtomicBool::new(self.cancel_next.swap(false, Ordering::SeqCst)),
        });
        self.entries
            .lock()
            .push((query_text.to_string(), Arc::downgrade(&entry)));
        Ok(entry)
    }
}

/// Quota counting every charge, failing once a limit is passed.
#[derive(Debug, Default)]
pub struct CountingQuota {
    used: DashMap<QuotaKind, u64>,
    limits: HashMap<QuotaKind, u64>,
}

impl CountingQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, kind: QuotaKind, limit: u64) -> Self {
        self.limits.insert(kind, limit);
        self
    }

    pub fn used_of(&self, kind: QuotaKind) -> u64 {
        self.used.get(&kind).map(|v| *v).unwrap_or(0)
    }

    fn exceeded(&self, kind: QuotaKind, used: u64) -> Result<()> {
        match self.limits.get(&kind) {
            Some(limit) if used > *limit => Err(ExecError::QuotaExceeded(format!(
                "{} {used} > {limit}",
                kind.as_str()
            ))),
            _ => Ok(()),
        }
    }
}

impl Quota for CountingQuota {
    fn used(&self, kind: QuotaKind, amount: u64, check_exceeded: bool) -> Result<()> {
        let total = {
            let mut used = self.used.entry(kind).or_insert(0);
            *used += amount;
            *used
        };
        if check_exceeded {
            self.exceeded(kind, total)?;
        }
        Ok(())
    }

    fn check_exceeded(&self, kind: QuotaKind) -> Result<()> {
        self.exceeded(kind, self.used_of(kind))
    }
}
