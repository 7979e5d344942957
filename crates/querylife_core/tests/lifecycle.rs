use bytes::Bytes;
use futures::StreamExt;
use futures::executor::block_on;
use querylife_core::config::OverflowMode;
use querylife_core::context::{ExecutionGroup, NodeRole, SessionContext, TraceContext};
use querylife_core::coordinator::ExecuteOptions;
use querylife_core::finalize::Outcome;
use querylife_core::interpreter::ProcessingStage;
use querylife_core::quota::QuotaKind;
use querylife_core::result::{Batch, Output};
use querylife_core::statement::TableRef;
use querylife_core::telemetry::{AsyncQueryStatus, ProfileEvent, QueryLogType};
use querylife_core::testutil::{CountingQuota, TestHarness, TxnEvent};
use querylife_core::txn::{CreateTransactionOptions, TransactionManager};
use querylife_error::{AdmissionRejection, ErrorCode, ExecError};
use std::sync::Arc;

fn numbers() -> TableRef {
    TableRef::new(Some("default"), "numbers")
}

fn seeded() -> TestHarness {
    logutil::init_test();
    let h = TestHarness::new();
    h.engine.create_table(
        numbers(),
        vec![
            Batch::rows(2, Bytes::from_static(&[1, 2])),
            Batch::rows(2, Bytes::from_static(&[3, 4])),
        ],
    );
    h
}

fn total_rows(batches: &[Batch]) -> u64 {
    batches.iter().map(|b| b.num_rows).sum()
}

#[test]
fn select_finishes_once() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    let pair = handle.finalization().unwrap().clone();
    assert!(!pair.is_fired());

    let batches = block_on(handle.collect()).unwrap();
    assert_eq!(4, total_rows(&batches));
    assert_eq!(Some(Outcome::Finished), pair.outcome());

    assert_eq!(
        vec![QueryLogType::QueryStart, QueryLogType::QueryFinish],
        h.telemetry.log_types()
    );
    let finish = &h.telemetry.terminal_logs()[0];
    assert_eq!(4, finish.result_rows);
    assert_eq!(4, finish.result_bytes);
    assert_eq!("Select", finish.query_kind);

    let created = h.txns.created();
    assert_eq!(1, created.len());
    assert_eq!(1, h.txns.finish_count(created[0]));
    assert!(h.txns.unfinished().is_empty());
    assert_eq!(vec![ctx.client.query_id.clone()], h.distributed.cancelled());
}

#[test]
fn read_only_transaction_for_select() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.force_clean_transaction_by_dm = true;

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let events = h.txns.events();
    assert_eq!(
        TxnEvent::Created(
            h.txns.created()[0],
            CreateTransactionOptions {
                read_only: true,
                force_clean_by_dm: true,
                async_post_commit: false,
                primary_id: None,
            }
        ),
        events[0]
    );
}

#[test]
fn build_failure_completes_transaction() {
    let h = seeded();
    h.engine
        .fail_next_build(ExecError::Execution("no such function".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ExecError::Execution("no such function".to_string()), err);

    let created = h.txns.created();
    assert_eq!(1, created.len());
    assert_eq!(1, h.txns.finish_count(created[0]));
    assert_eq!(
        vec![QueryLogType::ExceptionWhileProcessing],
        h.telemetry.log_types()
    );
    assert_eq!(1, h.quota.used_of(QuotaKind::Errors));
    assert_eq!(1, h.telemetry.profile_count(ProfileEvent::FailedQuery));
    assert_eq!(1, h.telemetry.profile_count(ProfileEvent::FailedSelectQuery));
}

#[test]
fn mid_stream_failure_completes_transaction() {
    let h = seeded();
    h.engine
        .fail_next_stream(ExecError::Execution("disk read failed".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);

    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    let pair = handle.finalization().unwrap().clone();
    let created = h.txns.created();
    assert_eq!(0, h.txns.finish_count(created[0]));

    let err = block_on(handle.collect()).unwrap_err();
    assert_eq!(ExecError::Execution("disk read failed".to_string()), err);
    assert_eq!(Some(Outcome::ExceptionWhileProcessing), pair.outcome());
    assert_eq!(1, h.txns.finish_count(created[0]));

    let terminal = h.telemetry.terminal_logs();
    assert_eq!(1, terminal.len());
    assert_eq!(QueryLogType::ExceptionWhileProcessing, terminal[0].log_type);
    assert_eq!(ErrorCode::EXECUTION_FAILURE.0, terminal[0].exception_code);
    assert_eq!(2, terminal[0].result_rows);
}

#[test]
fn parse_failure_before_start() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let err = h.execute(&mut ctx, "FROBNICATE numbers").unwrap_err();
    assert!(matches!(err, ExecError::Parse(_)));

    assert!(h.txns.created().is_empty());
    assert_eq!(
        vec![QueryLogType::ExceptionBeforeStart],
        h.telemetry.log_types()
    );
    let log = &h.telemetry.query_logs()[0];
    assert_eq!(ErrorCode::SYNTAX_ERROR.0, log.exception_code);
    assert_eq!("FROBNICATE numbers", log.query);
    assert_eq!(1, h.quota.used_of(QuotaKind::Errors));
    assert_eq!(0, h.quota.used_of(QuotaKind::Queries));
    assert_eq!(vec![ctx.client.query_id.clone()], h.distributed.cancelled());
}

#[test]
fn ast_limits_checked_after_parse() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_ast_elements = 2;

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ErrorCode::TOO_BIG_AST, err.code());
}

#[test]
fn internal_statements_skip_size_limit() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_query_size = 8;

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ErrorCode::QUERY_IS_TOO_LARGE, err.code());

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_query_size = 8;
    let opts = ExecuteOptions {
        internal: true,
        ..Default::default()
    };
    let handle = h
        .execute_with(&mut ctx, "SELECT * FROM numbers", opts)
        .unwrap();
    block_on(handle.collect()).unwrap();
}

#[test]
fn before_start_failure_not_logged_for_internal() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    let opts = ExecuteOptions {
        internal: true,
        ..Default::default()
    };

    h.execute_with(&mut ctx, "FROBNICATE", opts).unwrap_err();
    assert!(h.telemetry.query_logs().is_empty());
    assert_eq!(0, h.quota.used_of(QuotaKind::Errors));
}

#[test]
fn internal_statements() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    let opts = ExecuteOptions {
        internal: true,
        ..Default::default()
    };

    let handle = h
        .execute_with(&mut ctx, "SELECT * FROM numbers", opts.clone())
        .unwrap();
    block_on(handle.collect()).unwrap();

    // Internal statements run without the optimizer, quota, process entry or
    // success records.
    assert!(!h.engine.builds()[0].enable_optimizer);
    assert_eq!(0, h.quota.used_of(QuotaKind::Queries));
    assert!(h.processes.inserted().is_empty());
    assert!(h.telemetry.query_logs().is_empty());
    assert!(ctx.client.initial_query_start_time.is_none());

    // Failures while processing are still logged.
    h.engine
        .fail_next_stream(ExecError::Execution("boom".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);
    let handle = h
        .execute_with(&mut ctx, "SELECT * FROM numbers", opts)
        .unwrap();
    block_on(handle.collect()).unwrap_err();
    let logs = h.telemetry.query_logs();
    assert_eq!(1, logs.len());
    assert!(logs[0].is_internal);
    assert_eq!(QueryLogType::ExceptionWhileProcessing, logs[0].log_type);
}

#[test]
fn quota_charged_before_execution() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(1, h.quota.used_of(QuotaKind::Queries));
    assert_eq!(1, h.quota.used_of(QuotaKind::QuerySelects));
    assert_eq!(0, h.quota.used_of(QuotaKind::QueryInserts));
    assert_eq!(4, h.quota.used_of(QuotaKind::ResultRows));
}

#[test]
fn quota_exceeded_fails_statement() {
    logutil::init_test();
    let h = TestHarness::with_quota(CountingQuota::new().with_limit(QuotaKind::Queries, 1));
    let mut ctx = h.context(NodeRole::Coordinator);
    h.query(&mut ctx, "SELECT 1").unwrap();

    let mut ctx = h.context(NodeRole::Coordinator);
    let err = h.execute(&mut ctx, "SELECT 1").unwrap_err();
    assert!(matches!(err, ExecError::QuotaExceeded(_)));
    assert_eq!(1, h.engine.executions());
    assert!(h.txns.unfinished().is_empty());
}

#[test]
fn cancelled_before_execution() {
    let h = seeded();
    h.processes.cancel_next();
    let mut ctx = h.context(NodeRole::Coordinator);

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(
        ExecError::Cancelled {
            query_id: ctx.client.query_id.clone()
        },
        err
    );
    assert_eq!(0, h.engine.executions());
    assert_eq!(0, h.processes.live());
    assert!(h.txns.unfinished().is_empty());
    assert_eq!(
        vec![QueryLogType::ExceptionWhileProcessing],
        h.telemetry.log_types()
    );
}

#[test]
fn process_entry_lives_with_result() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(vec!["SELECT * FROM numbers".to_string()], h.processes.inserted());
    assert!(ctx.process_entry().is_some());

    block_on(handle.collect()).unwrap();
    assert_eq!(0, h.processes.live());
}

#[test]
fn introspection_not_registered() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    h.query(&mut ctx, "SHOW PROCESSLIST").unwrap();
    assert!(h.processes.inserted().is_empty());
}

#[test]
fn insert_pushes_and_finishes() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let handle = h.execute(&mut ctx, "INSERT INTO numbers VALUES").unwrap();
    assert_eq!("push", handle.output_kind());
    assert_eq!(Some(numbers()), ctx.insertion_table);

    let pair = handle.finalization().unwrap().clone();
    handle
        .write_all(vec![Batch::rows(1, Bytes::from_static(&[5]))])
        .unwrap();

    assert_eq!(Some(Outcome::Finished), pair.outcome());
    assert_eq!(5, h.engine.table_rows(&numbers()));
    assert_eq!(1, h.quota.used_of(QuotaKind::QueryInserts));
    assert!(h.txns.unfinished().is_empty());
}

#[test]
fn dropped_push_result_fails() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let handle = h.execute(&mut ctx, "INSERT INTO numbers VALUES").unwrap();
    let pair = handle.finalization().unwrap().clone();
    drop(handle);

    assert_eq!(Some(Outcome::ExceptionWhileProcessing), pair.outcome());
    assert!(h.txns.unfinished().is_empty());
    assert_eq!(1, h.telemetry.profile_count(ProfileEvent::FailedInsertQuery));
}

#[test]
fn partially_read_stream_dropped() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let mut handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    let pair = handle.finalization().unwrap().clone();
    let Output::Pull(mut stream) = handle.take_output() else {
        panic!("expected pull output");
    };
    block_on(stream.next()).unwrap().unwrap();
    assert!(!pair.is_fired());

    drop(stream);
    drop(handle);
    assert_eq!(Some(Outcome::ExceptionWhileProcessing), pair.outcome());
    assert_eq!(1, h.telemetry.terminal_logs().len());
}

#[test]
fn empty_output_finished_by_driver() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let handle = h.execute(&mut ctx, "CREATE TABLE t (a UInt64)").unwrap();
    assert_eq!("empty", handle.output_kind());
    let pair = handle.finalization().unwrap().clone();

    handle.finish();
    handle.finish();
    drop(handle);

    assert_eq!(Some(Outcome::Finished), pair.outcome());
    assert_eq!(1, h.telemetry.terminal_logs().len());
}

#[test]
fn driver_reported_failure() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let handle = h.execute(&mut ctx, "CREATE TABLE t (a UInt64)").unwrap();
    let err = handle.fail(ExecError::Execution("storage unavailable".to_string()));
    assert_eq!(ErrorCode::EXECUTION_FAILURE, err.code());

    handle.finish();
    assert_eq!(
        vec![QueryLogType::ExceptionWhileProcessing],
        h.telemetry
            .terminal_logs()
            .iter()
            .map(|l| l.log_type)
            .collect::<Vec<_>>()
    );
}

#[test]
fn result_rows_limit_throws() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_result_rows = 3;

    let err = h.query(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ErrorCode::TOO_MANY_ROWS_OR_BYTES, err.code());
    assert_eq!(
        QueryLogType::ExceptionWhileProcessing,
        h.telemetry.terminal_logs()[0].log_type
    );
}

#[test]
fn result_rows_limit_breaks() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_result_rows = 1;
    ctx.settings.result_overflow_mode = OverflowMode::Break;

    let batches = h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(1, batches.len());
    assert_eq!(
        QueryLogType::QueryFinish,
        h.telemetry.terminal_logs()[0].log_type
    );
}

#[test]
fn limits_only_on_complete_stage() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_result_rows = 1;
    let opts = ExecuteOptions {
        stage: ProcessingStage::WithMergeableState,
        ..Default::default()
    };

    let handle = h
        .execute_with(&mut ctx, "SELECT * FROM numbers", opts)
        .unwrap();
    let batches = block_on(handle.collect()).unwrap();
    assert_eq!(4, total_rows(&batches));

    h.engine.set_ignore_limits(true);
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_result_rows = 1;
    let batches = h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(4, total_rows(&batches));
}

#[test]
fn telemetry_failure_does_not_block_finalization() {
    let h = seeded();
    h.telemetry.set_fail_writes(true);
    let mut ctx = h.context(NodeRole::Coordinator);

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(h.txns.unfinished().is_empty());
    assert_eq!(1, h.distributed.cancelled().len());
}

#[test]
fn log_filtering() {
    let h = seeded();

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.log_queries = false;
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(h.telemetry.query_logs().is_empty());

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.log_queries_min_type = QueryLogType::ExceptionBeforeStart;
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(h.telemetry.query_logs().is_empty());

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.log_queries_min_query_duration_ms = 60_000;
    h.execute(&mut ctx, "FROBNICATE").unwrap_err();
    assert!(h.telemetry.query_logs().is_empty());
}

#[test]
fn log_comment_and_settings_clause() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    h.query(
        &mut ctx,
        "SELECT * FROM numbers SETTINGS log_comment = 'nightly', enable_optimizer = 0",
    )
    .unwrap();

    assert!(!ctx.settings.enable_optimizer);
    assert!(!h.engine.builds()[0].enable_optimizer);
    assert_eq!("nightly", h.telemetry.terminal_logs()[0].log_comment);
}

#[test]
fn invalid_settings_clause_fails_before_start() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    let err = h
        .execute(&mut ctx, "SELECT * FROM numbers SETTINGS no_such_setting = 1")
        .unwrap_err();
    assert_eq!(ErrorCode::UNKNOWN_SETTING, err.code());
    assert_eq!(
        vec![QueryLogType::ExceptionBeforeStart],
        h.telemetry.log_types()
    );
    assert!(h.txns.created().is_empty());
}

#[test]
fn distributed_stages_enable_optimizer() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_optimizer = false;
    ctx.settings.enable_distributed_stages = true;

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(ctx.settings.enable_optimizer);
    assert!(!ctx.settings.enable_distributed_stages);
}

#[test]
fn async_status_updated() {
    let h = seeded();

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.async_query_id = Some("async-ok".to_string());
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(
        Some(AsyncQueryStatus::Finished),
        h.async_status.get("async-ok")
    );

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.async_query_id = Some("async-err".to_string());
    h.execute(&mut ctx, "FROBNICATE").unwrap_err();
    assert!(matches!(
        h.async_status.get("async-err"),
        Some(AsyncQueryStatus::Failed { .. })
    ));
}

#[test]
fn spans_follow_trace_context() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.client.trace = Some(TraceContext {
        trace_id: uuid::Uuid::new_v4(),
        span_id: 7,
        parent_span_id: 3,
        trace_state: None,
        trace_flags: 1,
    });

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let spans = h.telemetry.spans();
    assert_eq!(1, spans.len());
    assert_eq!(3, spans[0].parent_span_id);
    assert_eq!(Some("QueryFinish"), spans[0].attribute("query_status"));
    assert_eq!(
        Some(ctx.client.query_id.as_str()),
        spans[0].attribute("query_id")
    );
    assert_eq!(None, spans[0].attribute("tracestate"));
}

#[test]
fn initial_query_start_time_recorded() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    assert!(ctx.client.initial_query_start_time.is_none());

    h.query(&mut ctx, "SELECT 1").unwrap();
    assert!(ctx.client.initial_query_start_time.is_some());
}

#[test]
fn admission_rejection_fails_before_start() {
    let h = seeded();
    h.router
        .assign_group(Some(ExecutionGroup::new("wh", "wg-1")));
    h.admission.reject_with(Some(AdmissionRejection::Timeout));
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_query_queue = true;
    ctx.settings.query_queue_timeout_ms = 250;

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ErrorCode::QUEUE_QUERY_FAILURE, err.code());

    let enqueued = h.admission.enqueued();
    assert_eq!(1, enqueued.len());
    assert_eq!(std::time::Duration::from_millis(250), enqueued[0].timeout);
    assert_eq!(0, h.engine.builds().len());
    assert!(h.txns.unfinished().is_empty());
    assert_eq!(
        vec![QueryLogType::ExceptionBeforeStart],
        h.telemetry.log_types()
    );
}

#[test]
fn admission_may_reassign_group() {
    let h = seeded();
    h.router
        .assign_group(Some(ExecutionGroup::new("wh", "wg-1")));
    h.admission
        .reassign_to(Some(ExecutionGroup::new("wh", "wg-2")));
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_query_queue = true;

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(Some(ExecutionGroup::new("wh", "wg-2")), ctx.execution_group);
}

#[test]
fn admission_skipped_when_ineligible() {
    let h = seeded();
    h.router
        .assign_group(Some(ExecutionGroup::new("wh", "wg-1")));
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_query_queue = true;
    h.query(&mut ctx, "SHOW PROCESSLIST").unwrap();

    let mut ctx = h.context(NodeRole::Coordinator);
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_query_queue = true;
    let handle = h.execute(&mut ctx, "CREATE TABLE t (a UInt64)").unwrap();
    handle.finish();

    assert!(h.admission.enqueued().is_empty());
}

#[test]
fn implicit_commit_before_ddl() {
    let h = seeded();
    let session = Arc::new(SessionContext::new());
    let explicit = h.txns.create(CreateTransactionOptions::default()).unwrap();
    session.begin(explicit.clone());

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.session = Some(session.clone());
    let handle = h.execute(&mut ctx, "CREATE TABLE t (a UInt64)").unwrap();
    handle.finish();

    assert!(session.explicit_transaction().is_none());
    let events = h.txns.events();
    let commit = events
        .iter()
        .position(|e| *e == TxnEvent::Committed(explicit.id))
        .unwrap();
    let ddl_txn = events
        .iter()
        .rposition(|e| matches!(e, TxnEvent::Created(..)))
        .unwrap();
    assert!(commit < ddl_txn);

    // The DDL's own transaction is no longer nested in the session.
    let TxnEvent::Created(_, opts) = &events[ddl_txn] else {
        unreachable!()
    };
    assert_eq!(None, opts.primary_id);
}

#[test]
fn failed_implicit_commit_finishes_session_transaction() {
    let h = seeded();
    let session = Arc::new(SessionContext::new());
    let explicit = h.txns.create(CreateTransactionOptions::default()).unwrap();
    session.begin(explicit.clone());
    h.txns.set_fail_commit(true);

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.session = Some(session.clone());
    let err = h.execute(&mut ctx, "CREATE TABLE t (a UInt64)").unwrap_err();
    assert_eq!(ErrorCode::TRANSACTION_CONFLICT, err.code());

    assert!(session.explicit_transaction().is_none());
    assert_eq!(0, h.txns.commit_count(explicit.id));
    assert_eq!(1, h.txns.finish_count(explicit.id));
    assert!(h.txns.unfinished().is_empty());
    assert_eq!(0, h.engine.builds().len());
    assert_eq!(
        vec![QueryLogType::ExceptionBeforeStart],
        h.telemetry.log_types()
    );
}

#[test]
fn data_manipulating_alter_keeps_session_transaction() {
    let h = seeded();
    let session = Arc::new(SessionContext::new());
    let explicit = h.txns.create(CreateTransactionOptions::default()).unwrap();
    session.begin(explicit.clone());

    for text in [
        "ALTER TABLE numbers ATTACH PARTS FROM DETACHED",
        "ALTER TABLE numbers DROP PARTITION 2024",
    ] {
        let mut ctx = h.context(NodeRole::Coordinator);
        ctx.session = Some(session.clone());
        let handle = h.execute(&mut ctx, text).unwrap();
        handle.finish();
    }

    assert_eq!(0, h.txns.commit_count(explicit.id));
    assert_eq!(Some(explicit.id), session.explicit_transaction().map(|t| t.id));
    assert_eq!(2, session.statements().len());
}

#[test]
fn statements_nested_in_session_transaction() {
    let h = seeded();
    let session = Arc::new(SessionContext::new());
    let explicit = h.txns.create(CreateTransactionOptions::default()).unwrap();
    session.begin(explicit.clone());

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.session = Some(session.clone());
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.session = Some(session.clone());
    h.execute(&mut ctx, "INSERT INTO numbers VALUES")
        .unwrap()
        .write_all(Vec::new())
        .unwrap();

    // Only the non read-only statement is recorded in the session.
    assert_eq!(
        vec!["INSERT INTO numbers VALUES".to_string()],
        session.statements()
    );
    let nested: Vec<_> = h
        .txns
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TxnEvent::Created(_, opts) => opts.primary_id,
            _ => None,
        })
        .collect();
    assert_eq!(vec![explicit.id, explicit.id], nested);
}

#[test]
fn worker_binds_insert_to_owner() {
    let h = seeded();
    let owner = querylife_core::routing::Host::new("10.0.0.9:8124", "10.0.0.9:9000");
    let events = TableRef::new(Some("default"), "events");
    h.catalog.add_table(events.clone(), true, Some(owner.clone()));

    let mut ctx = h.context(NodeRole::Worker);
    h.execute(&mut ctx, "INSERT INTO events VALUES")
        .unwrap()
        .write_all(Vec::new())
        .unwrap();

    let created = h.txns.events();
    assert!(matches!(
        &created[0],
        TxnEvent::CreatedForHost(_, Some(host)) if *host == owner
    ));
    assert!(h.txns.unfinished().is_empty());
}

#[test]
fn worker_without_transaction() {
    let h = seeded();
    h.catalog
        .add_table(TableRef::new(Some("default"), "plain"), false, None);

    let mut ctx = h.context(NodeRole::Worker);
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let mut ctx = h.context(NodeRole::Worker);
    h.execute(&mut ctx, "INSERT INTO plain VALUES")
        .unwrap()
        .write_all(Vec::new())
        .unwrap();

    let mut ctx = h.context(NodeRole::Standalone);
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    assert!(h.txns.events().is_empty());
}

#[test]
fn caller_bound_transaction_left_to_caller() {
    let h = seeded();
    let bound = h.txns.create(CreateTransactionOptions::default()).unwrap();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.transaction = Some(bound.clone());

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(1, h.txns.created().len());
    assert_eq!(0, h.txns.finish_count(bound.id));
}

#[test]
fn transaction_conflict_before_start() {
    let h = seeded();
    h.txns.set_fail_create(true);
    let mut ctx = h.context(NodeRole::Coordinator);

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ErrorCode::TRANSACTION_CONFLICT, err.code());
    assert!(ctx.transaction.is_none());
    assert_eq!(0, h.engine.builds().len());
    assert_eq!(
        vec![QueryLogType::ExceptionBeforeStart],
        h.telemetry.log_types()
    );
}

#[test]
fn session_statement_recorded_after_transaction_created() {
    let h = seeded();
    let session = Arc::new(SessionContext::new());
    let explicit = h.txns.create(CreateTransactionOptions::default()).unwrap();
    session.begin(explicit);
    h.txns.set_fail_create(true);

    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.session = Some(session.clone());
    let err = h.execute(&mut ctx, "INSERT INTO numbers VALUES").unwrap_err();
    assert_eq!(ErrorCode::TRANSACTION_CONFLICT, err.code());
    assert!(session.statements().is_empty());

    h.txns.set_fail_create(false);
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.session = Some(session.clone());
    h.execute(&mut ctx, "INSERT INTO numbers VALUES")
        .unwrap()
        .write_all(Vec::new())
        .unwrap();
    assert_eq!(
        vec!["INSERT INTO numbers VALUES".to_string()],
        session.statements()
    );
}

#[test]
fn inline_insert_data_not_logged() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    h.execute(&mut ctx, "INSERT INTO numbers VALUES (7), (8)")
        .unwrap()
        .write_all(Vec::new())
        .unwrap();

    let logs = h.telemetry.query_logs();
    assert!(logs.iter().all(|l| l.query == "INSERT INTO numbers VALUES"));
    assert_eq!(
        vec!["INSERT INTO numbers VALUES".to_string()],
        h.processes.inserted()
    );
}

#[test]
fn statement_settings_cut_logged_query() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);

    h.query(
        &mut ctx,
        "SELECT * FROM numbers SETTINGS log_queries_cut_to_length = 8",
    )
    .unwrap();

    let log = &h.telemetry.terminal_logs()[0];
    assert_eq!("SELECT *", log.query);
}

#[test]
fn parse_failure_logs_query_prefix() {
    let h = seeded();
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.max_query_size = 10;

    h.execute(&mut ctx, "FROBNICATE numbers").unwrap_err();

    let log = &h.telemetry.query_logs()[0];
    assert_eq!(QueryLogType::ExceptionBeforeStart, log.log_type);
    assert_eq!("FROBNICATE", log.query);
}
