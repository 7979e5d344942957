use bytes::Bytes;
use querylife_core::context::NodeRole;
use querylife_core::interpreter::InterpreterCapabilities;
use querylife_core::result::Batch;
use querylife_core::statement::TableRef;
use querylife_core::telemetry::QueryLogType;
use querylife_core::testutil::{BuildRecord, TestHarness};
use querylife_error::ExecError;

fn harness(uses_optimizer: bool, uses_perfect_shard: bool) -> TestHarness {
    logutil::init_test();
    let h = TestHarness::new();
    h.engine.create_table(
        TableRef::new(Some("default"), "numbers"),
        vec![Batch::rows(2, Bytes::from_static(&[1, 2]))],
    );
    h.engine.set_capabilities(InterpreterCapabilities {
        uses_optimizer,
        uses_perfect_shard,
    });
    h
}

#[test]
fn optimizer_failure_without_fallback() {
    let h = harness(true, false);
    h.engine
        .fail_next_execute(ExecError::Optimizer("join reorder failed".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_optimizer_fallback = false;

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ExecError::Optimizer("join reorder failed".to_string()), err);
    assert_eq!(1, h.engine.builds().len());

    let log = &h.telemetry.terminal_logs()[0];
    assert_eq!(QueryLogType::ExceptionWhileProcessing, log.log_type);
    assert!(!log.fallback);
    assert!(h.txns.unfinished().is_empty());
}

#[test]
fn optimizer_fallback_retries_once() {
    let h = harness(true, false);
    h.engine
        .fail_next_execute(ExecError::Optimizer("join reorder failed".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);

    let batches = h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(2, batches[0].num_rows);

    assert_eq!(
        vec![
            BuildRecord {
                enable_optimizer: true,
                distributed_perfect_shard: false,
            },
            BuildRecord {
                enable_optimizer: false,
                distributed_perfect_shard: false,
            },
        ],
        h.engine.builds()
    );
    assert_eq!(2, h.engine.executions());
    assert!(!ctx.settings.enable_optimizer);

    let log = &h.telemetry.terminal_logs()[0];
    assert_eq!(QueryLogType::QueryFinish, log.log_type);
    assert!(log.fallback);
    // One transaction across both attempts.
    assert_eq!(1, h.txns.created().len());
}

#[test]
fn retry_failure_propagates() {
    let h = harness(true, false);
    h.engine
        .fail_next_execute(ExecError::Optimizer("join reorder failed".to_string()));
    h.engine
        .fail_next_execute(ExecError::Execution("out of memory".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ExecError::Execution("out of memory".to_string()), err);
    assert_eq!(2, h.engine.builds().len());

    let terminal = h.telemetry.terminal_logs();
    assert_eq!(1, terminal.len());
    assert!(terminal[0].fallback);
}

#[test]
fn perfect_shard_fallback() {
    let h = harness(false, true);
    h.engine
        .fail_next_execute(ExecError::PerfectShard("shard key mismatch".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_optimizer = false;
    ctx.settings.distributed_perfect_shard = true;

    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let builds = h.engine.builds();
    assert_eq!(2, builds.len());
    assert!(builds[0].distributed_perfect_shard);
    assert!(!builds[1].distributed_perfect_shard);
    assert!(h.telemetry.terminal_logs()[0].fallback);
}

#[test]
fn perfect_shard_fallback_disabled() {
    let h = harness(false, true);
    h.engine
        .fail_next_execute(ExecError::PerfectShard("shard key mismatch".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_optimizer = false;
    ctx.settings.distributed_perfect_shard = true;
    ctx.settings.fallback_perfect_shard = false;

    h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(1, h.engine.builds().len());
}

#[test]
fn optimizer_path_takes_precedence() {
    let h = harness(true, true);
    h.engine
        .fail_next_execute(ExecError::Optimizer("join reorder failed".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.enable_optimizer_fallback = false;
    ctx.settings.distributed_perfect_shard = true;

    let err = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(ExecError::Optimizer("join reorder failed".to_string()), err);
    assert_eq!(1, h.engine.builds().len());
}

#[test]
fn plain_failure_not_retried() {
    let h = harness(false, false);
    h.engine
        .fail_next_execute(ExecError::Execution("disk full".to_string()));
    let mut ctx = h.context(NodeRole::Coordinator);

    h.execute(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert_eq!(1, h.engine.builds().len());
    assert_eq!(1, h.engine.executions());
}
