use bytes::Bytes;
use futures::executor::block_on;
use querylife_core::config::OverflowMode;
use querylife_core::context::{ExecutionContext, NodeRole};
use querylife_core::coordinator::ExecuteOptions;
use querylife_core::result::Batch;
use querylife_core::statement::TableRef;
use querylife_core::testutil::TestHarness;
use querylife_error::ExecError;

fn numbers() -> TableRef {
    TableRef::new(Some("default"), "numbers")
}

fn harness() -> TestHarness {
    logutil::init_test();
    let h = TestHarness::new();
    h.engine.create_table(
        numbers(),
        vec![
            Batch::rows(2, Bytes::from_static(&[1, 2])),
            Batch::rows(1, Bytes::from_static(&[3])),
        ],
    );
    h
}

fn cached(h: &TestHarness) -> ExecutionContext {
    let mut ctx = h.context(NodeRole::Coordinator);
    ctx.settings.use_query_cache = true;
    ctx
}

fn total_rows(batches: &[Batch]) -> u64 {
    batches.iter().map(|b| b.num_rows).sum()
}

#[test]
fn second_run_served_from_cache() {
    let h = harness();

    let mut ctx = cached(&h);
    let first = h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(2, h.engine.source_reads());
    assert_eq!(1, h.cache.len());

    let mut ctx = cached(&h);
    let handle = h.execute(&mut ctx, "SELECT  *  FROM numbers").unwrap();
    assert!(handle.served_from_cache());
    let second = block_on(handle.collect()).unwrap();

    assert_eq!(total_rows(&first), total_rows(&second));
    // Partial results are squashed when stored.
    assert_eq!(1, second.len());
    assert_eq!(2, h.engine.source_reads());

    let logs = h.telemetry.terminal_logs();
    assert!(!logs[0].served_from_cache);
    assert!(logs[1].served_from_cache);
}

#[test]
fn write_to_source_invalidates() {
    let h = harness();

    let mut ctx = cached(&h);
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let mut ctx = h.context(NodeRole::Coordinator);
    h.execute(&mut ctx, "INSERT INTO numbers VALUES")
        .unwrap()
        .write_all(vec![Batch::rows(1, Bytes::from_static(&[4]))])
        .unwrap();

    let mut ctx = cached(&h);
    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(!handle.served_from_cache());
    let batches = block_on(handle.collect()).unwrap();
    assert_eq!(4, total_rows(&batches));
    assert_eq!(5, h.engine.source_reads());
}

#[test]
fn stale_results_without_transactional_cache() {
    let h = harness();

    let mut ctx = cached(&h);
    ctx.settings.enable_transactional_query_cache = false;
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    h.catalog.bump_update(&numbers());

    let mut ctx = cached(&h);
    ctx.settings.enable_transactional_query_cache = false;
    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(handle.served_from_cache());
}

#[test]
fn min_query_runs() {
    let h = harness();

    for expected in [0, 0, 1] {
        let mut ctx = cached(&h);
        ctx.settings.query_cache_min_query_runs = 2;
        ctx.settings.enable_reads_from_query_cache = false;
        h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
        assert_eq!(expected, h.cache.len());
    }
}

#[test]
fn min_query_duration() {
    let h = harness();

    let mut ctx = cached(&h);
    ctx.settings.query_cache_min_query_duration_ms = 60_000;
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(h.cache.is_empty());
}

#[test]
fn nondeterministic_results() {
    let h = harness();

    let mut ctx = cached(&h);
    h.query(&mut ctx, "SELECT now() FROM numbers").unwrap();
    assert!(h.cache.is_empty());

    let mut ctx = cached(&h);
    ctx.settings
        .query_cache_store_results_of_queries_with_nondeterministic_functions = true;
    h.query(&mut ctx, "SELECT now() FROM numbers").unwrap();
    assert_eq!(1, h.cache.len());
}

#[test]
fn entries_scoped_to_user() {
    let h = harness();

    let mut ctx = cached(&h);
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let mut ctx = cached(&h);
    ctx.client.user = "bob".to_string();
    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(!handle.served_from_cache());
    block_on(handle.collect()).unwrap();
    assert_eq!(2, h.cache.len());
}

#[test]
fn shared_entries() {
    let h = harness();

    let mut ctx = cached(&h);
    ctx.settings.query_cache_share_between_users = true;
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();

    let mut ctx = cached(&h);
    ctx.settings.query_cache_share_between_users = true;
    ctx.client.user = "bob".to_string();
    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(handle.served_from_cache());
}

#[test]
fn failed_query_not_cached() {
    let h = harness();
    h.engine
        .fail_next_stream(ExecError::Execution("disk read failed".to_string()));

    let mut ctx = cached(&h);
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap_err();
    assert!(h.cache.is_empty());
}

#[test]
fn explain_and_internal_not_cached() {
    let h = harness();

    let mut ctx = cached(&h);
    h.query(&mut ctx, "EXPLAIN SELECT * FROM numbers").unwrap();

    let mut ctx = cached(&h);
    let opts = ExecuteOptions {
        internal: true,
        ..Default::default()
    };
    let handle = h
        .execute_with(&mut ctx, "SELECT * FROM numbers", opts)
        .unwrap();
    block_on(handle.collect()).unwrap();

    assert!(h.cache.is_empty());
}

#[test]
fn reads_disabled() {
    let h = harness();

    for _ in 0..2 {
        let mut ctx = cached(&h);
        ctx.settings.enable_reads_from_query_cache = false;
        let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
        assert!(!handle.served_from_cache());
        block_on(handle.collect()).unwrap();
    }
    assert_eq!(4, h.engine.source_reads());
    assert_eq!(1, h.cache.len());
}

#[test]
fn writes_disabled() {
    let h = harness();

    let mut ctx = cached(&h);
    ctx.settings.enable_writes_to_query_cache = false;
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(h.cache.is_empty());
}

#[test]
fn break_limited_result_not_cached() {
    let h = harness();

    let mut ctx = cached(&h);
    ctx.settings.max_result_rows = 1;
    ctx.settings.result_overflow_mode = OverflowMode::Break;
    let truncated = h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(2, total_rows(&truncated));
    assert!(h.cache.is_empty());

    let mut ctx = cached(&h);
    let handle = h.execute(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert!(!handle.served_from_cache());
    let full = block_on(handle.collect()).unwrap();
    assert_eq!(3, total_rows(&full));
    assert_eq!(1, h.cache.len());
}

#[test]
fn throw_limited_result_still_cached() {
    let h = harness();

    let mut ctx = cached(&h);
    ctx.settings.max_result_rows = 10;
    h.query(&mut ctx, "SELECT * FROM numbers").unwrap();
    assert_eq!(1, h.cache.len());
}
